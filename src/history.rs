// =============================================================================
// Historical candle fetch — REST collaborator that seeds chart series
// =============================================================================
//
// The feed does not own historical data. Before live ticks arrive, each chart
// series is seeded with closed candles from this endpoint; a failure here is
// never fatal to the stream.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::market_data::Candle;
use crate::types::Timeframe;

/// Source of closed historical candles for one (instrument, timeframe) pair.
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Fetch up to `limit` closed candles, ordered oldest first.
    async fn fetch_candles(
        &self,
        instrument: &str,
        timeframe: &Timeframe,
        limit: u16,
    ) -> Result<Vec<Candle>>;
}

// =============================================================================
// REST implementation
// =============================================================================

/// Wire shape of one candle from the history endpoint.
#[derive(Debug, Deserialize)]
struct CandleWire {
    open_time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

impl From<CandleWire> for Candle {
    fn from(wire: CandleWire) -> Self {
        Self {
            open_time: wire.open_time,
            open: wire.open,
            high: wire.high,
            low: wire.low,
            close: wire.close,
            volume: wire.volume,
        }
    }
}

/// Sort oldest-first and drop duplicate buckets so the aggregator can trust
/// its seed.
fn normalize_candles(wire: Vec<CandleWire>) -> Vec<Candle> {
    let mut candles: Vec<Candle> = wire.into_iter().map(Candle::from).collect();
    candles.sort_unstable_by_key(|c| c.open_time);
    candles.dedup_by_key(|c| c.open_time);
    candles
}

pub struct RestHistoryProvider {
    client: reqwest::Client,
    base_url: String,
}

impl RestHistoryProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn candles_endpoint(&self, instrument: &str, timeframe: &Timeframe, limit: u16) -> String {
        format!(
            "{}/api/v1/candles?instrument={}&timeframe={}&limit={limit}",
            self.base_url.trim_end_matches('/'),
            instrument,
            timeframe.code
        )
    }
}

#[async_trait]
impl HistoryProvider for RestHistoryProvider {
    async fn fetch_candles(
        &self,
        instrument: &str,
        timeframe: &Timeframe,
        limit: u16,
    ) -> Result<Vec<Candle>> {
        let endpoint = self.candles_endpoint(instrument, timeframe, limit);
        let response = self
            .client
            .get(&endpoint)
            .send()
            .await
            .with_context(|| format!("history request failed: {endpoint}"))?
            .error_for_status()
            .context("history endpoint returned an error status")?;

        let payload = response
            .json::<Vec<CandleWire>>()
            .await
            .context("failed to parse history payload")?;

        Ok(normalize_candles(payload))
    }
}
