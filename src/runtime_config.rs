// =============================================================================
// Runtime Configuration — feed settings with atomic save
// =============================================================================
//
// Every tunable of the feed engine lives here: connection endpoints, the
// heartbeat and reconnect policy, and the timeframe-to-bucket-seconds mapping
// the candle aggregator works from. Nothing in the aggregation algorithm
// hard-codes an interval.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry serde defaults so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::Timeframe;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_feed_url() -> String {
    "ws://127.0.0.1:8090/api/v1/stream".to_string()
}

fn default_history_url() -> String {
    "http://127.0.0.1:8090".to_string()
}

fn default_instruments() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
        "XRPUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_max_missed_heartbeats() -> u32 {
    3
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_history_limit() -> u16 {
    300
}

fn default_candle_retention() -> usize {
    500
}

fn default_timeframes() -> BTreeMap<String, i64> {
    [
        ("1m", 60),
        ("5m", 300),
        ("15m", 900),
        ("1h", 3_600),
        ("4h", 14_400),
        ("1d", 86_400),
    ]
    .into_iter()
    .map(|(code, secs)| (code.to_string(), secs))
    .collect()
}

fn default_chart_timeframes() -> Vec<String> {
    vec!["1m".to_string(), "5m".to_string()]
}

// =============================================================================
// FeedConfig
// =============================================================================

/// Top-level runtime configuration for the Helix feed engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    // --- Endpoints -----------------------------------------------------------

    /// WebSocket endpoint of the streaming feed server.
    #[serde(default = "default_feed_url")]
    pub feed_url: String,

    /// Base URL of the REST endpoint serving historical candles.
    #[serde(default = "default_history_url")]
    pub history_url: String,

    // --- Instruments ---------------------------------------------------------

    /// Instruments subscribed at startup.
    #[serde(default = "default_instruments")]
    pub instruments: Vec<String>,

    // --- Liveness & reconnect policy -----------------------------------------

    /// Seconds between outbound liveness probes. Should exceed the server's
    /// expected push interval.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Consecutive unanswered probes before the connection counts as dead.
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,

    /// Base delay for exponential reconnect backoff (milliseconds).
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Automatic reconnect attempts before giving up and requiring an
    /// explicit connect().
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    // --- Charting ------------------------------------------------------------

    /// Closed candles fetched to seed each chart series.
    #[serde(default = "default_history_limit")]
    pub history_limit: u16,

    /// Closed candles retained per series, plus one in-progress candle.
    #[serde(default = "default_candle_retention")]
    pub candle_retention: usize,

    /// Timeframe code -> bucket width in seconds.
    #[serde(default = "default_timeframes")]
    pub timeframes: BTreeMap<String, i64>,

    /// Timeframe codes charted at startup; must resolve via `timeframes`.
    #[serde(default = "default_chart_timeframes")]
    pub chart_timeframes: Vec<String>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            feed_url: default_feed_url(),
            history_url: default_history_url(),
            instruments: default_instruments(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            history_limit: default_history_limit(),
            candle_retention: default_candle_retention(),
            timeframes: default_timeframes(),
            chart_timeframes: default_chart_timeframes(),
        }
    }
}

impl FeedConfig {
    /// Resolve a timeframe code against the configured mapping.
    pub fn timeframe(&self, code: &str) -> Option<Timeframe> {
        self.timeframes
            .get(code)
            .map(|&bucket_secs| Timeframe::new(code, bucket_secs))
    }

    /// The timeframes charted at startup. Unknown codes are skipped with a
    /// warning rather than killing startup.
    pub fn chart_timeframes(&self) -> Vec<Timeframe> {
        self.chart_timeframes
            .iter()
            .filter_map(|code| {
                let resolved = self.timeframe(code);
                if resolved.is_none() {
                    warn!(code = %code, "chart timeframe not in the timeframe map — skipped");
                }
                resolved
            })
            .collect()
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feed config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse feed config from {}", path.display()))?;

        info!(
            path = %path.display(),
            instruments = ?config.instruments,
            feed_url = %config.feed_url,
            "feed config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise feed config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "feed config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = FeedConfig::default();
        assert_eq!(cfg.instruments.len(), 5);
        assert_eq!(cfg.instruments[0], "BTCUSDT");
        assert_eq!(cfg.heartbeat_interval_secs, 30);
        assert_eq!(cfg.max_missed_heartbeats, 3);
        assert_eq!(cfg.reconnect_base_delay_ms, 1_000);
        assert_eq!(cfg.max_reconnect_attempts, 5);
        assert_eq!(cfg.candle_retention, 500);
        assert_eq!(cfg.timeframes.get("1m"), Some(&60));
        assert_eq!(cfg.timeframes.get("1h"), Some(&3_600));
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: FeedConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.feed_url, default_feed_url());
        assert_eq!(cfg.max_reconnect_attempts, 5);
        assert_eq!(cfg.chart_timeframes, vec!["1m", "5m"]);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "instruments": ["ETHUSDT"], "heartbeat_interval_secs": 10 }"#;
        let cfg: FeedConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.instruments, vec!["ETHUSDT"]);
        assert_eq!(cfg.heartbeat_interval_secs, 10);
        assert_eq!(cfg.max_missed_heartbeats, 3);
        assert_eq!(cfg.history_limit, 300);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = FeedConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: FeedConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.instruments, cfg2.instruments);
        assert_eq!(cfg.timeframes, cfg2.timeframes);
        assert_eq!(cfg.chart_timeframes, cfg2.chart_timeframes);
    }

    #[test]
    fn timeframe_resolution() {
        let cfg = FeedConfig::default();
        let tf = cfg.timeframe("5m").expect("5m is mapped");
        assert_eq!(tf.bucket_secs, 300);
        assert_eq!(tf.bucket_ms(), 300_000);
        assert!(cfg.timeframe("7m").is_none());
    }

    #[test]
    fn unknown_chart_timeframes_are_skipped() {
        let mut cfg = FeedConfig::default();
        cfg.chart_timeframes = vec!["1m".to_string(), "42h".to_string()];
        let resolved = cfg.chart_timeframes();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].code, "1m");
    }
}
