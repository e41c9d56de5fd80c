// =============================================================================
// Tick-to-candle aggregator — fixed-interval OHLCV bars from a raw tick stream
// =============================================================================
//
// Each tracked (instrument, timeframe) pair owns one series: a ring of closed
// candles plus at most one open candle. A tick lands in the bucket
// `floor(timestamp / interval) * interval`; a tick in a newer bucket closes
// the open candle for good and opens the next one, a tick in the same bucket
// mutates the open candle in place, and a tick in an older bucket is dropped —
// chart consistency wins over retroactive correction.
//
// Consumers subscribe to a broadcast of `SeriesEvent::Opened` (append a bar)
// vs `SeriesEvent::Updated` (redraw the last bar), so a renderer never has to
// diff the series itself.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::indicators;
use crate::types::{Tick, Timeframe};

/// Broadcast capacity for series updates. Chart consumers that lag behind
/// simply observe a `Lagged` error and resync from the series itself.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV bar over one fixed time bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket open time in epoch milliseconds.
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    fn from_tick(open_time: i64, tick: &Tick) -> Self {
        Self {
            open_time,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.volume.unwrap_or(0.0),
        }
    }

    fn absorb_tick(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume += tick.volume.unwrap_or(0.0);
    }
}

/// Composite key identifying one candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SeriesKey {
    pub instrument: String,
    pub timeframe: Timeframe,
}

impl SeriesKey {
    pub fn new(instrument: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            instrument: instrument.into(),
            timeframe,
        }
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.instrument, self.timeframe)
    }
}

/// How a tick changed a series — the distinction a renderer needs.
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesEvent {
    /// A new candle was opened (the previous one, if any, is now immutable).
    /// Renderers append a bar.
    Opened(Candle),
    /// The open candle mutated in place. Renderers redraw the last bar only.
    Updated(Candle),
}

/// One series change, broadcast to all chart consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesUpdate {
    pub key: SeriesKey,
    pub event: SeriesEvent,
}

#[derive(Debug, Default)]
struct CandleSeries {
    /// Closed (immutable) candles, oldest first, trimmed to the retention cap.
    closed: VecDeque<Candle>,
    /// The in-progress candle for the latest bucket seen, if any.
    open: Option<Candle>,
}

// ---------------------------------------------------------------------------
// CandleAggregator
// ---------------------------------------------------------------------------

/// Thread-safe per-(instrument, timeframe) candle store fed by live ticks and
/// seeded from the historical fetch. Written only by the feed's event loop;
/// read by arbitrarily many chart consumers.
pub struct CandleAggregator {
    series: RwLock<HashMap<SeriesKey, CandleSeries>>,
    update_tx: broadcast::Sender<SeriesUpdate>,
    /// Closed candles retained per series, plus one in-progress candle.
    max_closed: usize,
}

impl CandleAggregator {
    pub fn new(max_closed: usize) -> Self {
        let (update_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            series: RwLock::new(HashMap::new()),
            update_tx,
            max_closed,
        }
    }

    /// Start maintaining a series. Tracking is idempotent and independent of
    /// the subscription lifecycle — ticks only land once the instrument is
    /// actually subscribed and flowing.
    pub fn track(&self, instrument: &str, timeframe: &Timeframe) {
        self.series
            .write()
            .entry(SeriesKey::new(instrument, timeframe.clone()))
            .or_default();
    }

    /// Drop a series and its candles. Safe to call for untracked keys.
    pub fn untrack(&self, instrument: &str, timeframe: &Timeframe) {
        self.series
            .write()
            .remove(&SeriesKey::new(instrument, timeframe.clone()));
    }

    pub fn tracked(&self) -> Vec<SeriesKey> {
        self.series.read().keys().cloned().collect()
    }

    /// Receiver for live series changes.
    pub fn updates(&self) -> broadcast::Receiver<SeriesUpdate> {
        self.update_tx.subscribe()
    }

    /// Seed a series with closed candles from the historical fetch. Input is
    /// sorted and de-duplicated by bucket; an existing open candle survives
    /// only if it is still newer than the seeded history.
    pub fn seed(&self, instrument: &str, timeframe: &Timeframe, mut candles: Vec<Candle>) {
        candles.sort_unstable_by_key(|c| c.open_time);
        candles.dedup_by_key(|c| c.open_time);

        let key = SeriesKey::new(instrument, timeframe.clone());
        let mut map = self.series.write();
        let series = map.entry(key.clone()).or_default();

        series.closed = candles.into_iter().collect();
        while series.closed.len() > self.max_closed {
            series.closed.pop_front();
        }

        if let (Some(open), Some(last)) = (series.open.as_ref(), series.closed.back()) {
            if open.open_time <= last.open_time {
                series.open = None;
            }
        }

        debug!(series = %key, closed = series.closed.len(), "series seeded from history");
    }

    /// Feed one tick into every tracked series for its instrument. Returns the
    /// number of series that changed; each change is also broadcast.
    pub fn ingest(&self, tick: &Tick) -> usize {
        let mut updates = Vec::new();
        {
            let mut map = self.series.write();
            for (key, series) in map.iter_mut() {
                if key.instrument != tick.instrument {
                    continue;
                }
                if let Some(event) =
                    apply_tick(series, key.timeframe.bucket_ms(), tick, self.max_closed)
                {
                    updates.push(SeriesUpdate {
                        key: key.clone(),
                        event,
                    });
                }
            }
        }

        let changed = updates.len();
        for update in updates {
            // No receivers is fine — charts may not be open yet.
            let _ = self.update_tx.send(update);
        }
        changed
    }

    /// The most recent `count` closed candles, oldest first.
    pub fn closed_candles(&self, key: &SeriesKey, count: usize) -> Vec<Candle> {
        let map = self.series.read();
        match map.get(key) {
            Some(series) => {
                let start = series.closed.len().saturating_sub(count);
                series.closed.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Close prices of the most recent `count` closed candles, oldest first.
    pub fn closes(&self, key: &SeriesKey, count: usize) -> Vec<f64> {
        self.closed_candles(key, count)
            .iter()
            .map(|c| c.close)
            .collect()
    }

    /// The in-progress candle, if one is open.
    pub fn open_candle(&self, key: &SeriesKey) -> Option<Candle> {
        self.series.read().get(key).and_then(|s| s.open.clone())
    }

    /// Total candles stored for a series, including the in-progress one.
    pub fn candle_count(&self, key: &SeriesKey) -> usize {
        let map = self.series.read();
        map.get(key)
            .map_or(0, |s| s.closed.len() + usize::from(s.open.is_some()))
    }

    /// Simple moving average over the closed closes plus the open candle,
    /// recomputed from scratch — series are bounded (hundreds of bars), so a
    /// full pass per mutation is cheaper than maintaining incremental state.
    pub fn sma(&self, key: &SeriesKey, period: usize) -> Option<f64> {
        indicators::sma::latest_sma(&self.closes_with_open(key), period)
    }

    /// Exponential moving average over the same window, recomputed from
    /// scratch like [`CandleAggregator::sma`].
    pub fn ema(&self, key: &SeriesKey, period: usize) -> Option<f64> {
        indicators::ema::latest_ema(&self.closes_with_open(key), period)
    }

    fn closes_with_open(&self, key: &SeriesKey) -> Vec<f64> {
        let map = self.series.read();
        match map.get(key) {
            Some(series) => {
                let mut closes: Vec<f64> = series.closed.iter().map(|c| c.close).collect();
                if let Some(open) = &series.open {
                    closes.push(open.close);
                }
                closes
            }
            None => Vec::new(),
        }
    }
}

/// Apply one tick to one series. `None` means the tick was discarded (its
/// bucket is older than the latest bucket seen).
fn apply_tick(
    series: &mut CandleSeries,
    bucket_ms: i64,
    tick: &Tick,
    max_closed: usize,
) -> Option<SeriesEvent> {
    let open_time = bucket_open_time(tick.timestamp, bucket_ms);

    if let Some(current) = series.open.as_mut() {
        if open_time < current.open_time {
            // Out-of-order arrival past bucket close: never reopen a closed
            // candle.
            return None;
        }
        if open_time == current.open_time {
            current.absorb_tick(tick);
            return Some(SeriesEvent::Updated(current.clone()));
        }
    } else if let Some(last) = series.closed.back() {
        if open_time <= last.open_time {
            // Tick maps into seeded history.
            return None;
        }
    }

    // Roll over: the previous open candle (if any) becomes immutable.
    if let Some(finished) = series.open.take() {
        series.closed.push_back(finished);
        while series.closed.len() > max_closed {
            series.closed.pop_front();
        }
    }

    let candle = Candle::from_tick(open_time, tick);
    series.open = Some(candle.clone());
    Some(SeriesEvent::Opened(candle))
}

/// `floor(timestamp / interval) * interval`, robust for pre-epoch timestamps.
fn bucket_open_time(timestamp_ms: i64, bucket_ms: i64) -> i64 {
    if bucket_ms <= 0 {
        return timestamp_ms;
    }
    timestamp_ms - timestamp_ms.rem_euclid(bucket_ms)
}
