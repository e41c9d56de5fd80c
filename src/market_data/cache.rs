// =============================================================================
// Market-data cache — last tick per instrument
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;

use crate::types::Tick;

/// A cached tick plus the wall-clock time it was stored.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedTick {
    pub tick: Tick,
    /// Local receive time in epoch milliseconds.
    pub updated_at_ms: i64,
}

/// Last-value cache keyed by instrument. Overwritten on every tick; read by
/// listeners that attach after data has started flowing, so a late subscriber
/// gets an initial value instead of waiting for the next tick. Readers never
/// mutate.
#[derive(Default)]
pub struct MarketDataCache {
    entries: RwLock<HashMap<String, CachedTick>>,
}

impl MarketDataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, tick: &Tick) {
        self.entries.write().insert(
            tick.instrument.clone(),
            CachedTick {
                tick: tick.clone(),
                updated_at_ms: Utc::now().timestamp_millis(),
            },
        );
    }

    pub fn last(&self, instrument: &str) -> Option<CachedTick> {
        self.entries.read().get(instrument).cloned()
    }

    pub fn instruments(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
