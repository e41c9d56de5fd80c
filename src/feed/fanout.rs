// =============================================================================
// Listener fan-out — many consumers per instrument, none can break the rest
// =============================================================================
//
// Decouples "who wants updates for instrument X" from "how many views render
// X". Registration hands back a generation-stable `ListenerHandle`; removal by
// handle is always safe, even for handles that were never registered.
// Registering a listener never causes a network subscribe — a component can
// observe cache values populated by another component's subscription.
// =============================================================================

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;
use uuid::Uuid;

use crate::types::Tick;

pub type TickCallback = Arc<dyn Fn(&Tick) + Send + Sync>;
pub type EventCallback = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Opaque handle returned by registration; the only way to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(Uuid);

impl ListenerHandle {
    fn next() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Per-instrument and global callback registries.
#[derive(Default)]
pub struct ListenerRegistry {
    market: RwLock<HashMap<String, Vec<(ListenerHandle, TickCallback)>>>,
    orders: RwLock<Vec<(ListenerHandle, EventCallback)>>,
    portfolio: RwLock<Vec<(ListenerHandle, EventCallback)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_market_data(&self, instrument: &str, callback: TickCallback) -> ListenerHandle {
        let handle = ListenerHandle::next();
        self.market
            .write()
            .entry(instrument.to_string())
            .or_default()
            .push((handle, callback));
        handle
    }

    pub fn add_order(&self, callback: EventCallback) -> ListenerHandle {
        let handle = ListenerHandle::next();
        self.orders.write().push((handle, callback));
        handle
    }

    pub fn add_portfolio(&self, callback: EventCallback) -> ListenerHandle {
        let handle = ListenerHandle::next();
        self.portfolio.write().push((handle, callback));
        handle
    }

    /// Remove a listener wherever it lives. Returns `false` for handles that
    /// are unknown or already removed — callers never need to care.
    pub fn remove(&self, handle: ListenerHandle) -> bool {
        {
            let mut market = self.market.write();
            for listeners in market.values_mut() {
                let before = listeners.len();
                listeners.retain(|(id, _)| *id != handle);
                if listeners.len() != before {
                    return true;
                }
            }
            market.retain(|_, listeners| !listeners.is_empty());
        }

        let mut orders = self.orders.write();
        let before = orders.len();
        orders.retain(|(id, _)| *id != handle);
        if orders.len() != before {
            return true;
        }
        drop(orders);

        let mut portfolio = self.portfolio.write();
        let before = portfolio.len();
        portfolio.retain(|(id, _)| *id != handle);
        portfolio.len() != before
    }

    pub fn market_listener_count(&self, instrument: &str) -> usize {
        self.market
            .read()
            .get(instrument)
            .map_or(0, |listeners| listeners.len())
    }

    /// Deliver a tick to every listener registered for its instrument, in
    /// registration order. Callbacks run outside the lock so a slow consumer
    /// cannot block registration.
    pub fn deliver_market_data(&self, tick: &Tick) {
        let callbacks: Vec<TickCallback> = {
            let market = self.market.read();
            match market.get(&tick.instrument) {
                Some(listeners) => listeners.iter().map(|(_, cb)| cb.clone()).collect(),
                None => return,
            }
        };
        for callback in &callbacks {
            invoke_tick_listener(callback, tick);
        }
    }

    pub fn deliver_order_update(&self, data: &serde_json::Value) {
        let callbacks: Vec<EventCallback> =
            self.orders.read().iter().map(|(_, cb)| cb.clone()).collect();
        for callback in &callbacks {
            invoke_event_listener(callback, data);
        }
    }

    pub fn deliver_portfolio_update(&self, data: &serde_json::Value) {
        let callbacks: Vec<EventCallback> = self
            .portfolio
            .read()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in &callbacks {
            invoke_event_listener(callback, data);
        }
    }
}

/// Run one tick callback, containing any panic so fan-out to the remaining
/// listeners continues.
pub(crate) fn invoke_tick_listener(callback: &TickCallback, tick: &Tick) {
    if catch_unwind(AssertUnwindSafe(|| callback(tick))).is_err() {
        error!(symbol = %tick.instrument, "market-data listener panicked — continuing fan-out");
    }
}

fn invoke_event_listener(callback: &EventCallback, data: &serde_json::Value) {
    if catch_unwind(AssertUnwindSafe(|| callback(data))).is_err() {
        error!("event listener panicked — continuing fan-out");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn tick(instrument: &str, price: f64) -> Tick {
        Tick {
            instrument: instrument.to_string(),
            price,
            volume: None,
            timestamp: 0,
        }
    }

    #[test]
    fn delivers_to_all_listeners_in_registration_order() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            registry.add_market_data("BTCUSDT", Arc::new(move |_t: &Tick| seen.lock().push(tag)));
        }

        registry.deliver_market_data(&tick("BTCUSDT", 1.0));
        assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn panicking_listener_does_not_starve_the_rest() {
        let registry = ListenerRegistry::new();
        let delivered = Arc::new(Mutex::new(Vec::new()));

        registry.add_market_data(
            "BTCUSDT",
            Arc::new(|_t: &Tick| panic!("listener blew up")),
        );
        let sink = delivered.clone();
        registry.add_market_data(
            "BTCUSDT",
            Arc::new(move |t: &Tick| sink.lock().push(t.price)),
        );

        registry.deliver_market_data(&tick("BTCUSDT", 42.0));
        assert_eq!(*delivered.lock(), vec![42.0]);
    }

    #[test]
    fn removal_by_handle_stops_future_delivery() {
        let registry = ListenerRegistry::new();
        let count = Arc::new(Mutex::new(0u32));

        let sink = count.clone();
        let handle =
            registry.add_market_data("ETHUSDT", Arc::new(move |_t: &Tick| *sink.lock() += 1));

        registry.deliver_market_data(&tick("ETHUSDT", 1.0));
        assert!(registry.remove(handle));
        registry.deliver_market_data(&tick("ETHUSDT", 2.0));

        assert_eq!(*count.lock(), 1);
        assert_eq!(registry.market_listener_count("ETHUSDT"), 0);
    }

    #[test]
    fn removing_unknown_handle_is_safe() {
        let registry = ListenerRegistry::new();
        let phantom = ListenerHandle::next();
        assert!(!registry.remove(phantom));
        // Double removal is equally harmless.
        let handle = registry.add_order(Arc::new(|_d: &serde_json::Value| {}));
        assert!(registry.remove(handle));
        assert!(!registry.remove(handle));
    }

    #[test]
    fn ticks_for_other_instruments_are_not_delivered() {
        let registry = ListenerRegistry::new();
        let count = Arc::new(Mutex::new(0u32));

        let sink = count.clone();
        registry.add_market_data("BTCUSDT", Arc::new(move |_t: &Tick| *sink.lock() += 1));

        registry.deliver_market_data(&tick("ETHUSDT", 1.0));
        assert_eq!(*count.lock(), 0);
    }

    #[test]
    fn order_and_portfolio_listeners_are_global() {
        let registry = ListenerRegistry::new();
        let orders = Arc::new(Mutex::new(0u32));
        let portfolio = Arc::new(Mutex::new(0u32));

        let sink = orders.clone();
        registry.add_order(Arc::new(move |_d: &serde_json::Value| *sink.lock() += 1));
        let sink = portfolio.clone();
        registry.add_portfolio(Arc::new(move |_d: &serde_json::Value| *sink.lock() += 1));

        registry.deliver_order_update(&serde_json::json!({"order_id": 7}));
        registry.deliver_order_update(&serde_json::json!({"order_id": 8}));
        registry.deliver_portfolio_update(&serde_json::json!({"equity": 1000.0}));

        assert_eq!(*orders.lock(), 2);
        assert_eq!(*portfolio.lock(), 1);
    }
}
