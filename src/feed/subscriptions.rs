// =============================================================================
// Subscription registry — durable subscribe intent across disconnects
// =============================================================================
//
// UI code calls subscribe/unsubscribe without tracking connection state. The
// registry records intent unconditionally: `pending` holds intents issued
// while the channel was down (FIFO), `confirmed` holds instruments the server
// has acknowledged. On reconnect the whole confirmed-or-pending set is
// replayed in insertion order.
// =============================================================================

use tracing::debug;

/// Tracks which instruments are (believed to be) subscribed server-side.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    /// Acknowledged by the server, in insertion order.
    confirmed: Vec<String>,
    /// Intents not yet acknowledged, in issue order.
    pending: Vec<String>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record subscribe intent. Returns `false` when the instrument is
    /// already tracked — re-subscribing is idempotent and must not produce a
    /// second wire message.
    pub fn record(&mut self, instrument: &str) -> bool {
        if self.is_tracked(instrument) {
            debug!(symbol = %instrument, "duplicate subscribe intent ignored");
            return false;
        }
        self.pending.push(instrument.to_string());
        true
    }

    /// Drop all intent for an instrument. Queued intents that were never sent
    /// simply vanish; returns `true` when the instrument was confirmed, i.e.
    /// an unsubscribe message is actually owed to the server.
    pub fn remove(&mut self, instrument: &str) -> bool {
        self.pending.retain(|sym| sym != instrument);
        let was_confirmed = self.confirmed.iter().any(|sym| sym == instrument);
        if was_confirmed {
            self.confirmed.retain(|sym| sym != instrument);
        }
        was_confirmed
    }

    /// Server acknowledged a subscribe: promote pending -> confirmed.
    pub fn confirm(&mut self, instrument: &str) {
        self.pending.retain(|sym| sym != instrument);
        if !self.confirmed.iter().any(|sym| sym == instrument) {
            self.confirmed.push(instrument.to_string());
        }
    }

    /// Server acknowledged an unsubscribe.
    pub fn confirm_removal(&mut self, instrument: &str) {
        self.confirmed.retain(|sym| sym != instrument);
        self.pending.retain(|sym| sym != instrument);
    }

    /// The confirmed-or-pending set in insertion order, for replay after a
    /// reconnect.
    pub fn replay_order(&self) -> Vec<String> {
        let mut order = self.confirmed.clone();
        for sym in &self.pending {
            if !order.iter().any(|existing| existing == sym) {
                order.push(sym.clone());
            }
        }
        order
    }

    /// Called once a replay pass has fully gone out; the confirmed set stays
    /// authoritative and is updated by acknowledgements from here on.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Explicit disconnect wipes all in-memory subscription state (listeners
    /// are UI-owned and untouched).
    pub fn clear(&mut self) {
        self.confirmed.clear();
        self.pending.clear();
    }

    pub fn is_tracked(&self, instrument: &str) -> bool {
        self.confirmed.iter().any(|sym| sym == instrument)
            || self.pending.iter().any(|sym| sym == instrument)
    }

    pub fn confirmed_count(&self) -> usize {
        self.confirmed.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
