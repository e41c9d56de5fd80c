// =============================================================================
// Shared types used across the Helix feed engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Lifecycle state of the streaming connection.
///
/// Exactly one value at a time for the lifetime of the feed; transitions are
/// driven solely by the connection actor in reaction to discrete events
/// (channel open/close/message/error, timer fire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Observable snapshot of the connection published on every transition.
///
/// `retries_exhausted` is distinct from [`ConnectionState::Error`]: it marks
/// the terminal give-up after the reconnect budget is spent, so a dashboard
/// can stop showing a "reconnecting" spinner and show a hard failure instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub reconnect_attempt: u32,
    pub retries_exhausted: bool,
}

/// A single incoming price/volume update for one instrument.
///
/// Transient: a tick is not retained beyond the market-data cache entry and
/// the candle it contributes to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Tradable symbol identifier, e.g. `BTCUSDT`.
    pub instrument: String,
    pub price: f64,
    pub volume: Option<f64>,
    /// Event time in epoch milliseconds.
    pub timestamp: i64,
}

/// A chart timeframe: a human-readable code plus the fixed bucket width used
/// by the candle aggregator. The code-to-seconds mapping is supplied by the
/// runtime configuration, never hard-wired into the aggregation algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timeframe {
    pub code: String,
    pub bucket_secs: i64,
}

impl Timeframe {
    pub fn new(code: impl Into<String>, bucket_secs: i64) -> Self {
        Self {
            code: code.into(),
            bucket_secs,
        }
    }

    /// Bucket width in epoch milliseconds.
    pub fn bucket_ms(&self) -> i64 {
        self.bucket_secs * 1_000
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code)
    }
}

/// Out-of-band events surfaced to the dashboard layer on a side channel.
///
/// These never interrupt the data path: the connection stays up after a
/// `ServerError`, and `ConnectionLost` is the one terminal condition that
/// requires a user-initiated `connect()` to clear.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedNotification {
    /// Server-sent application error; more of a banner than a failure.
    ServerError { message: String },
    /// The automatic reconnect budget is spent. Hard failure.
    ConnectionLost { attempts: u32 },
}
