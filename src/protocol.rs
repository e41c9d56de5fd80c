// =============================================================================
// Wire protocol — JSON message envelope
// =============================================================================
//
// Every frame is a JSON object tagged by a `type` field. Unrecognized inbound
// types decode to `ServerMessage::Unknown` so that new server-side message
// kinds never break an older client; callers log and drop them.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::FeedError;
use crate::types::Tick;

// =============================================================================
// Inbound
// =============================================================================

/// Payload of a market-data message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickPayload {
    pub price: f64,
    #[serde(default)]
    pub volume: Option<f64>,
    /// Event time in epoch milliseconds.
    pub timestamp: i64,
}

impl TickPayload {
    pub fn into_tick(self, instrument: String) -> Tick {
        Tick {
            instrument,
            price: self.price,
            volume: self.volume,
            timestamp: self.timestamp,
        }
    }
}

/// Server acknowledgement of a subscription change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionAction {
    Subscribed,
    Unsubscribed,
}

/// Messages pushed by the feed server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Informational connection banner sent right after the channel opens.
    ConnectionStatus {
        #[serde(default)]
        status: Option<String>,
    },

    /// Liveness acknowledgement. The server replies `pong` to our `ping` and
    /// may also push unsolicited heartbeats; both reset the missed counter.
    #[serde(alias = "pong")]
    Heartbeat,

    /// A price tick. `initial_price` is the snapshot pushed right after a
    /// subscribe; `live_price` is the reply to an explicit request. All three
    /// carry the same payload and flow through the same path.
    #[serde(alias = "initial_price", alias = "live_price")]
    MarketData { instrument: String, data: TickPayload },

    OrderUpdate { data: serde_json::Value },

    PortfolioUpdate { data: serde_json::Value },

    SubscriptionStatus {
        status: SubscriptionAction,
        instrument: String,
    },

    Error { message: String },

    /// Any `type` this client does not know. Logged and dropped.
    #[serde(other)]
    Unknown,
}

/// Decode one inbound frame. A failure here is a protocol error: the caller
/// drops the message and keeps the connection.
pub fn decode_server_message(text: &str) -> Result<ServerMessage, FeedError> {
    serde_json::from_str(text).map_err(FeedError::from)
}

// =============================================================================
// Outbound
// =============================================================================

/// Messages this client sends upstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Subscribe { instrument: String },
    Unsubscribe { instrument: String },
    GetLivePrice { instrument: String },
}

pub fn encode_client_message(message: &ClientMessage) -> Result<String, FeedError> {
    serde_json::to_string(message).map_err(FeedError::from)
}
