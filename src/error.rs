// =============================================================================
// Feed error taxonomy
// =============================================================================
//
// Only the failures that cross a Result boundary live here. Server-sent
// application errors and the exhausted-retries condition never do — they are
// delivered on the notification side channel (`types::FeedNotification`) while
// the state machine keeps running.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    /// Channel-level open/send/read failure. Drives the ERROR transition and
    /// the reconnect schedule.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Malformed or undecodable message. The single message is dropped; the
    /// connection stays up.
    #[error("malformed message: {0}")]
    Protocol(String),

    /// `connect()` was requested without a session credential.
    #[error("no session credential available")]
    MissingCredential,
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
