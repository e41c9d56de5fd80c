// =============================================================================
// Transport channel — WebSocket framing behind a trait seam
// =============================================================================
//
// The connection state machine only ever talks to `Transport`/`TransportLink`,
// so the whole reconnect/heartbeat/replay logic can be exercised against a
// scripted in-memory transport in tests. `WsTransport` is the production
// implementation over tokio-tungstenite.
// =============================================================================

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::FeedError;
use crate::protocol::{decode_server_message, encode_client_message, ClientMessage, ServerMessage};

/// Opens streaming channels to the feed server.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &str, token: &str) -> Result<Box<dyn TransportLink>, FeedError>;
}

/// One live bidirectional channel.
///
/// `next` returning `None` means the channel ended (clean close or EOF);
/// `Some(Err(FeedError::Protocol(_)))` means one undecodable frame — the link
/// itself is still usable and the caller is expected to keep reading.
#[async_trait]
pub trait TransportLink: Send {
    async fn send(&mut self, message: ClientMessage) -> Result<(), FeedError>;
    async fn next(&mut self) -> Option<Result<ServerMessage, FeedError>>;
    async fn close(&mut self);
}

// =============================================================================
// tokio-tungstenite implementation
// =============================================================================

pub struct WsTransport;

fn authenticated_url(base: &str, token: &str) -> String {
    format!("{base}?token={token}")
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str, token: &str) -> Result<Box<dyn TransportLink>, FeedError> {
        let request = authenticated_url(url, token);
        let (stream, _response) = connect_async(&request).await?;
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportLink for WsLink {
    async fn send(&mut self, message: ClientMessage) -> Result<(), FeedError> {
        let json = encode_client_message(&message)?;
        self.stream
            .send(Message::Text(json))
            .await
            .map_err(FeedError::from)
    }

    async fn next(&mut self) -> Option<Result<ServerMessage, FeedError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(decode_server_message(&text)),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "close frame received");
                    return None;
                }
                // Protocol-level ping/pong is answered by tungstenite itself;
                // binary frames are not part of this protocol.
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Some(Err(err.into())),
                None => return None,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
