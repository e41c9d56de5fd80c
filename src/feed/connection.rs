// =============================================================================
// Connection actor — state machine, reconnect backoff, heartbeat
// =============================================================================
//
// The single owner of the transport link, the ConnectionState, and the
// subscription registry. All mutation happens inside one task in reaction to
// discrete events: a command from the public handle, an inbound frame, a
// heartbeat tick, a reconnect timer, or a session-credential change. Callers
// never block on the network — they post a command and observe the outcome
// through the status watch, the notification channel, and their listeners.
// =============================================================================

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, sleep_until, Duration, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::FeedError;
use crate::feed::fanout::ListenerRegistry;
use crate::feed::subscriptions::SubscriptionRegistry;
use crate::market_data::{CandleAggregator, MarketDataCache};
use crate::protocol::{ClientMessage, ServerMessage, SubscriptionAction};
use crate::runtime_config::FeedConfig;
use crate::transport::{Transport, TransportLink};
use crate::types::{ConnectionState, ConnectionStatus, FeedNotification};

/// Arithmetic guard for the backoff shift. The effective cap on retries is
/// the configured maximum attempt count, not this.
const MAX_BACKOFF_SHIFT: u32 = 16;

/// Exponential backoff: `base * 2^attempt`.
pub(crate) fn reconnect_delay(base_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.min(MAX_BACKOFF_SHIFT);
    Duration::from_millis(base_ms.saturating_mul(1_u64 << shift))
}

/// Requests posted by the public [`crate::feed::MarketFeed`] handle.
#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Disconnect,
    Subscribe(String),
    Unsubscribe(String),
    LivePrice(String),
}

pub(crate) struct ConnectionActor {
    feed_url: String,
    heartbeat_interval: Duration,
    max_missed_heartbeats: u32,
    reconnect_base_delay_ms: u64,
    max_reconnect_attempts: u32,

    transport: Arc<dyn Transport>,
    session: watch::Receiver<Option<String>>,
    status_tx: watch::Sender<ConnectionStatus>,
    notify_tx: broadcast::Sender<FeedNotification>,

    listeners: Arc<ListenerRegistry>,
    cache: Arc<MarketDataCache>,
    aggregator: Arc<CandleAggregator>,
    registry: SubscriptionRegistry,

    link: Option<Box<dyn TransportLink>>,
    state: ConnectionState,
    reconnect_attempt: u32,
    reconnect_at: Option<Instant>,
    retries_exhausted: bool,
    missed_heartbeats: u32,
}

impl ConnectionActor {
    pub(crate) fn new(
        config: &FeedConfig,
        transport: Arc<dyn Transport>,
        session: watch::Receiver<Option<String>>,
        status_tx: watch::Sender<ConnectionStatus>,
        notify_tx: broadcast::Sender<FeedNotification>,
        listeners: Arc<ListenerRegistry>,
        cache: Arc<MarketDataCache>,
        aggregator: Arc<CandleAggregator>,
    ) -> Self {
        Self {
            feed_url: config.feed_url.clone(),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            max_missed_heartbeats: config.max_missed_heartbeats.max(1),
            reconnect_base_delay_ms: config.reconnect_base_delay_ms,
            max_reconnect_attempts: config.max_reconnect_attempts,
            transport,
            session,
            status_tx,
            notify_tx,
            listeners,
            cache,
            aggregator,
            registry: SubscriptionRegistry::new(),
            link: None,
            state: ConnectionState::Disconnected,
            reconnect_attempt: 0,
            reconnect_at: None,
            retries_exhausted: false,
            missed_heartbeats: 0,
        }
    }

    /// Event loop. Exits when every public handle is dropped.
    pub(crate) async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<Command>) {
        let mut heartbeat = interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command, &mut heartbeat).await,
                        None => break,
                    }
                }
                message = next_link_message(&mut self.link) => {
                    self.handle_inbound(message).await;
                }
                _ = heartbeat.tick(), if self.state == ConnectionState::Connected => {
                    self.on_heartbeat_tick().await;
                }
                _ = sleep_until(self.reconnect_at.unwrap_or_else(Instant::now)),
                    if self.reconnect_at.is_some() =>
                {
                    self.reconnect_at = None;
                    self.begin_connect(&mut heartbeat).await;
                }
                changed = self.session.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let revoked = self.session.borrow_and_update().is_none();
                    if revoked && self.state != ConnectionState::Disconnected {
                        warn!("session credential revoked — disconnecting");
                        self.do_disconnect().await;
                    }
                }
            }
        }

        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        debug!("connection actor stopped");
    }

    // ── Commands ────────────────────────────────────────────────────────

    async fn handle_command(&mut self, command: Command, heartbeat: &mut Interval) {
        match command {
            Command::Connect => {
                // A user-initiated connect always starts a fresh retry budget
                // and cancels whatever backoff timer was pending.
                self.reconnect_at = None;
                self.reconnect_attempt = 0;
                self.retries_exhausted = false;
                self.begin_connect(heartbeat).await;
            }
            Command::Disconnect => self.do_disconnect().await,
            Command::Subscribe(instrument) => self.do_subscribe(instrument).await,
            Command::Unsubscribe(instrument) => self.do_unsubscribe(instrument).await,
            Command::LivePrice(instrument) => {
                if self.state == ConnectionState::Connected {
                    self.send(ClientMessage::GetLivePrice { instrument }).await;
                } else {
                    debug!(symbol = %instrument, "live price request dropped — not connected");
                }
            }
        }
    }

    async fn begin_connect(&mut self, heartbeat: &mut Interval) {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!(state = %self.state, "connect ignored — already in progress");
            return;
        }

        match self.connect_once().await {
            Ok(()) => {
                self.reconnect_attempt = 0;
                self.missed_heartbeats = 0;
                heartbeat.reset();
                self.set_state(ConnectionState::Connected);
                info!(url = %self.feed_url, "stream connected");
                self.replay_subscriptions().await;
            }
            Err(FeedError::MissingCredential) => {
                warn!("connect refused — no session credential");
            }
            Err(err) => {
                error!(error = %err, "failed to open stream");
                self.fail_and_schedule_reconnect();
            }
        }
    }

    async fn connect_once(&mut self) -> Result<(), FeedError> {
        let token = self
            .session
            .borrow()
            .clone()
            .ok_or(FeedError::MissingCredential)?;

        self.set_state(ConnectionState::Connecting);
        let link = self.transport.open(&self.feed_url, &token).await?;
        self.link = Some(link);
        Ok(())
    }

    async fn do_disconnect(&mut self) {
        self.reconnect_at = None;
        self.reconnect_attempt = 0;
        self.retries_exhausted = false;
        self.missed_heartbeats = 0;

        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        self.registry.clear();
        self.set_state(ConnectionState::Disconnected);
        info!("disconnected — subscription state cleared, listeners retained");
    }

    async fn do_subscribe(&mut self, instrument: String) {
        if !self.registry.record(&instrument) {
            return;
        }
        if self.state == ConnectionState::Connected {
            self.send(ClientMessage::Subscribe { instrument }).await;
        } else {
            debug!(symbol = %instrument, "subscribe intent queued until connected");
        }
    }

    async fn do_unsubscribe(&mut self, instrument: String) {
        // While connected every recorded intent has been sent, so anything
        // tracked owes the server an unsubscribe. While disconnected the
        // intent just vanishes from the queue.
        let was_tracked = self.registry.is_tracked(&instrument);
        self.registry.remove(&instrument);
        if self.state == ConnectionState::Connected && was_tracked {
            self.send(ClientMessage::Unsubscribe { instrument }).await;
        }
    }

    /// Replay the confirmed-or-pending set after (re)connecting, in original
    /// enqueue order. On a mid-replay transport failure the remaining intents
    /// stay queued for the next reconnect.
    async fn replay_subscriptions(&mut self) {
        let instruments = self.registry.replay_order();
        if instruments.is_empty() {
            return;
        }
        info!(count = instruments.len(), "replaying subscriptions");
        for instrument in &instruments {
            let sent = self
                .send(ClientMessage::Subscribe {
                    instrument: instrument.clone(),
                })
                .await;
            if !sent {
                return;
            }
        }
        self.registry.clear_pending();
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    async fn handle_inbound(&mut self, message: Option<Result<ServerMessage, FeedError>>) {
        match message {
            Some(Ok(message)) => self.dispatch(message),
            Some(Err(FeedError::Protocol(err))) => {
                // One bad frame never costs the connection.
                warn!(error = %err, "dropping undecodable message");
            }
            Some(Err(err)) => {
                error!(error = %err, "stream read error");
                self.fail_and_schedule_reconnect();
            }
            None => {
                warn!("stream ended by server");
                self.fail_and_schedule_reconnect();
            }
        }
    }

    fn dispatch(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Heartbeat => {
                self.missed_heartbeats = 0;
            }
            ServerMessage::ConnectionStatus { status } => {
                debug!(status = ?status, "connection status banner");
            }
            ServerMessage::MarketData { instrument, data } => {
                let tick = data.into_tick(instrument);
                self.cache.update(&tick);
                self.listeners.deliver_market_data(&tick);
                self.aggregator.ingest(&tick);
            }
            ServerMessage::OrderUpdate { data } => {
                self.listeners.deliver_order_update(&data);
            }
            ServerMessage::PortfolioUpdate { data } => {
                self.listeners.deliver_portfolio_update(&data);
            }
            ServerMessage::SubscriptionStatus { status, instrument } => {
                debug!(symbol = %instrument, status = ?status, "subscription acknowledged");
                match status {
                    SubscriptionAction::Subscribed => self.registry.confirm(&instrument),
                    SubscriptionAction::Unsubscribed => self.registry.confirm_removal(&instrument),
                }
            }
            ServerMessage::Error { message } => {
                warn!(message = %message, "server application error");
                let _ = self
                    .notify_tx
                    .send(FeedNotification::ServerError { message });
            }
            ServerMessage::Unknown => {
                warn!("unrecognized message type ignored");
            }
        }
    }

    // ── Liveness ────────────────────────────────────────────────────────

    async fn on_heartbeat_tick(&mut self) {
        self.missed_heartbeats += 1;
        if self.missed_heartbeats >= self.max_missed_heartbeats {
            warn!(
                missed = self.missed_heartbeats,
                "liveness probes unanswered — treating connection as dead"
            );
            if let Some(mut link) = self.link.take() {
                link.close().await;
            }
            self.fail_and_schedule_reconnect();
            return;
        }
        self.send(ClientMessage::Ping).await;
    }

    // ── Failure handling ────────────────────────────────────────────────

    fn fail_and_schedule_reconnect(&mut self) {
        self.link = None;

        if self.reconnect_attempt >= self.max_reconnect_attempts {
            self.retries_exhausted = true;
            self.set_state(ConnectionState::Error);
            error!(
                attempts = self.reconnect_attempt,
                "reconnect budget exhausted — waiting for an explicit connect()"
            );
            let _ = self.notify_tx.send(FeedNotification::ConnectionLost {
                attempts: self.reconnect_attempt,
            });
            return;
        }

        let delay = reconnect_delay(self.reconnect_base_delay_ms, self.reconnect_attempt);
        self.reconnect_attempt += 1;
        self.set_state(ConnectionState::Error);
        self.reconnect_at = Some(Instant::now() + delay);
        warn!(
            attempt = self.reconnect_attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
    }

    // ── Plumbing ────────────────────────────────────────────────────────

    /// Send one message on the live link. Returns `false` (after scheduling a
    /// reconnect where appropriate) instead of surfacing errors to callers —
    /// senders degrade to queued-intent semantics.
    async fn send(&mut self, message: ClientMessage) -> bool {
        let Some(link) = self.link.as_mut() else {
            return false;
        };
        match link.send(message).await {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "send failed");
                self.fail_and_schedule_reconnect();
                false
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!(from = %self.state, to = %state, "connection state changed");
        }
        self.state = state;
        let _ = self.status_tx.send(ConnectionStatus {
            state: self.state,
            reconnect_attempt: self.reconnect_attempt,
            retries_exhausted: self.retries_exhausted,
        });
    }
}

/// Pends forever while no link is up, so the select loop simply ignores the
/// inbound arm until a connection exists.
async fn next_link_message(
    link: &mut Option<Box<dyn TransportLink>>,
) -> Option<Result<ServerMessage, FeedError>> {
    match link.as_mut() {
        Some(link) => link.next().await,
        None => std::future::pending().await,
    }
}
