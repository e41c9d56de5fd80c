// =============================================================================
// Feed module — public handle over the streaming distribution layer
// =============================================================================
//
// `MarketFeed` is what dashboard code holds: it posts commands to the
// connection actor and exposes the observable surfaces (status watch,
// notification channel, listener registry, market-data cache, candle
// aggregator). Dropping every handle stops the actor.
// =============================================================================

pub mod connection;
pub mod fanout;
pub mod subscriptions;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

use crate::feed::connection::{Command, ConnectionActor};
use crate::feed::fanout::{invoke_tick_listener, ListenerHandle, ListenerRegistry, TickCallback};
use crate::history::HistoryProvider;
use crate::market_data::{CachedTick, CandleAggregator, MarketDataCache};
use crate::runtime_config::FeedConfig;
use crate::session::SessionHandle;
use crate::transport::Transport;
use crate::types::{ConnectionState, ConnectionStatus, FeedNotification, Tick, Timeframe};

/// Capacity of the out-of-band notification channel.
const NOTIFY_CHANNEL_CAPACITY: usize = 64;

/// Handle to the market-data distribution layer.
#[derive(Clone)]
pub struct MarketFeed {
    command_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<ConnectionStatus>,
    notify_tx: broadcast::Sender<FeedNotification>,
    listeners: Arc<ListenerRegistry>,
    cache: Arc<MarketDataCache>,
    aggregator: Arc<CandleAggregator>,
}

impl MarketFeed {
    /// Build the feed and spawn its connection actor.
    pub fn spawn(
        config: &FeedConfig,
        transport: Arc<dyn Transport>,
        session: &SessionHandle,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let (notify_tx, _) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY);

        let listeners = Arc::new(ListenerRegistry::new());
        let cache = Arc::new(MarketDataCache::new());
        let aggregator = Arc::new(CandleAggregator::new(config.candle_retention));

        let actor = ConnectionActor::new(
            config,
            transport,
            session.subscribe(),
            status_tx,
            notify_tx.clone(),
            listeners.clone(),
            cache.clone(),
            aggregator.clone(),
        );
        tokio::spawn(actor.run(command_rx));

        Self {
            command_tx,
            status_rx,
            notify_tx,
            listeners,
            cache,
            aggregator,
        }
    }

    // ── Connection lifecycle ────────────────────────────────────────────

    /// Ask for a connection. Idempotent; a no-op while already connecting or
    /// connected. Progress is observable via [`MarketFeed::status`].
    pub fn connect(&self) {
        let _ = self.command_tx.send(Command::Connect);
    }

    /// Tear the connection down and clear subscription state. Registered
    /// listeners are UI-owned and survive.
    pub fn disconnect(&self) {
        let _ = self.command_tx.send(Command::Disconnect);
    }

    pub fn state(&self) -> ConnectionState {
        self.status_rx.borrow().state
    }

    /// Watch receiver for connection status snapshots.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Receiver for out-of-band notifications (server errors, terminal
    /// connection loss).
    pub fn notifications(&self) -> broadcast::Receiver<FeedNotification> {
        self.notify_tx.subscribe()
    }

    // ── Subscriptions ───────────────────────────────────────────────────

    /// Subscribe an instrument. Returns `true` when the channel was live for
    /// immediate handling, `false` when the intent was queued for replay —
    /// either way the intent is durable until `disconnect()`.
    pub fn subscribe(&self, instrument: &str) -> bool {
        let connected = self.state() == ConnectionState::Connected;
        let _ = self
            .command_tx
            .send(Command::Subscribe(instrument.to_string()));
        connected
    }

    /// Drop an instrument subscription. Safe to call for instruments that
    /// were never subscribed.
    pub fn unsubscribe(&self, instrument: &str) -> bool {
        let connected = self.state() == ConnectionState::Connected;
        let _ = self
            .command_tx
            .send(Command::Unsubscribe(instrument.to_string()));
        connected
    }

    /// Fire-and-forget request for a fresh price. Returns `false` when not
    /// connected; there is never a guarantee of a response.
    pub fn request_live_price(&self, instrument: &str) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        let _ = self
            .command_tx
            .send(Command::LivePrice(instrument.to_string()));
        true
    }

    // ── Listeners & data access ─────────────────────────────────────────

    /// Register a market-data listener. The returned handle is the only way
    /// to unregister. If a tick for the instrument is already cached, the
    /// listener receives it immediately so late subscribers are not left
    /// without an initial value. Registering never causes a network
    /// subscribe — call [`MarketFeed::subscribe`] separately.
    pub fn add_market_data_listener<F>(&self, instrument: &str, callback: F) -> ListenerHandle
    where
        F: Fn(&Tick) + Send + Sync + 'static,
    {
        let callback: TickCallback = Arc::new(callback);
        if let Some(cached) = self.cache.last(instrument) {
            invoke_tick_listener(&callback, &cached.tick);
        }
        self.listeners.add_market_data(instrument, callback)
    }

    /// Register a global order-event listener.
    pub fn add_order_listener<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        self.listeners.add_order(Arc::new(callback))
    }

    /// Register a global portfolio-event listener.
    pub fn add_portfolio_listener<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        self.listeners.add_portfolio(Arc::new(callback))
    }

    /// Unregister any listener. Takes effect for all future deliveries and is
    /// safe for stale handles.
    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.listeners.remove(handle)
    }

    /// Last cached tick for an instrument, if any has flowed.
    pub fn last_tick(&self, instrument: &str) -> Option<CachedTick> {
        self.cache.last(instrument)
    }

    /// The candle aggregator feeding chart consumers.
    pub fn aggregator(&self) -> Arc<CandleAggregator> {
        self.aggregator.clone()
    }

    /// Track a chart series and seed it from the historical fetch. A failed
    /// fetch is non-fatal: the series simply starts from live ticks.
    pub async fn seed_from_history(
        &self,
        provider: &dyn HistoryProvider,
        instrument: &str,
        timeframe: &Timeframe,
        limit: u16,
    ) {
        self.aggregator.track(instrument, timeframe);
        match provider.fetch_candles(instrument, timeframe, limit).await {
            Ok(candles) => {
                info!(
                    symbol = %instrument,
                    timeframe = %timeframe,
                    count = candles.len(),
                    "chart series seeded from history"
                );
                self.aggregator.seed(instrument, timeframe, candles);
            }
            Err(err) => {
                warn!(
                    symbol = %instrument,
                    timeframe = %timeframe,
                    error = %err,
                    "historical seed unavailable — series starts from live ticks"
                );
            }
        }
    }
}

// =============================================================================
// Tests — the state machine driven end-to-end over a scripted transport
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::time::{sleep, Duration};

    use crate::error::FeedError;
    use crate::protocol::{ClientMessage, ServerMessage, SubscriptionAction, TickPayload};
    use crate::transport::TransportLink;

    // ── Scripted transport ──────────────────────────────────────────────

    struct MockShared {
        sent: Mutex<Vec<ClientMessage>>,
        opens: AtomicU32,
        fail_opens: AtomicU32,
        inbound: Mutex<Option<mpsc::UnboundedSender<Result<ServerMessage, FeedError>>>>,
    }

    #[derive(Clone)]
    struct MockTransport {
        shared: Arc<MockShared>,
    }

    impl MockTransport {
        fn new() -> Self {
            Self::failing(0)
        }

        /// Refuse the next `fail_opens` connection attempts.
        fn failing(fail_opens: u32) -> Self {
            Self {
                shared: Arc::new(MockShared {
                    sent: Mutex::new(Vec::new()),
                    opens: AtomicU32::new(0),
                    fail_opens: AtomicU32::new(fail_opens),
                    inbound: Mutex::new(None),
                }),
            }
        }

        fn set_failing(&self, fail_opens: u32) {
            self.shared.fail_opens.store(fail_opens, Ordering::SeqCst);
        }

        fn opens(&self) -> u32 {
            self.shared.opens.load(Ordering::SeqCst)
        }

        fn sent(&self) -> Vec<ClientMessage> {
            self.shared.sent.lock().clone()
        }

        fn sent_subscribes(&self) -> Vec<String> {
            self.sent()
                .into_iter()
                .filter_map(|message| match message {
                    ClientMessage::Subscribe { instrument } => Some(instrument),
                    _ => None,
                })
                .collect()
        }

        fn push_server(&self, message: ServerMessage) {
            if let Some(tx) = self.shared.inbound.lock().as_ref() {
                let _ = tx.send(Ok(message));
            }
        }

        fn push_protocol_error(&self) {
            if let Some(tx) = self.shared.inbound.lock().as_ref() {
                let _ = tx.send(Err(FeedError::Protocol("scripted garbage".to_string())));
            }
        }

        fn push_tick(&self, instrument: &str, price: f64, timestamp: i64) {
            self.push_server(ServerMessage::MarketData {
                instrument: instrument.to_string(),
                data: TickPayload {
                    price,
                    volume: Some(1.0),
                    timestamp,
                },
            });
        }
    }

    #[async_trait]
    impl crate::transport::Transport for MockTransport {
        async fn open(&self, _url: &str, _token: &str) -> Result<Box<dyn TransportLink>, FeedError> {
            // Let status observers run between state transitions.
            sleep(Duration::from_millis(1)).await;
            self.shared.opens.fetch_add(1, Ordering::SeqCst);

            if self.shared.fail_opens.load(Ordering::SeqCst) > 0 {
                self.shared.fail_opens.fetch_sub(1, Ordering::SeqCst);
                return Err(FeedError::Transport("scripted connect refusal".to_string()));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            *self.shared.inbound.lock() = Some(tx);
            Ok(Box::new(MockLink {
                shared: self.shared.clone(),
                rx,
            }))
        }
    }

    struct MockLink {
        shared: Arc<MockShared>,
        rx: mpsc::UnboundedReceiver<Result<ServerMessage, FeedError>>,
    }

    #[async_trait]
    impl TransportLink for MockLink {
        async fn send(&mut self, message: ClientMessage) -> Result<(), FeedError> {
            self.shared.sent.lock().push(message);
            Ok(())
        }

        async fn next(&mut self) -> Option<Result<ServerMessage, FeedError>> {
            self.rx.recv().await
        }

        async fn close(&mut self) {}
    }

    // ── Harness ─────────────────────────────────────────────────────────

    fn test_config() -> FeedConfig {
        let mut config = FeedConfig::default();
        config.feed_url = "wss://feed.test/stream".to_string();
        config.heartbeat_interval_secs = 5;
        config.max_missed_heartbeats = 3;
        config.reconnect_base_delay_ms = 1_000;
        config.max_reconnect_attempts = 2;
        config.candle_retention = 100;
        config
    }

    fn spawn_feed(transport: &MockTransport) -> (MarketFeed, SessionHandle) {
        let session = SessionHandle::with_token("test-token");
        let feed = MarketFeed::spawn(&test_config(), Arc::new(transport.clone()), &session);
        (feed, session)
    }

    /// Let the actor drain its queues (virtual time only).
    async fn settle() {
        sleep(Duration::from_millis(5)).await;
    }

    // ── Connection lifecycle ────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn connect_reaches_connected_and_is_idempotent() {
        let transport = MockTransport::new();
        let (feed, _session) = spawn_feed(&transport);
        assert_eq!(feed.state(), ConnectionState::Disconnected);

        feed.connect();
        feed.connect();
        settle().await;

        assert_eq!(feed.state(), ConnectionState::Connected);
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_without_credential_is_refused() {
        let transport = MockTransport::new();
        let session = SessionHandle::new();
        let feed = MarketFeed::spawn(&test_config(), Arc::new(transport.clone()), &session);

        feed.connect();
        settle().await;

        assert_eq!(feed.state(), ConnectionState::Disconnected);
        assert_eq!(transport.opens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn session_revocation_forces_disconnect() {
        let transport = MockTransport::new();
        let (feed, session) = spawn_feed(&transport);

        feed.connect();
        settle().await;
        assert_eq!(feed.state(), ConnectionState::Connected);

        session.revoke();
        settle().await;
        assert_eq!(feed.state(), ConnectionState::Disconnected);

        // No sneaky automatic reconnect afterwards.
        sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.opens(), 1);
        assert_eq!(feed.state(), ConnectionState::Disconnected);
    }

    // ── Subscription lifecycle ──────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn queued_subscriptions_replay_in_order_on_connect() {
        let transport = MockTransport::new();
        let (feed, _session) = spawn_feed(&transport);

        assert!(!feed.subscribe("AAA"));
        assert!(!feed.subscribe("BBB"));
        assert!(!feed.subscribe("CCC"));
        settle().await;
        assert!(transport.sent().is_empty());

        feed.connect();
        settle().await;

        assert_eq!(transport.sent_subscribes(), vec!["AAA", "BBB", "CCC"]);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_subscribe_sends_one_message() {
        let transport = MockTransport::new();
        let (feed, _session) = spawn_feed(&transport);

        feed.connect();
        settle().await;

        assert!(feed.subscribe("BTCUSDT"));
        feed.subscribe("BTCUSDT");
        settle().await;

        assert_eq!(transport.sent_subscribes(), vec!["BTCUSDT"]);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_unsubscribe_drops_the_intent_silently() {
        let transport = MockTransport::new();
        let (feed, _session) = spawn_feed(&transport);

        feed.subscribe("AAA");
        feed.subscribe("BBB");
        feed.unsubscribe("AAA");
        settle().await;

        feed.connect();
        settle().await;

        assert_eq!(transport.sent_subscribes(), vec!["BBB"]);
        // Nothing was ever sent for AAA, so no unsubscribe goes out either.
        assert!(!transport
            .sent()
            .iter()
            .any(|m| matches!(m, ClientMessage::Unsubscribe { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_while_connected_sends_immediately() {
        let transport = MockTransport::new();
        let (feed, _session) = spawn_feed(&transport);

        feed.connect();
        settle().await;
        feed.subscribe("BTCUSDT");
        settle().await;

        assert!(feed.unsubscribe("BTCUSDT"));
        settle().await;

        assert!(transport.sent().iter().any(|m| matches!(
            m,
            ClientMessage::Unsubscribe { instrument } if instrument == "BTCUSDT"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_clears_subscriptions_but_keeps_listeners() {
        let transport = MockTransport::new();
        let (feed, _session) = spawn_feed(&transport);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        feed.add_market_data_listener("BTCUSDT", move |tick: &Tick| sink.lock().push(tick.price));

        feed.connect();
        settle().await;
        feed.subscribe("BTCUSDT");
        settle().await;
        transport.push_server(ServerMessage::SubscriptionStatus {
            status: SubscriptionAction::Subscribed,
            instrument: "BTCUSDT".to_string(),
        });
        transport.push_tick("BTCUSDT", 100.0, 1_000);
        settle().await;
        assert_eq!(*seen.lock(), vec![100.0]);

        feed.disconnect();
        settle().await;
        assert_eq!(feed.state(), ConnectionState::Disconnected);

        // Reconnect: the subscription set was emptied, so nothing replays.
        feed.connect();
        settle().await;
        assert_eq!(transport.sent_subscribes(), vec!["BTCUSDT"]);

        // The listener survived: re-subscribing re-delivers to it.
        feed.subscribe("BTCUSDT");
        settle().await;
        assert_eq!(transport.sent_subscribes(), vec!["BTCUSDT", "BTCUSDT"]);
        transport.push_tick("BTCUSDT", 101.0, 2_000);
        settle().await;
        assert_eq!(*seen.lock(), vec![100.0, 101.0]);
    }

    // ── Data path ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn ticks_flow_to_cache_listeners_and_aggregator() {
        let transport = MockTransport::new();
        let (feed, _session) = spawn_feed(&transport);
        let timeframe = Timeframe::new("1m", 60);
        feed.aggregator().track("BTCUSDT", &timeframe);

        feed.connect();
        settle().await;
        feed.subscribe("BTCUSDT");
        settle().await;

        transport.push_tick("BTCUSDT", 100.0, 30_000);
        settle().await;

        assert_eq!(feed.last_tick("BTCUSDT").unwrap().tick.price, 100.0);
        let key = crate::market_data::SeriesKey::new("BTCUSDT", timeframe);
        let open = feed.aggregator().open_candle(&key).expect("candle open");
        assert_eq!(open.open_time, 0);
        assert_eq!(open.close, 100.0);

        // A listener attached after data started flowing gets the cached
        // value immediately instead of waiting for the next tick.
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        feed.add_market_data_listener("BTCUSDT", move |tick: &Tick| sink.lock().push(tick.price));
        assert_eq!(*seen.lock(), vec![100.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn protocol_error_drops_the_message_and_keeps_the_connection() {
        let transport = MockTransport::new();
        let (feed, _session) = spawn_feed(&transport);

        feed.connect();
        settle().await;

        transport.push_protocol_error();
        settle().await;
        assert_eq!(feed.state(), ConnectionState::Connected);
        assert_eq!(transport.opens(), 1);

        // The link still delivers afterwards.
        transport.push_tick("BTCUSDT", 42.0, 1_000);
        settle().await;
        assert_eq!(feed.last_tick("BTCUSDT").unwrap().tick.price, 42.0);
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_is_surfaced_without_dropping_the_connection() {
        let transport = MockTransport::new();
        let (feed, _session) = spawn_feed(&transport);
        let mut notifications = feed.notifications();

        feed.connect();
        settle().await;

        transport.push_server(ServerMessage::Error {
            message: "instrument unavailable".to_string(),
        });
        settle().await;

        assert_eq!(
            notifications.try_recv().unwrap(),
            FeedNotification::ServerError {
                message: "instrument unavailable".to_string()
            }
        );
        assert_eq!(feed.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn live_price_requires_a_connection() {
        let transport = MockTransport::new();
        let (feed, _session) = spawn_feed(&transport);

        assert!(!feed.request_live_price("BTCUSDT"));

        feed.connect();
        settle().await;
        assert!(feed.request_live_price("BTCUSDT"));
        settle().await;

        let live_requests = transport
            .sent()
            .iter()
            .filter(|m| matches!(m, ClientMessage::GetLivePrice { .. }))
            .count();
        assert_eq!(live_requests, 1);
    }

    // ── Liveness & recovery ─────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn heartbeat_timeout_triggers_reconnect() {
        let transport = MockTransport::new();
        let (feed, _session) = spawn_feed(&transport);

        let states = Arc::new(Mutex::new(Vec::new()));
        let mut status_rx = feed.status();
        let sink = states.clone();
        tokio::spawn(async move {
            while status_rx.changed().await.is_ok() {
                sink.lock().push(status_rx.borrow_and_update().state);
            }
        });

        feed.connect();
        settle().await;
        assert_eq!(feed.state(), ConnectionState::Connected);

        // Three heartbeat intervals elapse without an acknowledgement, then
        // the backoff delay runs out and the actor reconnects on its own.
        sleep(Duration::from_secs(17)).await;
        settle().await;

        assert_eq!(transport.opens(), 2);
        assert_eq!(feed.state(), ConnectionState::Connected);

        let seen = states.lock().clone();
        let error_at = seen
            .iter()
            .position(|s| *s == ConnectionState::Error)
            .expect("error state observed");
        assert!(
            seen[error_at..].contains(&ConnectionState::Connecting),
            "reconnect attempt should follow the error: {seen:?}"
        );

        let pings = transport
            .sent()
            .iter()
            .filter(|m| matches!(m, ClientMessage::Ping))
            .count();
        assert!(pings >= 2, "liveness probes should have been sent");
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_ack_resets_the_missed_counter() {
        let transport = MockTransport::new();
        let (feed, _session) = spawn_feed(&transport);

        feed.connect();
        settle().await;

        // Acknowledge every probe for a long stretch: the connection must
        // never be declared dead.
        for _ in 0..10 {
            sleep(Duration::from_secs(5)).await;
            transport.push_server(ServerMessage::Heartbeat);
            settle().await;
        }

        assert_eq!(transport.opens(), 1);
        assert_eq!(feed.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_budget_exhaustion_requires_manual_connect() {
        let transport = MockTransport::failing(u32::MAX);
        let (feed, _session) = spawn_feed(&transport);
        let mut notifications = feed.notifications();

        feed.connect();
        settle().await; // open #1 fails, backoff 1 s
        sleep(Duration::from_millis(1_100)).await; // open #2 fails, backoff 2 s
        sleep(Duration::from_millis(2_200)).await; // open #3 fails — budget spent
        sleep(Duration::from_secs(60)).await; // and nothing further happens

        assert_eq!(transport.opens(), 3);
        let status = feed.status().borrow().clone();
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.retries_exhausted);
        assert_eq!(
            notifications.try_recv().unwrap(),
            FeedNotification::ConnectionLost { attempts: 2 }
        );

        // A user-initiated connect() gets a fresh budget.
        transport.set_failing(0);
        feed.connect();
        settle().await;
        assert_eq!(feed.state(), ConnectionState::Connected);
        assert_eq!(transport.opens(), 4);
        assert!(!feed.status().borrow().retries_exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_end_triggers_backoff_and_replay() {
        let transport = MockTransport::new();
        let (feed, _session) = spawn_feed(&transport);

        feed.connect();
        settle().await;
        feed.subscribe("BTCUSDT");
        feed.subscribe("ETHUSDT");
        settle().await;

        // Server drops the stream: the sender half is replaced by nothing.
        *transport.shared.inbound.lock() = None;
        settle().await;
        assert_eq!(feed.state(), ConnectionState::Error);

        // After the base backoff the actor reconnects and replays both
        // subscriptions in their original order.
        sleep(Duration::from_millis(1_100)).await;
        assert_eq!(feed.state(), ConnectionState::Connected);
        assert_eq!(
            transport.sent_subscribes(),
            vec!["BTCUSDT", "ETHUSDT", "BTCUSDT", "ETHUSDT"]
        );
    }
}
