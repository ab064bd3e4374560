//! Venue WebSocket connectors.
//!
//! One generic supervisor (`Connector`) owns the socket lifecycle: connect,
//! subscribe, read frames, keepalive, reconnect with exponential backoff.
//! Everything venue-specific lives in a `VenueDriver` value: the endpoint,
//! the subscription payload, and the frame parser that normalizes trades.

pub mod binance;
pub mod bybit;
pub mod coinbase;
pub mod kraken;
pub mod okx;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::bars::BarBuilder;
use crate::models::{
    Asset, Bar, ConnectionState, MarketType, Trade, VenueId, VenueTelemetry,
};

pub use binance::BinanceDriver;
pub use bybit::BybitDriver;
pub use coinbase::CoinbaseDriver;
pub use kraken::KrakenDriver;
pub use okx::OkxDriver;

const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(20);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Silence window after which a connected venue no longer counts as up.
const UPTIME_SILENCE_MS: i64 = 30_000;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("websocket transport: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("server closed the stream")]
    StreamClosed,
    #[error("pong not received within {0:?}")]
    PongTimeout(Duration),
}

/// Venue-specific capabilities, as a value rather than a subclass.
pub trait VenueDriver: Send + Sync {
    fn venue(&self) -> VenueId;
    fn asset(&self) -> Asset;
    fn market_type(&self) -> MarketType;

    /// Full WebSocket URL to dial.
    fn ws_url(&self) -> String;

    /// Subscription frame to send after connect, if the venue needs one.
    fn subscribe_message(&self) -> Option<String>;

    /// Parse one inbound text frame into zero or more normalized trades.
    ///
    /// Administrative frames (acks, heartbeats) yield an empty list; symbol
    /// mismatches and non-positive prices or quantities are dropped.
    fn parse_message(&self, text: &str, local_timestamp_ms: i64) -> Vec<Trade>;
}

#[derive(Default)]
struct ConnectorCounters {
    // 0 means "never".
    last_message_time_ms: AtomicI64,
    session_start_time_ms: AtomicI64,
    message_count: AtomicU64,
    trade_count: AtomicU64,
    reconnect_count: AtomicU64,
}

/// Shared connector state, mutated only by the supervising task and read by
/// the aggregator tick.
struct ConnectorShared {
    driver: Arc<dyn VenueDriver>,
    state: RwLock<ConnectionState>,
    counters: ConnectorCounters,
    bar_builder: Mutex<BarBuilder>,
}

impl ConnectorShared {
    fn log_prefix(&self) -> String {
        format!(
            "[{}/{}/{}]",
            self.driver.venue(),
            self.driver.market_type(),
            self.driver.asset()
        )
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }
}

/// A long-lived subscription to one venue's trade stream, feeding a bar
/// builder. Owned by the aggregator.
pub struct Connector {
    shared: Arc<ConnectorShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Connector {
    pub fn new(driver: Arc<dyn VenueDriver>) -> Self {
        let bar_builder = BarBuilder::new(driver.venue(), driver.asset(), driver.market_type());
        Self {
            shared: Arc::new(ConnectorShared {
                driver,
                state: RwLock::new(ConnectionState::Disconnected),
                counters: ConnectorCounters::default(),
                bar_builder: Mutex::new(bar_builder),
            }),
            task: Mutex::new(None),
        }
    }

    /// Install the completed-bar hook. Must be called before `start`.
    pub fn set_on_bar_complete<F>(&self, hook: F)
    where
        F: Fn(&Bar) + Send + Sync + 'static,
    {
        self.shared.bar_builder.lock().set_on_bar_complete(hook);
    }

    /// Spawn the supervising task: connect, stream, reconnect forever.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            warn!("{} already running", self.shared.log_prefix());
            return;
        }

        self.shared
            .counters
            .session_start_time_ms
            .store(crate::models::now_ms(), Ordering::Relaxed);

        let shared = self.shared.clone();
        *task = Some(tokio::spawn(async move {
            run_loop(shared).await;
        }));
        info!("{} started", self.shared.log_prefix());
    }

    /// Stop the connector. The supervising task is cancelled at its next
    /// suspension point; no callbacks fire after this returns.
    pub async fn stop(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.shared.set_state(ConnectionState::Disconnected);
        info!("{} stopped", self.shared.log_prefix());
    }

    pub fn venue(&self) -> VenueId {
        self.shared.driver.venue()
    }

    pub fn asset(&self) -> Asset {
        self.shared.driver.asset()
    }

    pub fn market_type(&self) -> MarketType {
        self.shared.driver.market_type()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.state.read() == ConnectionState::Connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Receipt time of the most recent message (ms), if any.
    pub fn last_update_time(&self) -> Option<i64> {
        match self.shared.counters.last_message_time_ms.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }

    /// Close of the forming bar.
    pub fn current_price(&self) -> Option<f64> {
        self.shared.bar_builder.lock().current_price()
    }

    pub fn partial_bar(&self) -> Option<Bar> {
        self.shared.bar_builder.lock().partial_bar()
    }

    pub fn latest_bar(&self) -> Option<Bar> {
        self.shared.bar_builder.lock().latest_bar().cloned()
    }

    pub fn telemetry(&self, now_ms: i64) -> VenueTelemetry {
        let counters = &self.shared.counters;
        let state = self.connection_state();
        let last_message_time = self.last_update_time();
        let session_start = match counters.session_start_time_ms.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        };

        let session_duration_ms = session_start.map(|s| (now_ms - s).max(0)).unwrap_or(0);

        let uptime_percent = match (state, last_message_time) {
            (ConnectionState::Connected, Some(last)) if now_ms - last < UPTIME_SILENCE_MS => 100.0,
            _ => 0.0,
        };

        let message_count = counters.message_count.load(Ordering::Relaxed);
        let avg_message_rate = if session_duration_ms > 0 {
            message_count as f64 / (session_duration_ms as f64 / 1000.0)
        } else {
            0.0
        };

        VenueTelemetry {
            venue: self.venue(),
            asset: self.asset(),
            market_type: self.market_type(),
            connection_state: state,
            last_message_time,
            message_count,
            trade_count: counters.trade_count.load(Ordering::Relaxed),
            reconnect_count: counters.reconnect_count.load(Ordering::Relaxed),
            session_start_time: session_start,
            uptime_percent,
            avg_message_rate,
        }
    }
}

async fn run_loop(shared: Arc<ConnectorShared>) {
    let prefix = shared.log_prefix();
    let mut backoff = RECONNECT_INITIAL_DELAY;

    loop {
        match connect_and_stream(&shared, &mut backoff).await {
            Ok(()) => {
                info!("{prefix} connection closed gracefully");
            }
            Err(e) => {
                shared.set_state(ConnectionState::Error);
                warn!("{prefix} connection error: {e}");
            }
        }

        shared.set_state(ConnectionState::Disconnected);
        shared.counters.reconnect_count.fetch_add(1, Ordering::Relaxed);

        info!(
            "{prefix} reconnecting in {:?} (attempt {})",
            backoff,
            shared.counters.reconnect_count.load(Ordering::Relaxed)
        );
        sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_MAX_DELAY);
    }
}

async fn connect_and_stream(
    shared: &Arc<ConnectorShared>,
    backoff: &mut Duration,
) -> Result<(), FeedError> {
    let prefix = shared.log_prefix();
    let url = shared.driver.ws_url();

    shared.set_state(ConnectionState::Connecting);
    debug!("{prefix} connecting to {url}");

    let (ws, _response) = timeout(CONNECT_TIMEOUT, connect_async(&url))
        .await
        .map_err(|_| FeedError::ConnectTimeout)??;

    shared.set_state(ConnectionState::Connected);
    // Delay resets on every successful connection.
    *backoff = RECONNECT_INITIAL_DELAY;
    info!("{prefix} connected");

    let (mut write, mut read) = ws.split();

    if let Some(sub) = shared.driver.subscribe_message() {
        debug!("{prefix} sending subscription: {sub}");
        write.send(Message::Text(sub)).await?;
    }

    let mut ping_timer = interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; treat it as the post-connect ping.
    let mut pong_deadline: Option<Instant> = None;

    loop {
        let pong_wait = async move {
            match pong_deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = ping_timer.tick() => {
                write.send(Message::Ping(Vec::new())).await?;
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + PONG_TIMEOUT);
                }
            }
            _ = pong_wait => {
                let _ = timeout(CLOSE_TIMEOUT, write.send(Message::Close(None))).await;
                return Err(FeedError::PongTimeout(PONG_TIMEOUT));
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_message(shared, &text);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        write.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_deadline = None;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("{prefix} server close: {frame:?}");
                        return Ok(());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        debug!("{prefix} ignoring binary frame ({} bytes)", data.len());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(FeedError::StreamClosed),
                }
            }
        }
    }
}

fn handle_message(shared: &Arc<ConnectorShared>, text: &str) {
    let now_ms = crate::models::now_ms();
    shared.counters.message_count.fetch_add(1, Ordering::Relaxed);
    shared
        .counters
        .last_message_time_ms
        .store(now_ms, Ordering::Relaxed);

    let trades = shared.driver.parse_message(text, now_ms);
    if trades.is_empty() {
        return;
    }

    let mut builder = shared.bar_builder.lock();
    for trade in &trades {
        shared.counters.trade_count.fetch_add(1, Ordering::Relaxed);
        builder.add_trade(trade);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TakerSide;

    struct NullDriver;

    impl VenueDriver for NullDriver {
        fn venue(&self) -> VenueId {
            VenueId::Binance
        }
        fn asset(&self) -> Asset {
            Asset::Btc
        }
        fn market_type(&self) -> MarketType {
            MarketType::Spot
        }
        fn ws_url(&self) -> String {
            "wss://localhost:1/never".to_string()
        }
        fn subscribe_message(&self) -> Option<String> {
            None
        }
        fn parse_message(&self, text: &str, local_timestamp_ms: i64) -> Vec<Trade> {
            // One synthetic trade per frame for plumbing tests.
            text.parse::<f64>()
                .ok()
                .map(|price| Trade {
                    timestamp: local_timestamp_ms,
                    local_timestamp: local_timestamp_ms,
                    price,
                    quantity: 1.0,
                    taker_side: TakerSide::Buy,
                    venue: VenueId::Binance,
                    asset: Asset::Btc,
                    market_type: MarketType::Spot,
                })
                .into_iter()
                .collect()
        }
    }

    #[test]
    fn test_handle_message_updates_counters_and_builder() {
        let connector = Connector::new(Arc::new(NullDriver));
        handle_message(&connector.shared, "not-a-trade");
        handle_message(&connector.shared, "45000.5");

        let telemetry = connector.telemetry(crate::models::now_ms());
        assert_eq!(telemetry.message_count, 2);
        assert_eq!(telemetry.trade_count, 1);
        assert_eq!(connector.current_price(), Some(45_000.5));
        assert!(connector.last_update_time().is_some());
    }

    #[test]
    fn test_telemetry_uptime_zero_when_disconnected() {
        let connector = Connector::new(Arc::new(NullDriver));
        handle_message(&connector.shared, "45000.5");
        let telemetry = connector.telemetry(crate::models::now_ms());
        assert_eq!(telemetry.connection_state, ConnectionState::Disconnected);
        assert_eq!(telemetry.uptime_percent, 0.0);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let connector = Connector::new(Arc::new(NullDriver));
        connector.stop().await;
        assert_eq!(connector.connection_state(), ConnectionState::Disconnected);
    }
}
