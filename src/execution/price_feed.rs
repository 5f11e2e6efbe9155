use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Duration, Instant, MissedTickBehavior};

use crate::api::{StreamConnector, StreamMessage, StreamSession};
use crate::models::PriceSample;

const MAX_BACKOFF_SECS: u64 = 60;
const MIN_HEARTBEAT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct PriceFeedConfig {
    /// Exchange symbol, e.g. SOL_USDC
    pub symbol: String,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub max_reconnect_attempts: u32,
}

impl PriceFeedConfig {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            heartbeat_interval: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    /// `permanent` is set once the reconnect budget is exhausted; only a
    /// fresh `start()` leaves that state.
    Disconnected { permanent: bool },
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// Streaming last-price feed for one instrument.
///
/// The background task is the only writer of the price sample; readers get
/// price and timestamp together from a single `watch` snapshot.
pub struct PriceFeed {
    connector: Arc<dyn StreamConnector>,
    config: PriceFeedConfig,
    price_tx: watch::Sender<Option<PriceSample>>,
    state_tx: watch::Sender<FeedState>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PriceFeed {
    pub fn new(connector: Arc<dyn StreamConnector>, config: PriceFeedConfig) -> Self {
        let (price_tx, _) = watch::channel(None);
        let (state_tx, _) = watch::channel(FeedState::Disconnected { permanent: false });
        Self {
            connector,
            config,
            price_tx,
            state_tx,
            shutdown_tx: None,
            task: None,
        }
    }

    /// Spawn the connection task. A no-op while a task is already running.
    pub fn start(&mut self) {
        if self.task.as_ref().is_some_and(|t| !t.is_finished()) {
            tracing::debug!(symbol = %self.config.symbol, "Price feed already running");
            return;
        }

        self.price_tx.send_replace(None);
        self.state_tx
            .send_replace(FeedState::Disconnected { permanent: false });

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker = FeedWorker {
            connector: self.connector.clone(),
            config: self.config.clone(),
            price_tx: self.price_tx.clone(),
            state_tx: self.state_tx.clone(),
        };
        self.task = Some(tokio::spawn(worker.run(shutdown_rx)));
        self.shutdown_tx = Some(shutdown_tx);
    }

    /// Close the connection and wait for the task to exit. No reconnect
    /// is attempted after this returns.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Price feed task ended abnormally: {}", e);
            }
        }
        self.state_tx
            .send_replace(FeedState::Disconnected { permanent: false });
    }

    pub fn state(&self) -> FeedState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<FeedState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_price(&self) -> watch::Receiver<Option<PriceSample>> {
        self.price_tx.subscribe()
    }

    pub fn latest(&self) -> Option<PriceSample> {
        self.price_tx.borrow().clone()
    }

    /// Latest sample, or `None` if it is older than `max_age`
    pub fn fresh_price(&self, max_age: chrono::Duration) -> Option<PriceSample> {
        self.latest().filter(|s| s.is_fresh(Utc::now(), max_age))
    }

    pub fn clear_price(&self) {
        self.price_tx.send_replace(None);
    }

    /// Fill an empty slot with `sample`. A sample already delivered by the
    /// stream is never overwritten. Returns whether the sample was stored.
    pub fn seed(&self, sample: PriceSample) -> bool {
        self.price_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(sample);
            true
        })
    }

    /// True once no more prices will arrive without a new `start()`: the
    /// reconnect budget is spent or the task ended on its own.
    pub fn has_failed(&self) -> bool {
        self.state() == (FeedState::Disconnected { permanent: true })
            || self.task.as_ref().is_some_and(|t| t.is_finished())
    }
}

enum SessionEnd {
    Shutdown,
    Dropped { received_price: bool },
}

struct FeedWorker {
    connector: Arc<dyn StreamConnector>,
    config: PriceFeedConfig,
    price_tx: watch::Sender<Option<PriceSample>>,
    state_tx: watch::Sender<FeedState>,
}

impl FeedWorker {
    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let symbol = self.config.symbol.clone();
        let mut attempts: u32 = 0;

        loop {
            self.state_tx.send_replace(FeedState::Connecting);

            let connected = tokio::select! {
                _ = shutdown.recv() => break,
                result = timeout(self.config.connect_timeout, self.connector.connect()) => result,
            };

            let healthy = match connected {
                Ok(Ok(mut session)) => {
                    self.state_tx.send_replace(FeedState::Connected);
                    let end = self.run_session(session.as_mut(), &mut shutdown).await;
                    session.close().await;
                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Dropped { received_price } => received_price,
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(symbol = %symbol, error = %e, "Price stream connect failed");
                    false
                }
                Err(_) => {
                    tracing::warn!(
                        symbol = %symbol,
                        timeout_secs = self.config.connect_timeout.as_secs(),
                        "Price stream connect timed out"
                    );
                    false
                }
            };

            // A session that delivered data resets the budget
            if healthy {
                attempts = 0;
            }
            attempts += 1;

            if attempts > self.config.max_reconnect_attempts {
                tracing::error!(
                    symbol = %symbol,
                    max_attempts = self.config.max_reconnect_attempts,
                    "Price stream reconnect attempts exhausted, giving up"
                );
                self.state_tx
                    .send_replace(FeedState::Disconnected { permanent: true });
                return;
            }

            let backoff = reconnect_backoff(attempts);
            self.state_tx
                .send_replace(FeedState::Reconnecting { attempt: attempts });
            tracing::warn!(
                symbol = %symbol,
                attempt = attempts,
                max_attempts = self.config.max_reconnect_attempts,
                backoff_secs = backoff.as_secs(),
                "Price stream dropped, reconnecting"
            );

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = sleep(backoff) => {}
            }
        }

        self.state_tx
            .send_replace(FeedState::Disconnected { permanent: false });
        tracing::info!(symbol = %symbol, "Price feed stopped");
    }

    async fn run_session(
        &self,
        session: &mut dyn StreamSession,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> SessionEnd {
        let symbol = &self.config.symbol;
        let mut received_price = false;

        let subscribe = serde_json::json!({
            "method": "SUBSCRIBE",
            "params": [format!("ticker.{}", symbol)],
            "id": Utc::now().timestamp_millis(),
        });
        if let Err(e) = session.send_text(subscribe.to_string()).await {
            tracing::warn!(symbol = %symbol, error = %e, "Ticker subscribe failed");
            return SessionEnd::Dropped { received_price };
        }
        tracing::info!(symbol = %symbol, "Subscribed to ticker stream");

        let period = self.config.heartbeat_interval.max(MIN_HEARTBEAT);
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => return SessionEnd::Shutdown,
                _ = heartbeat.tick() => {
                    let ping = serde_json::json!({
                        "method": "PING",
                        "id": Utc::now().timestamp_millis(),
                    });
                    if let Err(e) = session.send_text(ping.to_string()).await {
                        tracing::warn!(symbol = %symbol, error = %e, "Heartbeat send failed");
                        return SessionEnd::Dropped { received_price };
                    }
                }
                message = session.next_message() => match message {
                    Some(Ok(StreamMessage::Text(text))) => {
                        if let Some(price) = match_ticker_price(&text, symbol) {
                            self.price_tx.send_replace(Some(PriceSample::from_stream(price)));
                            received_price = true;
                            tracing::trace!(symbol = %symbol, price, "Price update");
                        }
                    }
                    Some(Ok(StreamMessage::Ping(payload))) => {
                        if let Err(e) = session.send_pong(payload).await {
                            tracing::warn!(symbol = %symbol, error = %e, "Pong send failed");
                            return SessionEnd::Dropped { received_price };
                        }
                    }
                    Some(Ok(StreamMessage::Pong)) => {
                        tracing::trace!("Received pong");
                    }
                    Some(Ok(StreamMessage::Close)) | None => {
                        return SessionEnd::Dropped { received_price };
                    }
                    Some(Err(e)) => {
                        tracing::warn!(symbol = %symbol, error = %e, "Price stream error");
                        return SessionEnd::Dropped { received_price };
                    }
                },
            }
        }
    }
}

/// 2^attempt seconds, capped
fn reconnect_backoff(attempt: u32) -> Duration {
    let secs = 2u64.saturating_pow(attempt).min(MAX_BACKOFF_SECS);
    Duration::from_secs(secs)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(f64),
    Text(String),
}

impl NumberOrString {
    fn value(&self) -> Option<f64> {
        match self {
            NumberOrString::Number(v) => Some(*v),
            NumberOrString::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TickerData {
    s: String,
    c: NumberOrString,
}

/// The ticker shapes seen on the wire
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TickerPayload {
    Envelope { stream: String, data: TickerData },
    Event { e: String, s: String, c: NumberOrString },
    Generic { symbol: String, price: NumberOrString },
}

/// Extract a last price for `symbol` from a stream message, if it is one.
///
/// Subscribe acks, PONG results and other instruments' tickers yield `None`.
pub fn match_ticker_price(text: &str, symbol: &str) -> Option<f64> {
    let payload: TickerPayload = serde_json::from_str(text).ok()?;

    let (payload_symbol, price) = match &payload {
        TickerPayload::Envelope { stream, data } if stream.contains("ticker") => (&data.s, &data.c),
        TickerPayload::Event { e, s, c } if e == "ticker" => (s, c),
        TickerPayload::Generic { symbol, price } => (symbol, price),
        _ => return None,
    };

    if !payload_symbol.eq_ignore_ascii_case(symbol) {
        return None;
    }

    price.value().filter(|p| p.is_finite() && *p > 0.0)
}
