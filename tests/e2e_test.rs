// End-to-end cycles against the paper exchange with a scripted price stream

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ladderbot::api::{
    Balance, ExchangeGateway, OpenOrder, OrderAck, OrderDetail, OrderRequest, PaperExchange,
    StreamConnector, StreamMessage, StreamSession, Ticker,
};
use ladderbot::error::{FeedError, GatewayError};
use ladderbot::events::{CycleEvent, CycleObserver};
use ladderbot::execution::{CycleController, PriceFeed, PriceFeedConfig};
use ladderbot::{Instrument, OrderStatus, Settings};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

/// Hands out a single session fed from an mpsc channel
struct ChannelConnector {
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl ChannelConnector {
    fn new() -> (Self, mpsc::UnboundedSender<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

#[async_trait]
impl StreamConnector for ChannelConnector {
    async fn connect(&self) -> Result<Box<dyn StreamSession>, FeedError> {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| FeedError::Connection("stream already consumed".to_string()))?;
        Ok(Box::new(ChannelSession { rx }))
    }
}

struct ChannelSession {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl StreamSession for ChannelSession {
    async fn send_text(&mut self, _text: String) -> Result<(), FeedError> {
        Ok(())
    }

    async fn send_pong(&mut self, _payload: Vec<u8>) -> Result<(), FeedError> {
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Result<StreamMessage, FeedError>> {
        self.rx.recv().await.map(|text| Ok(StreamMessage::Text(text)))
    }

    async fn close(&mut self) {}
}

/// Delegates to the paper exchange, but balance reads always fail
struct BalanceOutage {
    inner: Arc<PaperExchange>,
}

#[async_trait]
impl ExchangeGateway for BalanceOutage {
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, GatewayError> {
        self.inner.get_ticker(symbol).await
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, GatewayError> {
        self.inner.get_open_orders(symbol).await
    }

    async fn get_order_detail(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderDetail, GatewayError> {
        self.inner.get_order_detail(symbol, order_id).await
    }

    async fn get_balances(&self) -> Result<Vec<Balance>, GatewayError> {
        Err(GatewayError::Api {
            status: 503,
            message: "Service unavailable".to_string(),
        })
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError> {
        self.inner.submit_order(request).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError> {
        self.inner.cancel_order(symbol, order_id).await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), GatewayError> {
        self.inner.cancel_all_orders(symbol).await
    }
}

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<CycleEvent>>,
    /// Signalled on the first failed cycle
    stop_on_failure: Option<broadcast::Sender<()>>,
}

impl RecordingObserver {
    fn stopping_on_failure(shutdown: broadcast::Sender<()>) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            stop_on_failure: Some(shutdown),
        }
    }

    fn count(&self, pred: impl Fn(&CycleEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    fn exit_orders(&self) -> Vec<(f64, OrderStatus)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                CycleEvent::ExitOrderSubmitted { price, status, .. } => Some((*price, *status)),
                _ => None,
            })
            .collect()
    }

    fn residual(&self) -> Vec<f64> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                CycleEvent::ResidualExposure { quantity } => Some(*quantity),
                _ => None,
            })
            .collect()
    }
}

impl CycleObserver for RecordingObserver {
    fn on_event(&self, event: &CycleEvent) {
        if let (CycleEvent::CycleFailed { .. }, Some(tx)) = (event, &self.stop_on_failure) {
            let _ = tx.send(());
        }
        self.events.lock().unwrap().push(event.clone());
    }
}

fn ticker(price: f64) -> String {
    format!(r#"{{"e":"ticker","s":"SOL_USDC","c":"{}"}}"#, price)
}

async fn balance_of(exchange: &PaperExchange, asset: &str) -> f64 {
    let balances = tokio_test::assert_ok!(exchange.get_balances().await);
    balances
        .iter()
        .find(|b| b.asset == asset)
        .map(|b| b.available().unwrap())
        .unwrap_or(0.0)
}

/// Stream and book start at 100, dip to 97 (filling rungs two and three),
/// then the stream recovers to 106 while the book moves to `book_exit_price`.
fn spawn_dip_and_recover(
    exchange: Arc<PaperExchange>,
    prices: mpsc::UnboundedSender<String>,
    book_exit_price: f64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        prices.send(ticker(100.0)).unwrap();

        sleep(Duration::from_secs(60)).await;
        exchange.set_price(97.0).await;
        prices.send(ticker(97.0)).unwrap();

        sleep(Duration::from_secs(60)).await;
        exchange.set_price(book_exit_price).await;
        prices.send(ticker(106.0)).unwrap();

        sleep(Duration::from_secs(3600)).await;
        drop(prices);
    })
}

fn paper_exchange(quote_balance: f64) -> Arc<PaperExchange> {
    Arc::new(PaperExchange::offline(
        Instrument::new("SOL", "USDC"),
        quote_balance,
        100.0,
    ))
}

fn single_cycle_settings() -> Settings {
    let mut settings = Settings::default();
    settings.actions.restart_after_take_profit = false;
    settings
}

#[tokio::test(start_paused = true)]
async fn test_full_cycle_buys_the_dip_and_takes_profit() {
    let exchange = paper_exchange(2000.0);
    let (connector, prices) = ChannelConnector::new();
    let observer = Arc::new(RecordingObserver::default());
    let driver = spawn_dip_and_recover(exchange.clone(), prices, 106.0);

    let mut controller = CycleController::new(
        single_cycle_settings(),
        exchange.clone(),
        Arc::new(connector),
        observer.clone(),
    );
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let summary = controller.run(shutdown_rx).await;
    driver.abort();

    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.take_profits, 1);
    assert_eq!(summary.last_stats.total_orders, 5);
    assert_eq!(summary.last_stats.filled_orders, 3);
    let average = summary.last_stats.average_price.unwrap();
    assert!(average > 97.5 && average < 100.0, "average {}", average);

    // Position sold down to less than one quantity step, at a profit
    assert!(balance_of(&exchange, "SOL").await < 0.01);
    assert!(balance_of(&exchange, "USDC").await > 2000.0);

    assert_eq!(
        observer.count(|e| matches!(e, CycleEvent::TakeProfitTriggered { .. })),
        1
    );
    assert_eq!(
        observer.count(|e| matches!(e, CycleEvent::FillDetected { .. })),
        3
    );
    assert!(observer.residual().is_empty());
    let exits = observer.exit_orders();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].1, OrderStatus::Filled);
}

#[tokio::test(start_paused = true)]
async fn test_missed_first_exit_sells_again_at_deeper_discount() {
    // Book sits between the 0.5% and 1% discounted prices
    let exchange = paper_exchange(2000.0);
    let (connector, prices) = ChannelConnector::new();
    let observer = Arc::new(RecordingObserver::default());
    let driver = spawn_dip_and_recover(exchange.clone(), prices, 105.0);

    let mut controller = CycleController::new(
        single_cycle_settings(),
        exchange.clone(),
        Arc::new(connector),
        observer.clone(),
    );
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let summary = controller.run(shutdown_rx).await;
    driver.abort();

    assert_eq!(summary.take_profits, 1);
    let exits = observer.exit_orders();
    assert_eq!(exits.len(), 2);
    assert!((exits[0].0 - 105.47).abs() < 0.01, "first exit at {}", exits[0].0);
    assert_eq!(exits[0].1, OrderStatus::Expired);
    assert!((exits[1].0 - 104.94).abs() < 0.01, "second exit at {}", exits[1].0);
    assert_eq!(exits[1].1, OrderStatus::Filled);

    assert!(observer.residual().is_empty());
    assert!(balance_of(&exchange, "SOL").await < 0.01);
}

#[tokio::test(start_paused = true)]
async fn test_both_exit_sells_missing_reports_residual_once() {
    // Book far below both discounted sell prices
    let exchange = paper_exchange(2000.0);
    let (connector, prices) = ChannelConnector::new();
    let observer = Arc::new(RecordingObserver::default());
    let driver = spawn_dip_and_recover(exchange.clone(), prices, 100.0);

    let mut controller = CycleController::new(
        single_cycle_settings(),
        exchange.clone(),
        Arc::new(connector),
        observer.clone(),
    );
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let summary = controller.run(shutdown_rx).await;
    driver.abort();

    assert_eq!(summary.cycles, 1);
    let exits = observer.exit_orders();
    assert_eq!(exits.len(), 2, "no third sell after the deeper discount");
    assert!(exits.iter().all(|(_, status)| *status == OrderStatus::Expired));

    let residual = observer.residual();
    assert_eq!(residual.len(), 1);
    let held = balance_of(&exchange, "SOL").await;
    assert!(held > 1.0);
    assert!((residual[0] - held).abs() < 0.01);
}

#[tokio::test(start_paused = true)]
async fn test_failed_exit_is_not_counted_as_take_profit() {
    let exchange = paper_exchange(2000.0);
    let (connector, prices) = ChannelConnector::new();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let observer = Arc::new(RecordingObserver::stopping_on_failure(shutdown_tx));
    let driver = spawn_dip_and_recover(exchange.clone(), prices, 106.0);

    let gateway = Arc::new(BalanceOutage {
        inner: exchange.clone(),
    });
    let mut controller = CycleController::new(
        single_cycle_settings(),
        gateway,
        Arc::new(connector),
        observer.clone(),
    );
    let summary = controller.run(shutdown_rx).await;
    driver.abort();

    assert_eq!(
        observer.count(|e| matches!(e, CycleEvent::TakeProfitTriggered { .. })),
        1
    );
    assert_eq!(
        observer.count(|e| matches!(e, CycleEvent::CycleFailed { .. })),
        1
    );
    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.take_profits, 0);
    assert!(observer.exit_orders().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_short_balance_halts_placement_and_keeps_position() {
    let exchange = paper_exchange(300.0);
    let (connector, prices) = ChannelConnector::new();
    let observer = Arc::new(RecordingObserver::default());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    tokio::spawn(async move {
        prices.send(ticker(100.0)).unwrap();
        sleep(Duration::from_secs(90)).await;
        let _ = shutdown_tx.send(());
        sleep(Duration::from_secs(3600)).await;
        drop(prices);
    });

    let mut controller = CycleController::new(
        single_cycle_settings(),
        exchange.clone(),
        Arc::new(connector),
        observer.clone(),
    );
    let summary = controller.run(shutdown_rx).await;

    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.take_profits, 0);
    assert_eq!(summary.last_stats.filled_orders, 1);
    assert_eq!(
        observer.count(|e| matches!(e, CycleEvent::PlacementHalted { placed: 1, .. })),
        1
    );
    // Nothing sold on shutdown
    assert!(balance_of(&exchange, "SOL").await > 1.0);
}

#[tokio::test]
#[ignore] // Requires live API
async fn test_live_price_stream() {
    let connector = Arc::new(ladderbot::api::WsConnector::default());
    let mut feed = PriceFeed::new(connector, PriceFeedConfig::new("SOL_USDC"));
    let mut prices = feed.subscribe_price();
    feed.start();

    let sample = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            prices.changed().await.unwrap();
            if let Some(sample) = prices.borrow().clone() {
                return sample;
            }
        }
    })
    .await
    .expect("no price within 30s");

    feed.stop().await;
    assert!(sample.price > 0.0);
}
