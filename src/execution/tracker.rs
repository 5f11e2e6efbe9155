use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use super::CycleState;
use crate::api::{ExchangeGateway, OrderAck, OrderRequest, RetryExecutor};
use crate::error::{CycleError, ExchangeCallError, TrackerError};
use crate::events::{CycleEvent, CycleObserver};
use crate::models::{
    Instrument, OrderPlan, OrderSide, OrderStatus, OrderType, TimeInForce, TrackedOrder,
};
use crate::strategy::{adjust_price, adjust_quantity, format_decimal, InstrumentSpec};

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Placed(String),
    /// Same price/quantity already submitted this cycle; nothing was sent
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Snapshot fetch failed; state untouched
    Skipped,
    Updated { newly_filled: u32 },
}

/// Submits ladder orders and infers fills by diffing resting-order snapshots.
///
/// An order that was resting and no longer is counts as filled. That cannot
/// tell a fill from an out-of-band cancel; with `verify_fills` set, vanished
/// orders are cross-checked against the order detail endpoint first.
pub struct OrderTracker<G> {
    gateway: Arc<G>,
    retry: RetryExecutor,
    instrument: Instrument,
    spec: InstrumentSpec,
    verify_fills: bool,
    observer: Arc<dyn CycleObserver>,
}

impl<G: ExchangeGateway> OrderTracker<G> {
    pub fn new(
        gateway: Arc<G>,
        retry: RetryExecutor,
        instrument: Instrument,
        spec: InstrumentSpec,
        observer: Arc<dyn CycleObserver>,
    ) -> Self {
        Self {
            gateway,
            retry,
            instrument,
            spec,
            verify_fills: false,
            observer,
        }
    }

    pub fn with_fill_verification(mut self, enabled: bool) -> Self {
        self.verify_fills = enabled;
        self
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn spec(&self) -> &InstrumentSpec {
        &self.spec
    }

    /// Place one limit buy (GTC) from the ladder.
    pub async fn submit_buy(
        &self,
        state: &mut CycleState,
        plan: &OrderPlan,
    ) -> Result<SubmitOutcome, TrackerError> {
        let price = adjust_price(plan.price, &self.spec);
        let quantity = adjust_quantity(plan.quantity, &self.spec);
        let price_str = format_decimal(price, self.spec.price_precision);
        let quantity_str = format_decimal(quantity, self.spec.quantity_precision);

        let signature = format!("{}_{}", price_str, quantity_str);
        if state.signatures.contains(&signature) {
            self.observer
                .on_event(&CycleEvent::DuplicateOrderSkipped { price, quantity });
            return Ok(SubmitOutcome::Duplicate);
        }

        let request = OrderRequest {
            symbol: self.instrument.symbol(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity: quantity_str,
            price: price_str,
            time_in_force: TimeInForce::GoodTillCancelled,
        };

        let ack = self
            .retry
            .execute("submit_order", || self.gateway.submit_order(&request))
            .await
            .map_err(TrackerError::from_call)?;

        state.signatures.insert(signature);

        let amount = price * quantity;
        state.orders.insert(
            ack.id.clone(),
            TrackedOrder {
                id: ack.id.clone(),
                price,
                quantity,
                amount,
                side: OrderSide::Buy,
                created_at: Utc::now(),
                processed: false,
                status: ack.status,
            },
        );
        state.created_ids.push(ack.id.clone());
        state.stats.total_orders += 1;

        self.observer.on_event(&CycleEvent::OrderPlaced {
            order_id: ack.id.clone(),
            price,
            quantity,
            status: ack.status,
        });

        if ack.status == OrderStatus::Filled {
            self.fold(state, &ack.id, amount, quantity);
        } else {
            state.pending.insert(ack.id.clone());
        }

        Ok(SubmitOutcome::Placed(ack.id))
    }

    /// Diff the resting-order snapshot against the pending set and fold
    /// every newly vanished order into the fill statistics.
    pub async fn reconcile(&self, state: &mut CycleState) -> ReconcileOutcome {
        let symbol = self.instrument.symbol();
        let snapshot = match self
            .retry
            .execute("get_open_orders", || self.gateway.get_open_orders(&symbol))
            .await
        {
            Ok(orders) => orders,
            Err(e) => {
                tracing::warn!(symbol = %symbol, error = %e, "Open orders fetch failed, keeping previous state");
                self.observer.on_event(&CycleEvent::ReconciliationSkipped {
                    error: e.to_string(),
                });
                return ReconcileOutcome::Skipped;
            }
        };

        let current: HashSet<String> = snapshot.into_iter().map(|o| o.id).collect();

        // Nothing pending yet: diff everything created this cycle
        let previous: Vec<String> = if state.pending.is_empty() {
            state.created_ids.clone()
        } else {
            state.pending.iter().cloned().collect()
        };

        let mut missing: Vec<String> = previous
            .into_iter()
            .filter(|id| !current.contains(id))
            .collect();
        missing.sort();
        missing.dedup();

        let mut newly_filled = 0;
        for order_id in missing {
            if state.is_processed(&order_id) {
                continue;
            }
            if self.resolve_vanished(state, &order_id).await {
                newly_filled += 1;
            }
        }

        state.pending = current;
        state.stats.last_update_time = Some(Utc::now());

        ReconcileOutcome::Updated { newly_filled }
    }

    /// Returns true if the order was folded as a fill.
    async fn resolve_vanished(&self, state: &mut CycleState, order_id: &str) -> bool {
        let tracked = state.orders.get(order_id).cloned();

        match tracked {
            Some(order) if order.side == OrderSide::Buy => {
                if !self.verify_fills {
                    return self.fold(state, order_id, order.amount, order.quantity);
                }
                match self.order_detail_executed(order_id).await {
                    Some((_, quote, quantity)) if quantity > 0.0 => {
                        self.fold(state, order_id, quote, quantity)
                    }
                    Some((status, _, _))
                        if matches!(status, OrderStatus::Cancelled | OrderStatus::Expired) =>
                    {
                        state.mark_resolved(order_id);
                        if let Some(o) = state.orders.get_mut(order_id) {
                            o.status = status;
                        }
                        self.observer.on_event(&CycleEvent::OrderVanishedUnfilled {
                            order_id: order_id.to_string(),
                        });
                        false
                    }
                    _ => self.fold(state, order_id, order.amount, order.quantity),
                }
            }
            Some(_) => {
                state.mark_resolved(order_id);
                false
            }
            None => match self.order_detail_executed(order_id).await {
                Some((_, quote, quantity)) if quantity > 0.0 => {
                    self.fold(state, order_id, quote, quantity)
                }
                _ => {
                    state.mark_resolved(order_id);
                    false
                }
            },
        }
    }

    fn fold(&self, state: &mut CycleState, order_id: &str, amount: f64, quantity: f64) -> bool {
        if !state.fold_fill(order_id, amount, quantity) {
            return false;
        }
        if let Some(order) = state.orders.get_mut(order_id) {
            order.status = OrderStatus::Filled;
        }
        self.observer.on_event(&CycleEvent::FillDetected {
            order_id: order_id.to_string(),
            amount,
            quantity,
            stats: state.stats.clone(),
        });
        true
    }

    /// (status, executed quote, executed quantity) for a buy, if the lookup works
    async fn order_detail_executed(&self, order_id: &str) -> Option<(OrderStatus, f64, f64)> {
        let symbol = self.instrument.symbol();
        let detail = match self
            .retry
            .execute("get_order_detail", || {
                self.gateway.get_order_detail(&symbol, order_id)
            })
            .await
        {
            Ok(detail) => detail,
            Err(e) => {
                tracing::warn!(order_id, error = %e, "Order detail lookup failed");
                return None;
            }
        };

        if detail.side != OrderSide::Buy {
            return Some((detail.status, 0.0, 0.0));
        }

        match detail.executed() {
            Ok((quote, quantity)) => Some((detail.status, quote, quantity)),
            Err(e) => {
                tracing::warn!(order_id, error = %e, "Unreadable order detail");
                None
            }
        }
    }

    /// Last traded price from the REST ticker
    pub async fn market_price(&self) -> Result<f64, CycleError> {
        let symbol = self.instrument.symbol();
        let ticker = self
            .retry
            .execute("get_ticker", || self.gateway.get_ticker(&symbol))
            .await?;
        Ok(ticker.last_price()?)
    }

    /// Cancel every resting order for the instrument. Best-effort.
    pub async fn cancel_all(&self) -> bool {
        let symbol = self.instrument.symbol();
        match self
            .retry
            .execute("cancel_all_orders", || self.gateway.cancel_all_orders(&symbol))
            .await
        {
            Ok(()) => {
                tracing::info!(symbol = %symbol, "Cancelled all resting orders");
                true
            }
            Err(e) => {
                tracing::warn!(symbol = %symbol, error = %e, "Cancel all failed, continuing");
                false
            }
        }
    }

    /// Available balance of the base asset
    pub async fn base_balance(&self) -> Result<f64, CycleError> {
        let balances = self
            .retry
            .execute("get_balances", || self.gateway.get_balances())
            .await?;

        match balances
            .iter()
            .find(|b| b.asset.eq_ignore_ascii_case(&self.instrument.base_asset))
        {
            Some(balance) => Ok(balance.available()?),
            None => Ok(0.0),
        }
    }

    /// Immediate-or-cancel limit sell
    pub async fn sell_ioc(&self, price: f64, quantity: f64) -> Result<OrderAck, ExchangeCallError> {
        let request = OrderRequest {
            symbol: self.instrument.symbol(),
            side: OrderSide::Sell,
            order_type: OrderType::Limit,
            quantity: format_decimal(adjust_quantity(quantity, &self.spec), self.spec.quantity_precision),
            price: format_decimal(adjust_price(price, &self.spec), self.spec.price_precision),
            time_in_force: TimeInForce::ImmediateOrCancel,
        };

        self.retry
            .execute("submit_order", || self.gateway.submit_order(&request))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Balance, OpenOrder, OrderDetail, RetryPolicy, Ticker};
    use crate::error::GatewayError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Duration;

    /// Gateway double with a scripted open-orders book
    #[derive(Default)]
    struct MockGateway {
        open: Mutex<Vec<String>>,
        details: Mutex<HashMap<String, OrderDetail>>,
        fail_open_orders: Mutex<bool>,
        reject_submits_with: Mutex<Option<String>>,
        fill_on_submit: Mutex<bool>,
        submits: AtomicU32,
        detail_calls: AtomicU32,
    }

    impl MockGateway {
        fn set_open(&self, ids: &[&str]) {
            *self.open.lock().unwrap() = ids.iter().map(|s| s.to_string()).collect();
        }
    }

    #[async_trait]
    impl ExchangeGateway for MockGateway {
        async fn get_ticker(&self, symbol: &str) -> Result<Ticker, GatewayError> {
            Ok(Ticker {
                symbol: symbol.to_string(),
                last_price: "100".to_string(),
            })
        }

        async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, GatewayError> {
            if *self.fail_open_orders.lock().unwrap() {
                return Err(GatewayError::Api {
                    status: 503,
                    message: "unavailable".to_string(),
                });
            }
            Ok(self
                .open
                .lock()
                .unwrap()
                .iter()
                .map(|id| OpenOrder {
                    id: id.clone(),
                    symbol: symbol.to_string(),
                    side: OrderSide::Buy,
                    price: "0".to_string(),
                    quantity: "0".to_string(),
                })
                .collect())
        }

        async fn get_order_detail(
            &self,
            _symbol: &str,
            order_id: &str,
        ) -> Result<OrderDetail, GatewayError> {
            self.detail_calls.fetch_add(1, Ordering::SeqCst);
            self.details
                .lock()
                .unwrap()
                .get(order_id)
                .cloned()
                .ok_or_else(|| GatewayError::OrderNotFound(order_id.to_string()))
        }

        async fn get_balances(&self) -> Result<Vec<Balance>, GatewayError> {
            Ok(vec![Balance {
                asset: "SOL".to_string(),
                available: "2.5".to_string(),
                locked: "0".to_string(),
            }])
        }

        async fn submit_order(&self, _request: &OrderRequest) -> Result<OrderAck, GatewayError> {
            let n = self.submits.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = self.reject_submits_with.lock().unwrap().clone() {
                return Err(GatewayError::Api { status: 400, message });
            }
            let status = if *self.fill_on_submit.lock().unwrap() {
                OrderStatus::Filled
            } else {
                OrderStatus::New
            };
            Ok(OrderAck {
                id: format!("order-{}", n),
                status,
            })
        }

        async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn cancel_all_orders(&self, _symbol: &str) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    struct NullObserver;

    impl CycleObserver for NullObserver {
        fn on_event(&self, _event: &CycleEvent) {}
    }

    fn tracker(gateway: Arc<MockGateway>) -> OrderTracker<MockGateway> {
        let retry = RetryExecutor::new(RetryPolicy {
            max_retries: 1,
            timeout: Duration::from_secs(5),
            base_backoff: Duration::from_millis(10),
        });
        OrderTracker::new(
            gateway,
            retry,
            Instrument::new("SOL", "USDC"),
            InstrumentSpec {
                price_precision: 2,
                tick_size: 0.01,
                quantity_precision: 2,
                min_quantity: 0.01,
            },
            Arc::new(NullObserver),
        )
    }

    fn track(state: &mut CycleState, id: &str, price: f64, quantity: f64) {
        state.orders.insert(
            id.to_string(),
            TrackedOrder {
                id: id.to_string(),
                price,
                quantity,
                amount: price * quantity,
                side: OrderSide::Buy,
                created_at: Utc::now(),
                processed: false,
                status: OrderStatus::New,
            },
        );
        state.created_ids.push(id.to_string());
        state.pending.insert(id.to_string());
    }

    fn plan(price: f64, quantity: f64) -> OrderPlan {
        OrderPlan {
            price,
            quantity,
            amount: price * quantity,
        }
    }

    #[tokio::test]
    async fn test_vanished_order_folded_exactly_once() {
        let gateway = Arc::new(MockGateway::default());
        let tracker = tracker(gateway.clone());
        let mut state = CycleState::new();
        track(&mut state, "A", 100.0, 1.0);
        track(&mut state, "B", 99.0, 1.0);
        track(&mut state, "C", 98.0, 1.0);

        gateway.set_open(&["B", "C"]);

        let first = tracker.reconcile(&mut state).await;
        let second = tracker.reconcile(&mut state).await;

        assert_eq!(first, ReconcileOutcome::Updated { newly_filled: 1 });
        assert_eq!(second, ReconcileOutcome::Updated { newly_filled: 0 });
        assert_eq!(state.stats.filled_orders, 1);
        assert_eq!(state.stats.average_price, Some(100.0));
        assert!(state.processed.contains("A"));
        assert_eq!(state.pending.len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_failure_leaves_state_untouched() {
        let gateway = Arc::new(MockGateway::default());
        let tracker = tracker(gateway.clone());
        let mut state = CycleState::new();
        track(&mut state, "A", 100.0, 1.0);
        *gateway.fail_open_orders.lock().unwrap() = true;

        let outcome = tracker.reconcile(&mut state).await;

        assert_eq!(outcome, ReconcileOutcome::Skipped);
        assert!(state.pending.contains("A"));
        assert_eq!(state.stats.filled_orders, 0);
    }

    #[tokio::test]
    async fn test_average_across_multiple_fills() {
        let gateway = Arc::new(MockGateway::default());
        let tracker = tracker(gateway.clone());
        let mut state = CycleState::new();
        track(&mut state, "A", 10.0, 1.0);
        track(&mut state, "B", 20.0, 1.0);
        gateway.set_open(&[]);

        tracker.reconcile(&mut state).await;

        assert_eq!(state.stats.filled_orders, 2);
        assert_eq!(state.stats.average_price, Some(15.0));
    }

    #[tokio::test]
    async fn test_untracked_order_uses_order_detail() {
        let gateway = Arc::new(MockGateway::default());
        gateway.details.lock().unwrap().insert(
            "X".to_string(),
            OrderDetail {
                id: "X".to_string(),
                side: OrderSide::Buy,
                status: OrderStatus::Filled,
                executed_quantity: "2".to_string(),
                executed_quote_quantity: "190".to_string(),
            },
        );
        let tracker = tracker(gateway.clone());
        let mut state = CycleState::new();
        state.pending.insert("X".to_string());
        gateway.set_open(&[]);

        let outcome = tracker.reconcile(&mut state).await;

        assert_eq!(outcome, ReconcileOutcome::Updated { newly_filled: 1 });
        assert_eq!(state.stats.total_filled_quantity, 2.0);
        assert_eq!(state.stats.average_price, Some(95.0));
    }

    #[tokio::test]
    async fn test_verification_skips_cancelled_orders() {
        let gateway = Arc::new(MockGateway::default());
        gateway.details.lock().unwrap().insert(
            "A".to_string(),
            OrderDetail {
                id: "A".to_string(),
                side: OrderSide::Buy,
                status: OrderStatus::Cancelled,
                executed_quantity: "0".to_string(),
                executed_quote_quantity: "0".to_string(),
            },
        );
        let tracker = tracker(gateway.clone()).with_fill_verification(true);
        let mut state = CycleState::new();
        track(&mut state, "A", 100.0, 1.0);
        gateway.set_open(&[]);

        let outcome = tracker.reconcile(&mut state).await;

        assert_eq!(outcome, ReconcileOutcome::Updated { newly_filled: 0 });
        assert_eq!(state.stats.filled_orders, 0);
        assert!(state.is_processed("A"));
        assert_eq!(state.orders["A"].status, OrderStatus::Cancelled);

        tracker.reconcile(&mut state).await;
        assert_eq!(gateway.detail_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_verification_falls_back_to_recorded_values() {
        let gateway = Arc::new(MockGateway::default());
        let tracker = tracker(gateway.clone()).with_fill_verification(true);
        let mut state = CycleState::new();
        track(&mut state, "A", 100.0, 1.5);
        gateway.set_open(&[]);

        tracker.reconcile(&mut state).await;

        assert_eq!(state.stats.filled_orders, 1);
        assert_eq!(state.stats.total_filled_quantity, 1.5);
    }

    #[tokio::test]
    async fn test_submit_records_and_seeds_pending() {
        let gateway = Arc::new(MockGateway::default());
        let tracker = tracker(gateway.clone());
        let mut state = CycleState::new();

        let outcome = tracker.submit_buy(&mut state, &plan(98.759, 1.2345)).await.unwrap();

        let SubmitOutcome::Placed(id) = outcome else {
            panic!("expected a placed order");
        };
        let order = &state.orders[&id];
        assert_eq!(order.price, 98.75);
        assert_eq!(order.quantity, 1.23);
        assert!(state.pending.contains(&id));
        assert_eq!(state.stats.total_orders, 1);
        assert!(state.signatures.contains("98.75_1.23"));
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_not_sent() {
        let gateway = Arc::new(MockGateway::default());
        let tracker = tracker(gateway.clone());
        let mut state = CycleState::new();

        tracker.submit_buy(&mut state, &plan(100.0, 1.0)).await.unwrap();
        let again = tracker.submit_buy(&mut state, &plan(100.004, 1.001)).await.unwrap();

        assert_eq!(again, SubmitOutcome::Duplicate);
        assert_eq!(gateway.submits.load(Ordering::SeqCst), 1);
        assert_eq!(state.orders.len(), 1);
    }

    #[tokio::test]
    async fn test_immediate_fill_folds_on_submit() {
        let gateway = Arc::new(MockGateway::default());
        *gateway.fill_on_submit.lock().unwrap() = true;
        let tracker = tracker(gateway.clone());
        let mut state = CycleState::new();

        tracker.submit_buy(&mut state, &plan(100.0, 2.0)).await.unwrap();
        assert_eq!(state.stats.filled_orders, 1);
        assert!(state.pending.is_empty());

        // The first reconcile diffs created ids; the fill must not count twice
        gateway.set_open(&[]);
        tracker.reconcile(&mut state).await;
        assert_eq!(state.stats.filled_orders, 1);
    }

    #[tokio::test]
    async fn test_insufficient_funds_is_classified() {
        let gateway = Arc::new(MockGateway::default());
        *gateway.reject_submits_with.lock().unwrap() = Some("Insufficient funds".to_string());
        let tracker = tracker(gateway.clone());
        let mut state = CycleState::new();

        let err = tracker.submit_buy(&mut state, &plan(100.0, 1.0)).await.unwrap_err();

        assert!(matches!(err, TrackerError::InsufficientFunds(_)));
        assert!(state.signatures.is_empty());
        assert_eq!(state.stats.total_orders, 0);
    }

    #[tokio::test]
    async fn test_base_balance_and_price() {
        let gateway = Arc::new(MockGateway::default());
        let tracker = tracker(gateway);

        assert_eq!(tracker.base_balance().await.unwrap(), 2.5);
        assert_eq!(tracker.market_price().await.unwrap(), 100.0);
    }
}
