use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::time::{interval_at, sleep, Duration, Instant, Interval, MissedTickBehavior};

use super::{CycleState, OrderTracker, PriceFeed, SubmitOutcome};
use crate::api::{ExchangeGateway, RetryExecutor, StreamConnector};
use crate::config::Settings;
use crate::error::{CycleError, TrackerError};
use crate::events::{CycleEvent, CycleObserver};
use crate::models::{FillStatistics, OrderPlan, OrderStatus, PriceSample};
use crate::risk::{ExitRules, ExitSignal};
use crate::strategy::{adjust_quantity, plan_ladder, LadderParams};

const ROUND_RETRY_BASE: Duration = Duration::from_secs(3);
const ROUND_RETRY_MAX: Duration = Duration::from_secs(15);
const BETWEEN_ROUNDS_BASE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Planning,
    Placing,
    Monitoring,
    Exiting,
    Restarting,
    Terminated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Restart { cooldown: Duration, reason: String },
    Terminate,
}

/// Returned by [`CycleController::run`]
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub cycles: u64,
    pub take_profits: u32,
    /// Statistics of the last cycle that ran
    pub last_stats: FillStatistics,
}

/// Shutdown notification that remembers it fired
pub struct Shutdown {
    rx: broadcast::Receiver<()>,
    requested: bool,
    detached: bool,
}

impl Shutdown {
    pub fn new(rx: broadcast::Receiver<()>) -> Self {
        Self {
            rx,
            requested: false,
            detached: false,
        }
    }

    pub fn is_requested(&mut self) -> bool {
        if !self.requested && !self.detached {
            match self.rx.try_recv() {
                Ok(()) | Err(TryRecvError::Lagged(_)) => self.requested = true,
                Err(TryRecvError::Closed) => self.detached = true,
                Err(TryRecvError::Empty) => {}
            }
        }
        self.requested
    }

    /// Sleep, waking early on shutdown. Returns true if shutdown was requested.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while !self.is_requested() {
            if self.detached {
                tokio::time::sleep_until(deadline).await;
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return false,
                result = self.rx.recv() => match result {
                    Ok(()) | Err(RecvError::Lagged(_)) => self.requested = true,
                    Err(RecvError::Closed) => self.detached = true,
                },
            }
        }
        true
    }

    /// Wait for the next interval tick. Returns true if shutdown was requested.
    async fn tick(&mut self, interval: &mut Interval) -> bool {
        while !self.is_requested() {
            if self.detached {
                interval.tick().await;
                return false;
            }
            tokio::select! {
                _ = interval.tick() => return false,
                result = self.rx.recv() => match result {
                    Ok(()) | Err(RecvError::Lagged(_)) => self.requested = true,
                    Err(RecvError::Closed) => self.detached = true,
                },
            }
        }
        true
    }
}

/// Drives plan -> place -> monitor -> exit, then restarts or stops.
///
/// A failing cycle never takes the process down; it becomes a restart after
/// a cooldown. Only a clean take-profit with restarts disabled, or a
/// shutdown request, ends `run`.
pub struct CycleController<G> {
    settings: Settings,
    tracker: OrderTracker<G>,
    feed: PriceFeed,
    exit_rules: ExitRules,
    observer: Arc<dyn CycleObserver>,
    state: CycleState,
    phase: CyclePhase,
    planning_failures: u32,
}

impl<G: ExchangeGateway> CycleController<G> {
    pub fn new(
        settings: Settings,
        gateway: Arc<G>,
        connector: Arc<dyn StreamConnector>,
        observer: Arc<dyn CycleObserver>,
    ) -> Self {
        let tracker = OrderTracker::new(
            gateway,
            RetryExecutor::new(settings.retry_policy()),
            settings.instrument(),
            settings.instrument_spec(),
            observer.clone(),
        )
        .with_fill_verification(settings.actions.verify_fills_with_order_detail);
        let feed = PriceFeed::new(connector, settings.feed_config());
        let exit_rules = settings.exit_rules();

        Self {
            settings,
            tracker,
            feed,
            exit_rules,
            observer,
            state: CycleState::new(),
            phase: CyclePhase::Planning,
            planning_failures: 0,
        }
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn state(&self) -> &CycleState {
        &self.state
    }

    fn enter(&mut self, phase: CyclePhase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "Cycle phase change");
        self.phase = phase;
    }

    /// Run cycles until termination or shutdown.
    pub async fn run(&mut self, shutdown: broadcast::Receiver<()>) -> RunSummary {
        let mut shutdown = Shutdown::new(shutdown);
        let mut summary = RunSummary::default();

        loop {
            summary.cycles += 1;
            self.state.reset();
            self.enter(CyclePhase::Planning);
            self.observer.on_event(&CycleEvent::CycleStarted {
                cycle: summary.cycles,
                symbol: self.tracker.instrument().symbol(),
            });

            let outcome = match self.run_cycle(&mut shutdown).await {
                Ok(outcome) => {
                    if self.phase == CyclePhase::Exiting {
                        summary.take_profits += 1;
                    }
                    outcome
                }
                Err(e) => {
                    self.observer.on_event(&CycleEvent::CycleFailed {
                        error: e.to_string(),
                    });
                    let cooldown = self.failure_cooldown(&e);
                    CycleOutcome::Restart {
                        cooldown,
                        reason: e.to_string(),
                    }
                }
            };

            self.feed.stop().await;
            summary.last_stats = self.state.stats.clone();

            match outcome {
                CycleOutcome::Restart { cooldown, reason } if !shutdown.is_requested() => {
                    self.enter(CyclePhase::Restarting);
                    self.observer
                        .on_event(&CycleEvent::Restarting { cooldown, reason });
                    self.state.reset();
                    self.feed.clear_price();
                    if shutdown.sleep(cooldown).await {
                        break;
                    }
                }
                _ => break,
            }
        }

        self.enter(CyclePhase::Terminated);
        self.observer.on_event(&CycleEvent::Terminated {
            cycles: summary.cycles,
            stats: summary.last_stats.clone(),
        });
        summary
    }

    fn failure_cooldown(&mut self, error: &CycleError) -> Duration {
        let error_cooldown = Duration::from_secs(self.settings.timing.error_cooldown_secs);
        match error {
            CycleError::Planning(_) => {
                self.planning_failures += 1;
                planning_backoff(
                    Duration::from_secs(self.settings.timing.restart_cooldown_secs),
                    error_cooldown,
                    self.planning_failures,
                )
            }
            _ => error_cooldown,
        }
    }

    async fn run_cycle(&mut self, shutdown: &mut Shutdown) -> Result<CycleOutcome, CycleError> {
        let plan = self.plan().await?;
        self.planning_failures = 0;

        self.enter(CyclePhase::Placing);
        let placed = self.place_orders(&plan, shutdown).await;
        if shutdown.is_requested() {
            return Ok(CycleOutcome::Terminate);
        }
        if placed == 0 && self.state.stats.filled_orders == 0 {
            return Ok(CycleOutcome::Restart {
                cooldown: Duration::from_secs(self.settings.timing.error_cooldown_secs),
                reason: "no orders could be placed".to_string(),
            });
        }

        self.enter(CyclePhase::Monitoring);
        let trigger_price = match self.monitor(shutdown).await? {
            MonitorExit::TakeProfit(price) => price,
            MonitorExit::Outcome(outcome) => return Ok(outcome),
        };

        self.enter(CyclePhase::Exiting);
        self.exit_position(trigger_price).await?;

        if self.settings.actions.restart_after_take_profit {
            Ok(CycleOutcome::Restart {
                cooldown: Duration::from_secs(self.settings.timing.restart_cooldown_secs),
                reason: "take profit completed".to_string(),
            })
        } else {
            Ok(CycleOutcome::Terminate)
        }
    }

    async fn plan(&mut self) -> Result<Vec<OrderPlan>, CycleError> {
        if self.settings.actions.cancel_open_orders_on_start {
            self.tracker.cancel_all().await;
        }

        self.feed.start();

        let current_price = self.tracker.market_price().await?;
        self.feed.seed(PriceSample::from_rest(current_price));
        let spec = *self.tracker.spec();
        let trading = &self.settings.trading;
        let min_order_amount = trading.min_order_amount.max(current_price * spec.min_quantity);

        let params = LadderParams {
            current_price,
            max_drop_pct: trading.max_drop_pct,
            total_budget: trading.total_budget,
            order_count: trading.order_count,
            increment_pct: trading.increment_pct,
            min_order_amount,
        };
        let plan = plan_ladder(&params, &spec)?;

        self.observer.on_event(&CycleEvent::LadderPlanned {
            current_price,
            min_order_amount,
            orders: plan.clone(),
        });
        Ok(plan)
    }

    /// Submit the ladder in up to `placement_rounds` passes. Returns how
    /// many orders the exchange accepted.
    async fn place_orders(&mut self, plan: &[OrderPlan], shutdown: &mut Shutdown) -> usize {
        let order_delay = Duration::from_millis(self.settings.timing.order_delay_ms);
        let rounds = self.settings.trading.placement_rounds.max(1);
        let mut remaining: Vec<OrderPlan> = plan.to_vec();
        let mut placed = 0;
        let mut submitted_any = false;

        for round in 0..rounds {
            if remaining.is_empty() {
                break;
            }
            if round > 0 {
                tracing::info!(
                    round = round + 1,
                    remaining = remaining.len(),
                    "Retrying failed orders"
                );
                if shutdown.sleep(BETWEEN_ROUNDS_BASE * round).await {
                    return placed;
                }
            }

            let mut failed = Vec::new();
            for order in &remaining {
                if submitted_any && shutdown.sleep(order_delay).await {
                    return placed;
                }
                submitted_any = true;

                match self.tracker.submit_buy(&mut self.state, order).await {
                    Ok(SubmitOutcome::Placed(_)) => placed += 1,
                    Ok(SubmitOutcome::Duplicate) => {}
                    Err(TrackerError::InsufficientFunds(e)) => {
                        self.observer.on_event(&CycleEvent::PlacementHalted {
                            placed,
                            reason: e.to_string(),
                        });
                        return placed;
                    }
                    Err(e) => {
                        tracing::warn!(
                            price = order.price,
                            round = round + 1,
                            error = %e,
                            "Order placement failed"
                        );
                        failed.push(*order);
                        let wait = (ROUND_RETRY_BASE * (round + 1)).min(ROUND_RETRY_MAX);
                        if shutdown.sleep(wait).await {
                            return placed;
                        }
                    }
                }
            }
            remaining = failed;
        }

        if !remaining.is_empty() {
            tracing::warn!(
                unplaced = remaining.len(),
                "Some ladder orders could not be placed"
            );
        }
        self.observer.on_event(&CycleEvent::PlacementFinished {
            placed,
            planned: plan.len(),
        });
        placed
    }

    async fn monitor(&mut self, shutdown: &mut Shutdown) -> Result<MonitorExit, CycleError> {
        let period = self.settings.monitor_interval();
        let check_orders_every = Duration::from_secs(self.settings.timing.check_orders_interval_secs);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_reconcile: Option<Instant> = None;

        loop {
            if shutdown.tick(&mut ticker).await {
                return Ok(MonitorExit::Outcome(CycleOutcome::Terminate));
            }

            if last_reconcile.map_or(true, |at| at.elapsed() >= check_orders_every) {
                self.tracker.reconcile(&mut self.state).await;
                last_reconcile = Some(Instant::now());
            }

            let sample = self.feed.latest();
            self.observer.on_event(&CycleEvent::MonitorTick {
                price: sample.as_ref().map(|s| s.price),
                stats: self.state.stats.clone(),
                open_orders: self.state.open_order_count(),
            });

            match self.exit_rules.check(
                &self.state.stats,
                sample.as_ref(),
                self.state.started_at,
                Utc::now(),
            ) {
                ExitSignal::TakeProfit {
                    price,
                    average_price,
                    increase_pct,
                } => {
                    self.observer.on_event(&CycleEvent::TakeProfitTriggered {
                        price,
                        average_price,
                        increase_pct,
                    });
                    return Ok(MonitorExit::TakeProfit(price));
                }
                ExitSignal::NoFillTimeout { elapsed } => {
                    self.observer.on_event(&CycleEvent::NoFillTimeout {
                        elapsed_minutes: elapsed.num_minutes(),
                    });
                    self.tracker.cancel_all().await;
                    return Ok(MonitorExit::Outcome(CycleOutcome::Restart {
                        cooldown: Duration::from_secs(self.settings.timing.restart_cooldown_secs),
                        reason: "no fills before timeout".to_string(),
                    }));
                }
                ExitSignal::Hold(_) => {}
            }

            if self.feed.has_failed() {
                return Err(CycleError::FeedUnavailable);
            }
        }
    }

    /// Cancel the rest of the ladder and sell the whole base balance with
    /// up to two IOC orders; anything left after that is reported, not chased.
    async fn exit_position(&mut self, trigger_price: f64) -> Result<(), CycleError> {
        let spec = *self.tracker.spec();
        let settle = Duration::from_millis(self.settings.timing.settle_delay_ms);

        self.tracker.cancel_all().await;

        let quantity = adjust_quantity(self.tracker.base_balance().await?, &spec);
        if quantity <= 0.0 {
            tracing::warn!("Take profit triggered but there is no base balance to sell");
            return Ok(());
        }

        let first_price = trigger_price * (1.0 - self.settings.trading.exit_discount_pct / 100.0);
        let ack = self.tracker.sell_ioc(first_price, quantity).await?;
        self.observer.on_event(&CycleEvent::ExitOrderSubmitted {
            price: first_price,
            quantity,
            status: ack.status,
        });
        if ack.status == OrderStatus::Filled {
            return Ok(());
        }

        sleep(settle).await;
        let remaining = adjust_quantity(self.tracker.base_balance().await?, &spec);
        if remaining <= 0.0 {
            return Ok(());
        }

        let market = self.feed.latest().map_or(trigger_price, |s| s.price);
        let final_price = market * (1.0 - self.settings.trading.final_exit_discount_pct / 100.0);
        let ack = self.tracker.sell_ioc(final_price, remaining).await?;
        self.observer.on_event(&CycleEvent::ExitOrderSubmitted {
            price: final_price,
            quantity: remaining,
            status: ack.status,
        });
        if ack.status == OrderStatus::Filled {
            return Ok(());
        }

        sleep(settle).await;
        let residual = adjust_quantity(self.tracker.base_balance().await?, &spec);
        if residual > 0.0 {
            self.observer
                .on_event(&CycleEvent::ResidualExposure { quantity: residual });
        }
        Ok(())
    }
}

enum MonitorExit {
    TakeProfit(f64),
    Outcome(CycleOutcome),
}

/// restart_cooldown * 2^(failures - 1), capped at `max`
pub fn planning_backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1));
    base.saturating_mul(factor).min(max)
}
