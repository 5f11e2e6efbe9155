use std::time::Duration;

use crate::models::{FillStatistics, OrderPlan, OrderStatus};

/// Notable things that happen during a trading cycle.
///
/// Emitted by the controller and the tracker; consumers must not block.
#[derive(Debug, Clone)]
pub enum CycleEvent {
    CycleStarted {
        cycle: u64,
        symbol: String,
    },
    LadderPlanned {
        current_price: f64,
        min_order_amount: f64,
        orders: Vec<OrderPlan>,
    },
    OrderPlaced {
        order_id: String,
        price: f64,
        quantity: f64,
        status: OrderStatus,
    },
    DuplicateOrderSkipped {
        price: f64,
        quantity: f64,
    },
    PlacementHalted {
        placed: usize,
        reason: String,
    },
    PlacementFinished {
        placed: usize,
        planned: usize,
    },
    FillDetected {
        order_id: String,
        amount: f64,
        quantity: f64,
        stats: FillStatistics,
    },
    /// A resting order vanished without executing anything
    OrderVanishedUnfilled {
        order_id: String,
    },
    ReconciliationSkipped {
        error: String,
    },
    MonitorTick {
        price: Option<f64>,
        stats: FillStatistics,
        open_orders: usize,
    },
    TakeProfitTriggered {
        price: f64,
        average_price: f64,
        increase_pct: f64,
    },
    NoFillTimeout {
        elapsed_minutes: i64,
    },
    ExitOrderSubmitted {
        price: f64,
        quantity: f64,
        status: OrderStatus,
    },
    ResidualExposure {
        quantity: f64,
    },
    CycleFailed {
        error: String,
    },
    Restarting {
        cooldown: Duration,
        reason: String,
    },
    Terminated {
        cycles: u64,
        stats: FillStatistics,
    },
}

pub trait CycleObserver: Send + Sync {
    fn on_event(&self, event: &CycleEvent);
}

/// Renders every event as a log line
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl CycleObserver for TracingObserver {
    fn on_event(&self, event: &CycleEvent) {
        match event {
            CycleEvent::CycleStarted { cycle, symbol } => {
                tracing::info!("🚀 Cycle {} starting for {}", cycle, symbol);
            }
            CycleEvent::LadderPlanned {
                current_price,
                min_order_amount,
                orders,
            } => {
                let total: f64 = orders.iter().map(|o| o.amount).sum();
                tracing::info!(
                    "📐 Planned {} orders from ${:.2} (min order ${:.2}, total ${:.2})",
                    orders.len(),
                    current_price,
                    min_order_amount,
                    total
                );
                for (i, order) in orders.iter().enumerate() {
                    tracing::info!(
                        "    #{} price={} qty={} amount=${:.2}",
                        i + 1,
                        order.price,
                        order.quantity,
                        order.amount
                    );
                }
            }
            CycleEvent::OrderPlaced {
                order_id,
                price,
                quantity,
                status,
            } => {
                tracing::info!(
                    order_id = %order_id,
                    price,
                    quantity,
                    status = ?status,
                    "✓ Buy order placed"
                );
            }
            CycleEvent::DuplicateOrderSkipped { price, quantity } => {
                tracing::warn!(price, quantity, "Duplicate order skipped");
            }
            CycleEvent::PlacementHalted { placed, reason } => {
                tracing::warn!(placed, "⚠️  Order placement halted: {}", reason);
            }
            CycleEvent::PlacementFinished { placed, planned } => {
                tracing::info!("✅ Placed {}/{} orders", placed, planned);
            }
            CycleEvent::FillDetected {
                order_id,
                amount,
                quantity,
                stats,
            } => {
                tracing::info!(
                    order_id = %order_id,
                    amount,
                    quantity,
                    filled_orders = stats.filled_orders,
                    average_price = ?stats.average_price,
                    "💰 Fill detected"
                );
            }
            CycleEvent::OrderVanishedUnfilled { order_id } => {
                tracing::warn!(order_id = %order_id, "Order left the book without filling");
            }
            CycleEvent::ReconciliationSkipped { error } => {
                tracing::warn!("Reconciliation skipped: {}", error);
            }
            CycleEvent::MonitorTick {
                price,
                stats,
                open_orders,
            } => {
                let pnl = price.and_then(|p| stats.unrealized_pnl(p));
                tracing::info!(
                    price = ?price,
                    filled = stats.filled_orders,
                    total = stats.total_orders,
                    open_orders,
                    average_price = ?stats.average_price,
                    pnl_pct = ?pnl.map(|(_, pct)| pct),
                    "📊 Monitor"
                );
            }
            CycleEvent::TakeProfitTriggered {
                price,
                average_price,
                increase_pct,
            } => {
                tracing::info!(
                    "🎯 Take profit: price {:.4} is {:.2}% above average {:.4}",
                    price,
                    increase_pct,
                    average_price
                );
            }
            CycleEvent::NoFillTimeout { elapsed_minutes } => {
                tracing::warn!("⏰ No fills after {} minutes", elapsed_minutes);
            }
            CycleEvent::ExitOrderSubmitted {
                price,
                quantity,
                status,
            } => {
                tracing::info!(price, quantity, status = ?status, "Exit order submitted");
            }
            CycleEvent::ResidualExposure { quantity } => {
                tracing::warn!(quantity, "🚨 Position not fully sold, residual left");
            }
            CycleEvent::CycleFailed { error } => {
                tracing::error!("❌ Cycle failed: {}", error);
            }
            CycleEvent::Restarting { cooldown, reason } => {
                tracing::info!("🔄 Restarting in {}s: {}", cooldown.as_secs(), reason);
            }
            CycleEvent::Terminated { cycles, stats } => {
                tracing::info!(
                    cycles,
                    filled = stats.filled_orders,
                    total_amount = stats.total_filled_amount,
                    "👋 Trading stopped"
                );
            }
        }
    }
}
