use super::precision::{adjust_price, adjust_quantity, truncate_amount, InstrumentSpec};
use crate::error::PlanningError;
use crate::models::OrderPlan;

/// Inputs for one buy ladder
///
/// Prices are spaced linearly from `current_price` down to
/// `current_price * (1 - max_drop_pct / 100)`; amounts grow geometrically
/// by `1 + increment_pct / 100` per rung so lower rungs buy more.
#[derive(Debug, Clone, PartialEq)]
pub struct LadderParams {
    pub current_price: f64,
    pub max_drop_pct: f64,
    pub total_budget: f64,
    pub order_count: usize,
    pub increment_pct: f64,
    pub min_order_amount: f64,
}

impl LadderParams {
    fn validate(&self) -> Result<(), PlanningError> {
        if self.order_count < 2 {
            return Err(PlanningError::InvalidParameters(format!(
                "order_count must be at least 2, got {}",
                self.order_count
            )));
        }
        if !(self.current_price.is_finite() && self.current_price > 0.0) {
            return Err(PlanningError::InvalidParameters(format!(
                "current_price must be positive, got {}",
                self.current_price
            )));
        }
        if !(self.max_drop_pct > 0.0 && self.max_drop_pct < 100.0) {
            return Err(PlanningError::InvalidParameters(format!(
                "max_drop_pct must be in (0, 100), got {}",
                self.max_drop_pct
            )));
        }
        if !(self.total_budget.is_finite() && self.total_budget > 0.0) {
            return Err(PlanningError::InvalidParameters(format!(
                "total_budget must be positive, got {}",
                self.total_budget
            )));
        }
        if self.increment_pct < 0.0 || self.min_order_amount < 0.0 {
            return Err(PlanningError::InvalidParameters(
                "increment_pct and min_order_amount must not be negative".to_string(),
            ));
        }
        if self.total_budget < self.min_order_amount * self.order_count as f64 {
            return Err(PlanningError::InsufficientBudget {
                budget: self.total_budget,
                order_count: self.order_count,
                min_order_amount: self.min_order_amount,
            });
        }
        Ok(())
    }

    /// Lowest rung before tick rounding
    pub fn lowest_price(&self) -> f64 {
        self.current_price * (1.0 - self.max_drop_pct / 100.0)
    }
}

/// Build the buy ladder, highest price first.
///
/// Orders whose rounded amount ends up below the minimum are dropped; an
/// empty result is a `PlanningError::NoViableOrders`.
pub fn plan_ladder(
    params: &LadderParams,
    spec: &InstrumentSpec,
) -> Result<Vec<OrderPlan>, PlanningError> {
    params.validate()?;

    let n = params.order_count;
    let step = (params.current_price - params.lowest_price()) / (n - 1) as f64;
    let amounts = geometric_amounts(params);

    let mut orders = Vec::with_capacity(n);
    for (i, raw_amount) in amounts.into_iter().enumerate() {
        let price = adjust_price(params.current_price - step * i as f64, spec);
        if price <= 0.0 {
            tracing::debug!(rung = i, "Skipping rung with non-positive price");
            continue;
        }

        let quantity = adjust_quantity(raw_amount / price, spec);
        let amount = truncate_amount(price * quantity);

        if quantity <= 0.0 || amount < params.min_order_amount {
            tracing::debug!(
                rung = i,
                price,
                quantity,
                amount,
                min = params.min_order_amount,
                "Dropping rung below minimum order amount after rounding"
            );
            continue;
        }

        orders.push(OrderPlan {
            price,
            quantity,
            amount,
        });
    }

    if orders.is_empty() {
        return Err(PlanningError::NoViableOrders);
    }

    Ok(orders)
}

/// Unrounded per-rung amounts summing to the budget (or less when scaled).
fn geometric_amounts(params: &LadderParams) -> Vec<f64> {
    let n = params.order_count;
    let ratio = 1.0 + params.increment_pct / 100.0;

    let base = if (ratio - 1.0).abs() < f64::EPSILON {
        params.total_budget / n as f64
    } else {
        params.total_budget * (ratio - 1.0) / (ratio.powi(n as i32) - 1.0)
    };
    let base = base.max(params.min_order_amount);

    let mut amounts: Vec<f64> = (0..n).map(|i| base * ratio.powi(i as i32)).collect();

    let sum: f64 = amounts.iter().sum();
    if sum > params.total_budget {
        let scale = params.total_budget / sum;
        for amount in &mut amounts {
            *amount *= scale;
        }
    }

    amounts
}
