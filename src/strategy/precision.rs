use std::collections::HashMap;
use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Exchange price/quantity constraints for one base asset
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct InstrumentSpec {
    /// Decimal places accepted in a price
    pub price_precision: u32,
    /// Minimum price increment
    pub tick_size: f64,
    /// Decimal places accepted in a quantity; the step size is 10^-precision
    pub quantity_precision: u32,
    /// Smallest tradable quantity
    pub min_quantity: f64,
}

impl InstrumentSpec {
    pub fn step_size(&self) -> f64 {
        10f64.powi(-(self.quantity_precision as i32))
    }
}

impl Default for InstrumentSpec {
    fn default() -> Self {
        Self {
            price_precision: 2,
            tick_size: 0.01,
            quantity_precision: 2,
            min_quantity: 0.1,
        }
    }
}

/// Static per-asset lookup with a DEFAULT fallback entry
#[derive(Debug, Clone)]
pub struct PrecisionTable {
    entries: HashMap<String, InstrumentSpec>,
}

impl PrecisionTable {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            "BTC".to_string(),
            InstrumentSpec {
                price_precision: 0,
                tick_size: 1.0,
                quantity_precision: 5,
                min_quantity: 0.00001,
            },
        );
        entries.insert(
            "ETH".to_string(),
            InstrumentSpec {
                price_precision: 2,
                tick_size: 0.01,
                quantity_precision: 4,
                min_quantity: 0.001,
            },
        );
        entries.insert(
            "SOL".to_string(),
            InstrumentSpec {
                price_precision: 2,
                tick_size: 0.01,
                quantity_precision: 2,
                min_quantity: 0.01,
            },
        );
        Self { entries }
    }

    /// Replace or add entries (e.g. from configuration)
    pub fn with_overrides(mut self, overrides: &HashMap<String, InstrumentSpec>) -> Self {
        for (asset, spec) in overrides {
            self.entries.insert(asset.to_uppercase(), *spec);
        }
        self
    }

    pub fn lookup(&self, base_asset: &str) -> InstrumentSpec {
        self.entries
            .get(&base_asset.to_uppercase())
            .copied()
            .unwrap_or_default()
    }
}

impl Default for PrecisionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Floor a price to the tick size, then truncate to the price precision.
///
/// Never rounds up. Non-finite or negative input collapses to 0.
pub fn adjust_price(price: f64, spec: &InstrumentSpec) -> f64 {
    let floored = floor_to_increment(to_decimal(price), to_decimal(spec.tick_size));
    from_decimal(floored.round_dp_with_strategy(spec.price_precision, RoundingStrategy::ToZero))
}

/// Floor a quantity to the step size.
pub fn adjust_quantity(quantity: f64, spec: &InstrumentSpec) -> f64 {
    let step = Decimal::new(1, spec.quantity_precision);
    let floored = floor_to_increment(to_decimal(quantity), step);
    from_decimal(floored.round_dp_with_strategy(spec.quantity_precision, RoundingStrategy::ToZero))
}

/// Truncate a quote amount to cents.
pub fn truncate_amount(amount: f64) -> f64 {
    from_decimal(to_decimal(amount).round_dp_with_strategy(2, RoundingStrategy::ToZero))
}

/// Format a value for the wire with exactly `precision` decimals
pub fn format_decimal(value: f64, precision: u32) -> String {
    let mut truncated = to_decimal(value).round_dp_with_strategy(precision, RoundingStrategy::ToZero);
    truncated.rescale(precision);
    truncated.to_string()
}

fn floor_to_increment(value: Decimal, increment: Decimal) -> Decimal {
    if value <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    if increment <= Decimal::ZERO {
        return value;
    }
    (value / increment).floor() * increment
}

// Goes through the shortest round-trip string form so 0.29 stays 0.29
// instead of 0.28999999999999998.
fn to_decimal(value: f64) -> Decimal {
    if !value.is_finite() {
        return Decimal::ZERO;
    }
    Decimal::from_str(&value.to_string()).unwrap_or(Decimal::ZERO)
}

fn from_decimal(value: Decimal) -> f64 {
    value.normalize().to_string().parse().unwrap_or(0.0)
}
