use chrono::{DateTime, Duration, Utc};

use crate::models::{FillStatistics, PriceSample};

/// Exit conditions evaluated on every monitoring tick
#[derive(Debug, Clone)]
pub struct ExitRules {
    pub take_profit_pct: f64,
    /// Samples older than this are treated as absent
    pub max_price_age: Duration,
    /// Restart when nothing fills within this long of cycle start
    pub no_fill_timeout: Option<Duration>,
}

impl Default for ExitRules {
    fn default() -> Self {
        Self {
            take_profit_pct: 1.5,
            max_price_age: Duration::seconds(60),
            no_fill_timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExitSignal {
    TakeProfit {
        price: f64,
        average_price: f64,
        increase_pct: f64,
    },
    NoFillTimeout {
        elapsed: Duration,
    },
    Hold(HoldReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum HoldReason {
    NoFills,
    NoFreshPrice,
    BelowTarget { increase_pct: f64 },
}

impl ExitRules {
    pub fn check(
        &self,
        stats: &FillStatistics,
        sample: Option<&PriceSample>,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> ExitSignal {
        if stats.filled_orders == 0 {
            if let Some(limit) = self.no_fill_timeout {
                let elapsed = now.signed_duration_since(started_at);
                if elapsed >= limit {
                    return ExitSignal::NoFillTimeout { elapsed };
                }
            }
            return ExitSignal::Hold(HoldReason::NoFills);
        }

        let Some(average_price) = stats.average_price else {
            return ExitSignal::Hold(HoldReason::NoFills);
        };

        let Some(sample) = sample.filter(|s| s.is_fresh(now, self.max_price_age)) else {
            return ExitSignal::Hold(HoldReason::NoFreshPrice);
        };

        let increase_pct = price_increase_pct(sample.price, average_price);
        if increase_pct >= self.take_profit_pct {
            ExitSignal::TakeProfit {
                price: sample.price,
                average_price,
                increase_pct,
            }
        } else {
            ExitSignal::Hold(HoldReason::BelowTarget { increase_pct })
        }
    }
}

/// (current - average) / average * 100
pub fn price_increase_pct(current: f64, average: f64) -> f64 {
    if average <= 0.0 {
        return 0.0;
    }
    (current - average) / average * 100.0
}
