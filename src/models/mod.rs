use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A spot trading pair, e.g. SOL_USDC
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Instrument {
    pub base_asset: String,
    pub quote_asset: String,
}

impl Instrument {
    pub fn new(base_asset: &str, quote_asset: &str) -> Self {
        Self {
            base_asset: base_asset.to_uppercase(),
            quote_asset: quote_asset.to_uppercase(),
        }
    }

    /// Exchange symbol (`BASE_QUOTE`)
    pub fn symbol(&self) -> String {
        format!("{}_{}", self.base_asset, self.quote_asset)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderSide {
    #[serde(rename = "Bid")]
    Buy,
    #[serde(rename = "Ask")]
    Sell,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderType {
    Limit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimeInForce {
    #[serde(rename = "GTC")]
    GoodTillCancelled,
    #[serde(rename = "IOC")]
    ImmediateOrCancel,
}

/// Order status as reported by the exchange
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Expired,
    #[serde(other)]
    Unknown,
}

/// One rung of the buy ladder. Immutable once planned.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct OrderPlan {
    pub price: f64,
    pub quantity: f64,
    pub amount: f64,
}

/// An order the exchange accepted during the current cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedOrder {
    pub id: String,
    pub price: f64,
    pub quantity: f64,
    pub amount: f64,
    pub side: OrderSide,
    pub created_at: DateTime<Utc>,
    pub processed: bool,
    pub status: OrderStatus,
}

/// Running totals over every fill detected in the cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FillStatistics {
    pub total_orders: u32,
    pub filled_orders: u32,
    pub total_filled_amount: f64,
    pub total_filled_quantity: f64,
    /// None until something with positive quantity has filled
    pub average_price: Option<f64>,
    pub last_update_time: Option<DateTime<Utc>>,
}

impl FillStatistics {
    /// Fold one fill into the totals and recompute the average cost.
    pub fn record_fill(&mut self, amount: f64, quantity: f64) {
        self.filled_orders += 1;
        if amount > 0.0 {
            self.total_filled_amount += amount;
        }
        if quantity > 0.0 {
            self.total_filled_quantity += quantity;
        }
        self.recompute_average();
        self.last_update_time = Some(Utc::now());
    }

    fn recompute_average(&mut self) {
        self.average_price = if self.total_filled_quantity > 0.0 {
            Some(self.total_filled_amount / self.total_filled_quantity)
        } else {
            None
        };
    }

    /// Mark-to-market value of the filled quantity
    pub fn position_value(&self, price: f64) -> f64 {
        self.total_filled_quantity * price
    }

    /// Unrealized P&L in quote currency and percent of cost
    pub fn unrealized_pnl(&self, price: f64) -> Option<(f64, f64)> {
        if self.total_filled_amount <= 0.0 {
            return None;
        }
        let pnl = self.position_value(price) - self.total_filled_amount;
        Some((pnl, pnl / self.total_filled_amount * 100.0))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PriceSource {
    Stream,
    Rest,
}

/// Latest observed market price. Last write wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceSample {
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub source: PriceSource,
}

impl PriceSample {
    pub fn from_stream(price: f64) -> Self {
        Self {
            price,
            timestamp: Utc::now(),
            source: PriceSource::Stream,
        }
    }

    /// Price read from the REST ticker, used until the stream delivers
    pub fn from_rest(price: f64) -> Self {
        Self {
            price,
            timestamp: Utc::now(),
            source: PriceSource::Rest,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.timestamp)
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.age(now) <= max_age
    }
}
