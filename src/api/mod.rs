// Exchange access module
pub mod backpack;
pub mod paper;
pub mod retry;
pub mod stream;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::models::{OrderSide, OrderStatus, OrderType, TimeInForce};

pub use backpack::BackpackRestClient;
pub use paper::PaperExchange;
pub use retry::{RetryExecutor, RetryPolicy};
pub use stream::{StreamConnector, StreamMessage, StreamSession, WsConnector};

/// Public ticker. Numbers arrive as exchange-native strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub symbol: String,
    pub last_price: String,
}

impl Ticker {
    pub fn last_price(&self) -> Result<f64, GatewayError> {
        parse_number("lastPrice", &self.last_price)
    }
}

/// A resting order in the open-orders snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: String,
    pub quantity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDetail {
    pub id: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub executed_quantity: String,
    pub executed_quote_quantity: String,
}

impl OrderDetail {
    /// (executed quote amount, executed quantity)
    pub fn executed(&self) -> Result<(f64, f64), GatewayError> {
        Ok((
            parse_number("executedQuoteQuantity", &self.executed_quote_quantity)?,
            parse_number("executedQuantity", &self.executed_quantity)?,
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub available: String,
    pub locked: String,
}

impl Balance {
    pub fn available(&self) -> Result<f64, GatewayError> {
        parse_number("available", &self.available)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: String,
    pub price: String,
    pub time_in_force: TimeInForce,
}

/// Submission acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub id: String,
    pub status: OrderStatus,
}

/// Everything the trading core needs from an exchange.
///
/// Implementations do a single attempt per call; retries and timeouts are
/// layered on top by [`RetryExecutor`].
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, GatewayError>;

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, GatewayError>;

    async fn get_order_detail(&self, symbol: &str, order_id: &str)
        -> Result<OrderDetail, GatewayError>;

    async fn get_balances(&self) -> Result<Vec<Balance>, GatewayError>;

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError>;

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), GatewayError>;
}

/// Parse an exchange-native numeric string. Empty strings read as zero.
pub fn parse_number(field: &'static str, value: &str) -> Result<f64, GatewayError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(0.0);
    }
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| GatewayError::Parse {
            field,
            value: value.to_string(),
        })
}
