use std::time::Duration;

use thiserror::Error;

/// Failure of a single call into the exchange gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse exchange value '{value}' for {field}")]
    Parse { field: &'static str, value: String },

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Order not found: {0}")]
    OrderNotFound(String),
}

/// A gateway call that kept failing after every retry.
#[derive(Debug, Error)]
#[error("{operation} failed after {attempts} attempts: {last_error}")]
pub struct ExchangeCallError {
    pub operation: String,
    pub attempts: u32,
    #[source]
    pub last_error: GatewayError,
}

impl ExchangeCallError {
    /// The exchange reports insufficient balance only through its message text.
    pub fn is_insufficient_funds(&self) -> bool {
        self.last_error
            .to_string()
            .to_lowercase()
            .contains("insufficient")
    }
}

/// No viable ladder could be built for the current cycle.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanningError {
    #[error("Invalid ladder parameters: {0}")]
    InvalidParameters(String),

    #[error("Budget {budget:.2} cannot cover {order_count} orders of at least {min_order_amount:.2}")]
    InsufficientBudget {
        budget: f64,
        order_count: usize,
        min_order_amount: f64,
    },

    #[error("No order survived precision rounding")]
    NoViableOrders,
}

#[derive(Debug, Error)]
pub enum TrackerError {
    /// Halts further placement for the cycle; monitoring continues.
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(#[source] ExchangeCallError),

    #[error(transparent)]
    Exchange(#[from] ExchangeCallError),
}

impl TrackerError {
    pub fn from_call(err: ExchangeCallError) -> Self {
        if err.is_insufficient_funds() {
            TrackerError::InsufficientFunds(err)
        } else {
            TrackerError::Exchange(err)
        }
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("WebSocket connection failed: {0}")]
    Connection(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection timeout")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Anything that aborts a trading cycle and sends the controller to Restarting.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("Planning failed: {0}")]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Exchange(#[from] ExchangeCallError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("Invalid exchange data: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Price feed gave up reconnecting")]
    FeedUnavailable,
}
