use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    parse_number, Balance, BackpackRestClient, ExchangeGateway, OpenOrder, OrderAck, OrderDetail,
    OrderRequest, Ticker,
};
use crate::error::GatewayError;
use crate::models::{Instrument, OrderSide, OrderStatus, TimeInForce};

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Default)]
struct Holding {
    available: f64,
    locked: f64,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    id: String,
    side: OrderSide,
    price: f64,
    quantity: f64,
    status: OrderStatus,
    executed_quantity: f64,
    executed_quote: f64,
}

#[derive(Debug, Default)]
struct Book {
    last_price: f64,
    base: Holding,
    quote: Holding,
    orders: HashMap<String, PaperOrder>,
    /// Resting order ids, oldest first
    resting: Vec<String>,
}

impl Book {
    fn fill(&mut self, id: &str, from_locked: bool) {
        let Some(order) = self.orders.get_mut(id) else {
            return;
        };
        let cost = order.price * order.quantity;
        match order.side {
            OrderSide::Buy => {
                if from_locked {
                    self.quote.locked = (self.quote.locked - cost).max(0.0);
                } else {
                    self.quote.available -= cost;
                }
                self.base.available += order.quantity;
            }
            OrderSide::Sell => {
                if from_locked {
                    self.base.locked = (self.base.locked - order.quantity).max(0.0);
                } else {
                    self.base.available -= order.quantity;
                }
                self.quote.available += cost;
            }
        }
        order.status = OrderStatus::Filled;
        order.executed_quantity = order.quantity;
        order.executed_quote = cost;
    }

    /// Fill every resting order the last price has crossed
    fn match_resting(&mut self) {
        if self.last_price <= 0.0 {
            return;
        }
        let price = self.last_price;
        let crossed: Vec<String> = self
            .resting
            .iter()
            .filter(|id| {
                self.orders.get(*id).is_some_and(|o| match o.side {
                    OrderSide::Buy => price <= o.price,
                    OrderSide::Sell => price >= o.price,
                })
            })
            .cloned()
            .collect();

        for id in &crossed {
            self.fill(id, true);
            tracing::debug!(order_id = %id, price, "Paper order filled");
        }
        self.resting.retain(|id| !crossed.contains(id));
    }

    fn cancel(&mut self, id: &str) -> bool {
        let Some(position) = self.resting.iter().position(|r| r == id) else {
            return false;
        };
        self.resting.remove(position);
        if let Some(order) = self.orders.get_mut(id) {
            let cost = order.price * order.quantity;
            match order.side {
                OrderSide::Buy => {
                    self.quote.locked = (self.quote.locked - cost).max(0.0);
                    self.quote.available += cost;
                }
                OrderSide::Sell => {
                    self.base.locked = (self.base.locked - order.quantity).max(0.0);
                    self.base.available += order.quantity;
                }
            }
            order.status = OrderStatus::Cancelled;
        }
        true
    }
}

/// Locally simulated spot account.
///
/// Limit orders that cross the last price fill in full at their limit; the
/// rest wait on the book until a later price crosses them. With a market
/// client attached, the last price tracks the live public ticker.
pub struct PaperExchange {
    instrument: Instrument,
    market: Option<BackpackRestClient>,
    book: Mutex<Book>,
}

impl PaperExchange {
    /// Fixed-price account, driven only by `set_price`
    pub fn offline(instrument: Instrument, quote_balance: f64, price: f64) -> Self {
        let book = Book {
            last_price: price,
            quote: Holding {
                available: quote_balance,
                locked: 0.0,
            },
            ..Book::default()
        };
        Self {
            instrument,
            market: None,
            book: Mutex::new(book),
        }
    }

    /// Account that follows the live ticker
    pub fn with_market(instrument: Instrument, quote_balance: f64, market: BackpackRestClient) -> Self {
        let mut exchange = Self::offline(instrument, quote_balance, 0.0);
        exchange.market = Some(market);
        exchange
    }

    pub async fn set_price(&self, price: f64) {
        let mut book = self.book.lock().await;
        book.last_price = price;
        book.match_resting();
    }

    async fn refresh_price(&self) -> Result<(), GatewayError> {
        if let Some(market) = &self.market {
            let price = market.get_ticker(&self.instrument.symbol()).await?.last_price()?;
            self.set_price(price).await;
        }
        Ok(())
    }

    fn check_symbol(&self, symbol: &str) -> Result<(), GatewayError> {
        if symbol.eq_ignore_ascii_case(&self.instrument.symbol()) {
            Ok(())
        } else {
            Err(GatewayError::Api {
                status: 400,
                message: format!("Unknown symbol {}", symbol),
            })
        }
    }
}

fn rejected(message: &str) -> GatewayError {
    GatewayError::Api {
        status: 400,
        message: message.to_string(),
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, GatewayError> {
        self.check_symbol(symbol)?;
        self.refresh_price().await?;
        let book = self.book.lock().await;
        Ok(Ticker {
            symbol: self.instrument.symbol(),
            last_price: book.last_price.to_string(),
        })
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, GatewayError> {
        self.check_symbol(symbol)?;
        self.refresh_price().await?;
        let book = self.book.lock().await;
        Ok(book
            .resting
            .iter()
            .filter_map(|id| book.orders.get(id))
            .map(|o| OpenOrder {
                id: o.id.clone(),
                symbol: self.instrument.symbol(),
                side: o.side,
                price: o.price.to_string(),
                quantity: o.quantity.to_string(),
            })
            .collect())
    }

    async fn get_order_detail(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderDetail, GatewayError> {
        self.check_symbol(symbol)?;
        let book = self.book.lock().await;
        let order = book
            .orders
            .get(order_id)
            .ok_or_else(|| GatewayError::OrderNotFound(order_id.to_string()))?;
        Ok(OrderDetail {
            id: order.id.clone(),
            side: order.side,
            status: order.status,
            executed_quantity: order.executed_quantity.to_string(),
            executed_quote_quantity: order.executed_quote.to_string(),
        })
    }

    async fn get_balances(&self) -> Result<Vec<Balance>, GatewayError> {
        let book = self.book.lock().await;
        Ok(vec![
            Balance {
                asset: self.instrument.base_asset.clone(),
                available: book.base.available.to_string(),
                locked: book.base.locked.to_string(),
            },
            Balance {
                asset: self.instrument.quote_asset.clone(),
                available: book.quote.available.to_string(),
                locked: book.quote.locked.to_string(),
            },
        ])
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError> {
        self.check_symbol(&request.symbol)?;
        let price = parse_number("price", &request.price)?;
        let quantity = parse_number("quantity", &request.quantity)?;
        if price <= 0.0 || quantity <= 0.0 {
            return Err(rejected("Price and quantity must be positive"));
        }

        self.refresh_price().await?;
        let mut book = self.book.lock().await;

        let cost = price * quantity;
        match request.side {
            OrderSide::Buy if cost > book.quote.available + EPSILON => {
                return Err(rejected("Insufficient funds"));
            }
            OrderSide::Sell if quantity > book.base.available + EPSILON => {
                return Err(rejected("Insufficient funds"));
            }
            _ => {}
        }

        let crosses = book.last_price > 0.0
            && match request.side {
                OrderSide::Buy => price >= book.last_price,
                OrderSide::Sell => price <= book.last_price,
            };

        let id = Uuid::new_v4().to_string();
        book.orders.insert(
            id.clone(),
            PaperOrder {
                id: id.clone(),
                side: request.side,
                price,
                quantity,
                status: OrderStatus::New,
                executed_quantity: 0.0,
                executed_quote: 0.0,
            },
        );

        let status = if crosses {
            book.fill(&id, false);
            OrderStatus::Filled
        } else if request.time_in_force == TimeInForce::ImmediateOrCancel {
            if let Some(order) = book.orders.get_mut(&id) {
                order.status = OrderStatus::Expired;
            }
            OrderStatus::Expired
        } else {
            match request.side {
                OrderSide::Buy => {
                    book.quote.available -= cost;
                    book.quote.locked += cost;
                }
                OrderSide::Sell => {
                    book.base.available -= quantity;
                    book.base.locked += quantity;
                }
            }
            book.resting.push(id.clone());
            OrderStatus::New
        };

        Ok(OrderAck { id, status })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError> {
        self.check_symbol(symbol)?;
        let mut book = self.book.lock().await;
        if book.cancel(order_id) {
            Ok(())
        } else {
            Err(GatewayError::OrderNotFound(order_id.to_string()))
        }
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), GatewayError> {
        self.check_symbol(symbol)?;
        let mut book = self.book.lock().await;
        let ids = book.resting.clone();
        for id in ids {
            book.cancel(&id);
        }
        Ok(())
    }
}
