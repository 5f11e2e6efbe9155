use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{Quota, RateLimiter};
use reqwest::Client;

use super::Ticker;
use crate::error::GatewayError;

pub const BACKPACK_API_BASE: &str = "https://api.backpack.exchange";

type BackpackRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Public (unauthenticated) Backpack market data
///
/// Cloneable; clones share the rate limiter.
#[derive(Clone)]
pub struct BackpackRestClient {
    client: Client,
    base_url: String,
    rate_limiter: Arc<BackpackRateLimiter>,
}

impl BackpackRestClient {
    pub fn new(base_url: &str, requests_per_second: u32) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        let rps = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            rate_limiter,
        })
    }

    /// Single attempt; callers wrap this in the retry executor
    pub async fn get_ticker(&self, symbol: &str) -> Result<Ticker, GatewayError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/api/v1/ticker", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("symbol", symbol)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GatewayError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let ticker: Ticker = response.json().await?;
        tracing::debug!(symbol, last_price = %ticker.last_price, "Fetched ticker");
        Ok(ticker)
    }
}
