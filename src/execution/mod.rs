// Order lifecycle: price stream, order tracking and the cycle controller
pub mod controller;
pub mod cycle_state;
pub mod price_feed;
pub mod tracker;

pub use controller::{CycleController, CycleOutcome, CyclePhase, RunSummary, Shutdown};
pub use cycle_state::CycleState;
pub use price_feed::{match_ticker_price, FeedState, PriceFeed, PriceFeedConfig};
pub use tracker::{OrderTracker, ReconcileOutcome, SubmitOutcome};
