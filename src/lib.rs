// Core modules
pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod execution;
pub mod models;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use config::Settings;
pub use error::CycleError;
pub use events::{CycleEvent, CycleObserver, TracingObserver};
pub use models::*;
