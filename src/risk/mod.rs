// Exit and risk rules
pub mod exit_rules;

pub use exit_rules::{price_increase_pct, ExitRules, ExitSignal, HoldReason};
