use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::RetryPolicy;
use crate::error::ConfigError;
use crate::execution::PriceFeedConfig;
use crate::models::Instrument;
use crate::risk::ExitRules;
use crate::strategy::{InstrumentSpec, PrecisionTable};

const ENV_PREFIX: &str = "LADDERBOT";
const MAX_MONITOR_INTERVAL_SECS: u64 = 60;

/// Bot configuration: optional TOML file, then `LADDERBOT_*` env overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub exchange: ExchangeSettings,
    pub trading: TradingSettings,
    pub timing: TimingSettings,
    pub actions: ActionSettings,
    pub feed: FeedSettings,
    /// Per-asset overrides of the built-in precision table
    pub precision: HashMap<String, InstrumentSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub rest_url: String,
    pub ws_url: String,
    pub requests_per_second: u32,
    /// Starting quote balance of the paper account
    pub paper_quote_balance: f64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            rest_url: "https://api.backpack.exchange".to_string(),
            ws_url: "wss://ws.backpack.exchange".to_string(),
            requests_per_second: 5,
            paper_quote_balance: 1000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingSettings {
    pub base_asset: String,
    pub quote_asset: String,
    pub max_drop_pct: f64,
    pub total_budget: f64,
    pub order_count: usize,
    pub increment_pct: f64,
    pub take_profit_pct: f64,
    pub min_order_amount: f64,
    /// First exit sell is priced this far below market
    pub exit_discount_pct: f64,
    /// Second exit sell, for whatever the first left behind
    pub final_exit_discount_pct: f64,
    pub placement_rounds: u32,
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            base_asset: "SOL".to_string(),
            quote_asset: "USDC".to_string(),
            max_drop_pct: 5.0,
            total_budget: 1000.0,
            order_count: 5,
            increment_pct: 10.0,
            take_profit_pct: 1.5,
            min_order_amount: 10.0,
            exit_discount_pct: 0.5,
            final_exit_discount_pct: 1.0,
            placement_rounds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    pub monitor_interval_secs: u64,
    pub check_orders_interval_secs: u64,
    pub order_delay_ms: u64,
    pub settle_delay_ms: u64,
    pub restart_cooldown_secs: u64,
    pub error_cooldown_secs: u64,
    pub price_max_age_secs: u64,
    pub heartbeat_secs: u64,
    pub connect_timeout_secs: u64,
    pub call_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            monitor_interval_secs: 30,
            check_orders_interval_secs: 30,
            order_delay_ms: 3000,
            settle_delay_ms: 2000,
            restart_cooldown_secs: 10,
            error_cooldown_secs: 300,
            price_max_age_secs: 60,
            heartbeat_secs: 20,
            connect_timeout_secs: 10,
            call_timeout_secs: 30,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionSettings {
    pub restart_after_take_profit: bool,
    pub auto_restart_no_fill: bool,
    pub no_fill_restart_minutes: i64,
    pub cancel_open_orders_on_start: bool,
    pub verify_fills_with_order_detail: bool,
}

impl Default for ActionSettings {
    fn default() -> Self {
        Self {
            restart_after_take_profit: true,
            auto_restart_no_fill: false,
            no_fill_restart_minutes: 60,
            cancel_open_orders_on_start: false,
            verify_fills_with_order_detail: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    pub max_reconnect_attempts: u32,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
        }
    }
}

impl Settings {
    /// Load from `path` (or `./ladderbot.toml` if present) plus environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("ladderbot").required(false),
        };

        let settings: Settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.trading;
        if t.base_asset.trim().is_empty() || t.quote_asset.trim().is_empty() {
            return Err(ConfigError::Invalid("base_asset and quote_asset are required".into()));
        }
        if t.order_count < 2 {
            return Err(ConfigError::Invalid(format!(
                "order_count must be at least 2, got {}",
                t.order_count
            )));
        }
        if t.total_budget <= 0.0 {
            return Err(ConfigError::Invalid("total_budget must be positive".into()));
        }
        if t.take_profit_pct <= 0.0 {
            return Err(ConfigError::Invalid("take_profit_pct must be positive".into()));
        }
        if !(t.max_drop_pct > 0.0 && t.max_drop_pct < 100.0) {
            return Err(ConfigError::Invalid(format!(
                "max_drop_pct must be in (0, 100), got {}",
                t.max_drop_pct
            )));
        }
        if t.increment_pct < 0.0 || t.min_order_amount < 0.0 {
            return Err(ConfigError::Invalid(
                "increment_pct and min_order_amount must not be negative".into(),
            ));
        }
        if !(0.0..100.0).contains(&t.exit_discount_pct)
            || !(0.0..100.0).contains(&t.final_exit_discount_pct)
        {
            return Err(ConfigError::Invalid("exit discounts must be in [0, 100)".into()));
        }
        if self.timing.monitor_interval_secs == 0 {
            return Err(ConfigError::Invalid("monitor_interval_secs must be positive".into()));
        }
        for (name, secs) in [
            ("heartbeat_secs", self.timing.heartbeat_secs),
            ("connect_timeout_secs", self.timing.connect_timeout_secs),
            ("call_timeout_secs", self.timing.call_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if self.actions.auto_restart_no_fill && self.actions.no_fill_restart_minutes <= 0 {
            return Err(ConfigError::Invalid(format!(
                "no_fill_restart_minutes must be positive, got {}",
                self.actions.no_fill_restart_minutes
            )));
        }
        if self.timing.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be at least 1".into()));
        }
        Ok(())
    }

    pub fn instrument(&self) -> Instrument {
        Instrument::new(&self.trading.base_asset, &self.trading.quote_asset)
    }

    pub fn precision_table(&self) -> PrecisionTable {
        PrecisionTable::new().with_overrides(&self.precision)
    }

    pub fn instrument_spec(&self) -> InstrumentSpec {
        self.precision_table().lookup(&self.trading.base_asset)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.timing.max_retries,
            timeout: Duration::from_secs(self.timing.call_timeout_secs),
            ..RetryPolicy::default()
        }
    }

    pub fn exit_rules(&self) -> ExitRules {
        ExitRules {
            take_profit_pct: self.trading.take_profit_pct,
            max_price_age: chrono::Duration::seconds(self.timing.price_max_age_secs as i64),
            no_fill_timeout: self
                .actions
                .auto_restart_no_fill
                .then(|| chrono::Duration::minutes(self.actions.no_fill_restart_minutes)),
        }
    }

    pub fn feed_config(&self) -> PriceFeedConfig {
        PriceFeedConfig {
            symbol: self.instrument().symbol(),
            heartbeat_interval: Duration::from_secs(self.timing.heartbeat_secs),
            connect_timeout: Duration::from_secs(self.timing.connect_timeout_secs),
            max_reconnect_attempts: self.feed.max_reconnect_attempts,
        }
    }

    /// Monitoring interval, never longer than a minute
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(
            self.timing
                .monitor_interval_secs
                .clamp(1, MAX_MONITOR_INTERVAL_SECS),
        )
    }
}
