use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::application::market_session::SessionConfig;
use crate::domain::services::entry_signal::EntrySignalConfig;
use crate::domain::services::fees::FeeModel;
use crate::domain::services::order_fill_engine::OrderFillConfig;
use crate::domain::services::risk_exit_monitor::RiskExitConfig;
use crate::infrastructure::paper_broker::PaperConfig;

/// Engine configuration shared by every session
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Strategy
    pub order_size: f64,
    pub trigger_price: f64,
    pub target_price: f64,
    pub stoploss_offset: f64,
    pub reentry_max_price: f64,
    pub max_positions_per_market: u32,

    // Time gates (seconds to close)
    pub no_buy_threshold_secs: f64,
    pub force_close_threshold_secs: f64,
    pub cancel_threshold_secs: f64,
    pub early_window_threshold_secs: f64,

    // Fees
    pub taker_fee_rate: f64,
    pub min_taker_fee: f64,

    // Fill ladder
    pub fill_max_attempts: u32,
    pub fill_settle_delay_ms: u64,
    pub fill_price_increment: f64,
    pub buy_price_ceiling: f64,
    pub sell_price_floor: f64,
    pub min_tick: f64,
    pub min_order_size: f64,

    // Loop timing
    pub position_check_interval_secs: u64,
    pub market_scan_interval_secs: u64,
    pub stop_reconcile_timeout_secs: u64,

    // Paper trading
    pub paper_trading: bool,
    pub paper_balance: f64,
    pub paper_fill_tolerance: f64,

    // Venue
    pub clob_host: String,
    pub gamma_host: String,
    pub market_slug_prefix: String,
    pub market_window_secs: u64,
    pub clob_requests_per_second: u32,

    pub database_url: String,
    pub control_bind_addr: String,
    /// Start a session as soon as the process is up
    pub auto_start: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            order_size: 100.0,
            trigger_price: 0.75,
            target_price: 0.99,
            stoploss_offset: 0.15,
            reentry_max_price: 0.90,
            max_positions_per_market: 3,

            no_buy_threshold_secs: 10.0,
            force_close_threshold_secs: 5.0,
            cancel_threshold_secs: 10.0,
            early_window_threshold_secs: 300.0,

            taker_fee_rate: 0.001,
            min_taker_fee: 0.001,

            fill_max_attempts: 5,
            fill_settle_delay_ms: 1000,
            fill_price_increment: 0.01,
            buy_price_ceiling: 0.99,
            sell_price_floor: 0.01,
            min_tick: 0.01,
            min_order_size: 0.1,

            position_check_interval_secs: 2,
            market_scan_interval_secs: 10,
            stop_reconcile_timeout_secs: 10,

            paper_trading: true,
            paper_balance: 1000.0,
            paper_fill_tolerance: 0.02,

            clob_host: "https://clob.polymarket.com".to_string(),
            gamma_host: "https://gamma-api.polymarket.com".to_string(),
            market_slug_prefix: "btc-updown-5m".to_string(),
            market_window_secs: 300,
            clob_requests_per_second: 10,

            database_url: "sqlite://data/updown.db".to_string(),
            control_bind_addr: "127.0.0.1:3000".to_string(),
            auto_start: false,
        }
    }
}

fn is_probability(value: &f64) -> bool {
    *value > 0.0 && *value < 1.0
}

/// Override `target` from `key` when the value parses and passes `valid`
fn override_from_env<T>(key: &str, target: &mut T, valid: impl Fn(&T) -> bool, rule: &str)
where
    T: FromStr + Display,
    T::Err: Display,
{
    let Ok(raw) = std::env::var(key) else {
        return;
    };

    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => *target = value,
        Ok(value) => {
            tracing::warn!(
                "Invalid {} value: {} ({}), using default: {}",
                key,
                value,
                rule,
                target
            );
        }
        Err(e) => {
            tracing::warn!(
                "Failed to parse {} '{}': {}, using default: {}",
                key,
                raw,
                e,
                target
            );
        }
    }
}

fn override_string(key: &str, target: &mut String) {
    if let Ok(value) = std::env::var(key) {
        let value = value.trim();
        if !value.is_empty() {
            *target = value.trim_end_matches('/').to_string();
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> EngineConfig {
        let mut config = EngineConfig::default();

        override_from_env("ORDER_SIZE", &mut config.order_size, |v| *v > 0.0, "must be positive");
        override_from_env("TRIGGER_PRICE", &mut config.trigger_price, is_probability, "must be between 0 and 1");
        override_from_env("TARGET_PRICE", &mut config.target_price, is_probability, "must be between 0 and 1");
        override_from_env("STOPLOSS_OFFSET", &mut config.stoploss_offset, is_probability, "must be between 0 and 1");
        override_from_env("REENTRY_MAX_PRICE", &mut config.reentry_max_price, is_probability, "must be between 0 and 1");
        override_from_env(
            "MAX_POSITIONS_PER_MARKET",
            &mut config.max_positions_per_market,
            |v| (1..=20).contains(v),
            "must be between 1 and 20",
        );

        override_from_env("NO_BUY_THRESHOLD_SECS", &mut config.no_buy_threshold_secs, |v| *v >= 0.0, "must not be negative");
        override_from_env("FORCE_CLOSE_THRESHOLD_SECS", &mut config.force_close_threshold_secs, |v| *v >= 0.0, "must not be negative");
        override_from_env("CANCEL_THRESHOLD_SECS", &mut config.cancel_threshold_secs, |v| *v >= 0.0, "must not be negative");
        override_from_env(
            "EARLY_WINDOW_THRESHOLD_SECS",
            &mut config.early_window_threshold_secs,
            |v| *v > 0.0,
            "must be positive",
        );

        override_from_env("TAKER_FEE_RATE", &mut config.taker_fee_rate, |v| (0.0..0.1).contains(v), "must be between 0 and 0.1");
        override_from_env("MIN_TAKER_FEE", &mut config.min_taker_fee, |v| *v >= 0.0, "must not be negative");

        override_from_env(
            "FILL_MAX_ATTEMPTS",
            &mut config.fill_max_attempts,
            |v| (2..=10).contains(v),
            "must be between 2 and 10",
        );
        override_from_env(
            "FILL_SETTLE_DELAY_MS",
            &mut config.fill_settle_delay_ms,
            |v| *v <= 30_000,
            "must be at most 30000",
        );
        override_from_env("FILL_PRICE_INCREMENT", &mut config.fill_price_increment, is_probability, "must be between 0 and 1");
        override_from_env("BUY_PRICE_CEILING", &mut config.buy_price_ceiling, is_probability, "must be between 0 and 1");
        override_from_env("SELL_PRICE_FLOOR", &mut config.sell_price_floor, is_probability, "must be between 0 and 1");
        override_from_env("MIN_TICK", &mut config.min_tick, is_probability, "must be between 0 and 1");
        override_from_env("MIN_ORDER_SIZE", &mut config.min_order_size, |v| *v > 0.0, "must be positive");

        override_from_env(
            "POSITION_CHECK_INTERVAL_SECS",
            &mut config.position_check_interval_secs,
            |v| (1..=60).contains(v),
            "must be between 1 and 60",
        );
        override_from_env(
            "MARKET_SCAN_INTERVAL_SECS",
            &mut config.market_scan_interval_secs,
            |v| (1..=300).contains(v),
            "must be between 1 and 300",
        );
        override_from_env(
            "STOP_RECONCILE_TIMEOUT_SECS",
            &mut config.stop_reconcile_timeout_secs,
            |v| (1..=120).contains(v),
            "must be between 1 and 120",
        );

        if let Ok(paper) = std::env::var("PAPER_TRADING") {
            config.paper_trading = paper.to_lowercase() == "true" || paper == "1";
        }
        override_from_env("PAPER_BALANCE", &mut config.paper_balance, |v| *v >= 0.0, "must not be negative");
        override_from_env(
            "PAPER_FILL_TOLERANCE",
            &mut config.paper_fill_tolerance,
            |v| (0.0..=0.5).contains(v),
            "must be between 0 and 0.5",
        );

        override_string("CLOB_HOST", &mut config.clob_host);
        override_string("GAMMA_HOST", &mut config.gamma_host);
        override_string("MARKET_SLUG_PREFIX", &mut config.market_slug_prefix);
        override_from_env(
            "MARKET_WINDOW_SECS",
            &mut config.market_window_secs,
            |v| *v >= 60,
            "must be at least 60",
        );
        override_from_env(
            "CLOB_REQUESTS_PER_SECOND",
            &mut config.clob_requests_per_second,
            |v| (1..=100).contains(v),
            "must be between 1 and 100",
        );

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(addr) = std::env::var("CONTROL_BIND_ADDR") {
            config.control_bind_addr = addr;
        }
        if let Ok(auto) = std::env::var("AUTO_START") {
            config.auto_start = auto.to_lowercase() == "true" || auto == "1";
        }

        config.validate_bounds();
        config
    }

    /// Restore defaults for combinations that contradict each other
    fn validate_bounds(&mut self) {
        let defaults = EngineConfig::default();

        if self.trigger_price >= self.target_price {
            tracing::warn!(
                "TRIGGER_PRICE {} must be below TARGET_PRICE {}, using defaults {}/{}",
                self.trigger_price,
                self.target_price,
                defaults.trigger_price,
                defaults.target_price
            );
            self.trigger_price = defaults.trigger_price;
            self.target_price = defaults.target_price;
        }

        if self.sell_price_floor >= self.buy_price_ceiling {
            tracing::warn!(
                "SELL_PRICE_FLOOR {} must be below BUY_PRICE_CEILING {}, using defaults",
                self.sell_price_floor,
                self.buy_price_ceiling
            );
            self.sell_price_floor = defaults.sell_price_floor;
            self.buy_price_ceiling = defaults.buy_price_ceiling;
        }
    }

    pub fn fee_model(&self) -> FeeModel {
        FeeModel::new(self.taker_fee_rate, self.min_taker_fee)
    }

    pub fn fill_config(&self) -> OrderFillConfig {
        OrderFillConfig {
            max_attempts: self.fill_max_attempts,
            settle_delay: Duration::from_millis(self.fill_settle_delay_ms),
            price_increment: self.fill_price_increment,
            buy_price_ceiling: self.buy_price_ceiling,
            sell_price_floor: self.sell_price_floor,
            min_tick: self.min_tick,
            min_order_size: self.min_order_size,
        }
    }

    pub fn risk_config(&self) -> RiskExitConfig {
        RiskExitConfig {
            target_price: self.target_price,
            stoploss_offset: self.stoploss_offset,
            min_tick: self.min_tick,
            force_close_threshold_secs: self.force_close_threshold_secs,
            cancel_threshold_secs: self.cancel_threshold_secs,
        }
    }

    pub fn entry_config(&self) -> EntrySignalConfig {
        EntrySignalConfig {
            trigger_price: self.trigger_price,
            target_price: self.target_price,
            reentry_max_price: self.reentry_max_price,
            no_buy_threshold_secs: self.no_buy_threshold_secs,
            early_window_threshold_secs: self.early_window_threshold_secs,
        }
    }

    pub fn paper_config(&self) -> PaperConfig {
        PaperConfig {
            starting_balance: self.paper_balance,
            fill_tolerance: self.paper_fill_tolerance,
            tick: self.min_tick,
            fees: self.fee_model(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            order_size: self.order_size,
            max_positions: self.max_positions_per_market,
            min_order_size: self.min_order_size,
            no_buy_threshold_secs: self.no_buy_threshold_secs,
            force_close_threshold_secs: self.force_close_threshold_secs,
            position_check_interval: Duration::from_secs(self.position_check_interval_secs),
            market_scan_interval: Duration::from_secs(self.market_scan_interval_secs),
            stop_reconcile_timeout: Duration::from_secs(self.stop_reconcile_timeout_secs),
            paper_trading: self.paper_trading,
        }
    }
}

/// Live-trading credentials, only loaded when paper trading is off
pub struct LiveCredentials {
    pub private_key: Zeroizing<String>,
    pub api_key: String,
    pub api_secret: Zeroizing<String>,
    pub api_passphrase: Zeroizing<String>,
    /// Proxy wallet holding the funds, when different from the signer
    pub funder: Option<String>,
}

impl std::fmt::Debug for LiveCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveCredentials")
            .field("api_key", &self.api_key)
            .field("funder", &self.funder)
            .finish_non_exhaustive()
    }
}

impl LiveCredentials {
    pub fn from_env() -> Result<Self, String> {
        fn required(key: &str) -> Result<String, String> {
            match std::env::var(key) {
                Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
                _ => Err(format!("{} must be set for live trading", key)),
            }
        }

        Ok(Self {
            private_key: Zeroizing::new(required("POLY_PRIVATE_KEY")?),
            api_key: required("POLY_API_KEY")?,
            api_secret: Zeroizing::new(required("POLY_API_SECRET")?),
            api_passphrase: Zeroizing::new(required("POLY_API_PASSPHRASE")?),
            funder: std::env::var("POLY_FUNDER")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        })
    }
}
