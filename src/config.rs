use std::path::Path;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::indicators::RefreshMode;
use crate::strategy::MeanReversionConfig;
use crate::Result;

const ENV_PREFIX: &str = "REVERTBOT";
const DEFAULT_CONFIG_FILE: &str = "revertbot";

/// Top-level bot configuration
///
/// Layered as: built-in defaults, then an optional TOML file, then
/// `REVERTBOT_*` environment variables (nested keys separated by `__`,
/// e.g. `REVERTBOT_RISK__COOLDOWN_SAMPLES=5`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Instrument traded (e.g. "BTCUSDT")
    pub symbol: String,

    /// Asset the account balance is held in (e.g. "USDT")
    pub quote_asset: String,

    pub indicator: IndicatorConfig,
    pub strategy: MeanReversionConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub feed: FeedConfig,
    pub paper: PaperConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            quote_asset: "USDT".to_string(),
            indicator: IndicatorConfig::default(),
            strategy: MeanReversionConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            feed: FeedConfig::default(),
            paper: PaperConfig::default(),
        }
    }
}

/// Which price events drive the indicator and the state machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    /// Every update (book ticker / trades)
    #[default]
    Tick,
    /// Only confirmed bar closes
    BarClose,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    /// Number of prices in the moving average
    pub window_length: usize,

    pub refresh_mode: RefreshMode,

    /// Timer period for `RefreshMode::Periodic`
    pub refresh_interval_secs: u64,

    pub signal_source: SignalSource,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            window_length: 20,
            refresh_mode: RefreshMode::PerSample,
            refresh_interval_secs: 300, // 5 minutes
            signal_source: SignalSource::Tick,
        }
    }
}

impl IndicatorConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Percent of the quote balance risked per trade (1.0 = 1%)
    pub risk_per_trade_pct: Decimal,

    /// Entries in a direction stop after this many stop losses in a row
    pub max_consecutive_losses: u32,

    /// Samples to wait after an exit before a new entry
    pub cooldown_samples: u64,

    /// Minimum spacing between break-even checks, on event time
    pub break_even_check_interval_secs: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade_pct: dec!(1.0),
            max_consecutive_losses: 2,
            cooldown_samples: 3,
            break_even_check_interval_secs: 300,
        }
    }
}

impl RiskConfig {
    pub fn break_even_check_interval(&self) -> Duration {
        Duration::from_secs(self.break_even_check_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Placement attempts per order before giving up
    pub max_attempts: u32,

    pub backoff: BackoffKind,

    /// Delay between attempts (first delay for exponential backoff)
    pub backoff_ms: u64,

    /// Upper bound for exponential backoff
    pub max_backoff_ms: u64,

    /// How long to poll an order before accepting its last status
    pub max_fill_wait_ms: u64,

    pub poll_interval_ms: u64,

    /// Client-side order rate limit (0 disables it)
    pub max_orders_per_second: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Fixed,
            backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            max_fill_wait_ms: 5_000,
            poll_interval_ms: 500,
            max_orders_per_second: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Delay before resubscribing after a failure
    pub reconnect_delay_secs: u64,

    /// Silence longer than this is treated as a dead connection
    pub stall_timeout_secs: u64,

    /// Engine mailbox capacity
    pub channel_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: 5,
            stall_timeout_secs: 30,
            channel_capacity: 1_024,
        }
    }
}

impl FeedConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

/// Simulated exchange used by the bundled binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub seed: u64,
    pub starting_price: Decimal,
    pub starting_balance: Decimal,
    pub step_size: Decimal,
    pub tick_interval_ms: u64,

    /// Maximum move per tick, in percent
    pub volatility_pct: f64,

    /// Bid/ask spread, in percent of price
    pub spread_pct: f64,

    /// Drop the stream after this many events (exercises reconnects)
    pub disconnect_after: Option<u64>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            starting_price: dec!(60000),
            starting_balance: dec!(10000),
            step_size: dec!(0.001),
            tick_interval_ms: 250,
            volatility_pct: 0.05,
            spread_pct: 0.002,
            disconnect_after: None,
        }
    }
}

impl BotConfig {
    /// Load configuration from defaults, an optional file and the environment
    ///
    /// With no explicit path, `revertbot.toml` in the working directory is
    /// used if present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: BotConfig = settings.try_deserialize()?;
        loaded.validate()?;

        tracing::debug!(symbol = %loaded.symbol, "Configuration loaded");
        Ok(loaded)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err("symbol must not be empty".into());
        }
        if self.indicator.window_length == 0 {
            return Err("indicator.window_length must be at least 1".into());
        }
        if self.indicator.refresh_mode == RefreshMode::Periodic
            && self.indicator.refresh_interval_secs == 0
        {
            return Err("indicator.refresh_interval_secs must be positive in periodic mode".into());
        }
        self.strategy.validate()?;
        if self.risk.risk_per_trade_pct <= Decimal::ZERO {
            return Err("risk.risk_per_trade_pct must be positive".into());
        }
        if self.execution.max_attempts == 0 {
            return Err("execution.max_attempts must be at least 1".into());
        }
        if self.execution.poll_interval_ms == 0 {
            return Err("execution.poll_interval_ms must be positive".into());
        }
        if self.paper.step_size <= Decimal::ZERO {
            return Err("paper.step_size must be positive".into());
        }
        if self.feed.channel_capacity == 0 {
            return Err("feed.channel_capacity must be positive".into());
        }
        Ok(())
    }
}
