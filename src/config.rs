use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_CONFIG_PATH: &str = "config/jigsaw";
pub const ENV_PREFIX: &str = "JIGSAW";

/// Top-level bot configuration
///
/// Loaded from an optional TOML/JSON/YAML file and then overridden by
/// `JIGSAW_<SECTION>__<KEY>` environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub broker: BrokerConfig,
    pub database: DatabaseConfig,
    pub trading: TradingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub username: String,
    pub password: String,
    pub account_id: Option<String>,
    pub base_url: String,
    pub auto_trading_enabled: bool,
    /// Mirror the underlying stop with a GTC stop order on the option leg
    pub broker_stop_orders: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            account_id: None,
            base_url: "https://api.cert.tastyworks.com".to_string(),
            auto_trading_enabled: true,
            broker_stop_orders: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub redis_url: String,
    pub postgres_url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            postgres_url: "postgres://localhost/jigsawbot".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// How the trailing stop follows price once a trade is open
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TrailingStopMethod {
    #[serde(
        rename = "Heiken Ashi Candle Trail (1-3 candle lookback)",
        alias = "heikin_ashi"
    )]
    HeikinAshiCandle,
    #[serde(rename = "EMA Trail (e.g., EMA(9) trailing stop)", alias = "ema")]
    Ema,
    #[serde(
        rename = "% Price Trail (e.g., 1.5% below current price)",
        alias = "percent"
    )]
    PercentPrice,
    #[serde(rename = "ATR-Based Trail (1.5x ATR)", alias = "atr")]
    Atr,
    #[serde(rename = "Fixed Tick/Point Trail (custom value)", alias = "fixed")]
    FixedPoint,
}

impl TrailingStopMethod {
    pub const ALL: [TrailingStopMethod; 5] = [
        TrailingStopMethod::HeikinAshiCandle,
        TrailingStopMethod::Ema,
        TrailingStopMethod::PercentPrice,
        TrailingStopMethod::Atr,
        TrailingStopMethod::FixedPoint,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            TrailingStopMethod::HeikinAshiCandle => "Heikin Ashi Trail",
            TrailingStopMethod::Ema => "EMA Trail",
            TrailingStopMethod::PercentPrice => "% Price Trail",
            TrailingStopMethod::Atr => "ATR Trail",
            TrailingStopMethod::FixedPoint => "Fixed Point Trail",
        }
    }
}

/// How the initial stop is placed at entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StopLossMethod {
    #[serde(rename = "Fixed Percentage", alias = "fixed_percentage")]
    FixedPercentage,
    #[serde(rename = "ATR Multiple", alias = "atr_multiple")]
    AtrMultiple,
    #[serde(rename = "Structure-based", alias = "structure")]
    Structure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub tickers: Vec<String>,
    pub contracts_per_trade: u32,
    pub trailing_stop_method: TrailingStopMethod,
    pub no_trade_window_minutes: u32,
    pub auto_close_minutes: u32,
    pub cutoff_time: String,
    pub ema_value: usize,
    pub failsafe_minutes: i64,
    pub adx_filter: bool,
    pub adx_minimum: f64,
    pub news_filter: bool,

    // Compression detection
    pub bb_width_threshold: f64,
    pub donchian_contraction_threshold: f64,
    pub volume_squeeze_threshold: f64,

    // Option liquidity
    pub liquidity_min_volume: f64,
    pub liquidity_min_oi: f64,
    pub liquidity_max_spread: f64,

    // Stochastic
    pub stochastic_k_period: usize,
    pub stochastic_d_period: usize,
    pub stochastic_smooth: usize,
    pub stoch_bullish_threshold: f64,
    pub stoch_bearish_threshold: f64,
    pub stoch_exit_overbought: f64,
    pub stoch_exit_oversold: f64,

    // Sector alignment
    pub sector_etfs: Vec<String>,
    pub sector_weights: HashMap<String, f64>,
    pub sector_weight_threshold: f64,
    pub min_sectors_aligned: usize,
    pub use_mag7_confirmation: bool,
    pub mag7_threshold: f64,
    pub mag7_stocks: Vec<String>,

    // Stops
    pub stop_loss_method: StopLossMethod,
    pub fixed_stop_percentage: f64,
    pub atr_multiple: f64,

    pub volume_spike_threshold: f64,
    pub ha_wick_tolerance: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        let sector_weights = [("XLK", 32.0), ("XLF", 14.0), ("XLV", 11.0), ("XLY", 11.0)]
            .into_iter()
            .map(|(s, w)| (s.to_string(), w))
            .collect();

        Self {
            tickers: to_strings(&["SPY", "QQQ", "AAPL", "MSFT", "TSLA"]),
            contracts_per_trade: 1,
            trailing_stop_method: TrailingStopMethod::HeikinAshiCandle,
            no_trade_window_minutes: 3,
            auto_close_minutes: 15,
            cutoff_time: "15:15".to_string(),
            ema_value: 15,
            failsafe_minutes: 20,
            adx_filter: true,
            adx_minimum: 20.0,
            news_filter: false,
            bb_width_threshold: 0.05,
            donchian_contraction_threshold: 0.6,
            volume_squeeze_threshold: 0.3,
            liquidity_min_volume: 1_000_000.0,
            liquidity_min_oi: 500.0,
            liquidity_max_spread: 0.10,
            stochastic_k_period: 5,
            stochastic_d_period: 3,
            stochastic_smooth: 2,
            stoch_bullish_threshold: 20.0,
            stoch_bearish_threshold: 80.0,
            stoch_exit_overbought: 80.0,
            stoch_exit_oversold: 20.0,
            sector_etfs: to_strings(&["XLK", "XLF", "XLV", "XLY"]),
            sector_weights,
            sector_weight_threshold: 43.0,
            min_sectors_aligned: 2,
            use_mag7_confirmation: false,
            mag7_threshold: 60.0,
            mag7_stocks: to_strings(&["AAPL", "MSFT", "AMZN", "NVDA", "GOOG", "TSLA", "META"]),
            stop_loss_method: StopLossMethod::AtrMultiple,
            fixed_stop_percentage: 1.0,
            atr_multiple: 1.5,
            volume_spike_threshold: 1.5,
            ha_wick_tolerance: 0.1,
        }
    }
}

impl TradingConfig {
    /// Parsed `cutoff_time` (HH:MM, US/Eastern)
    pub fn cutoff(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.cutoff_time, "%H:%M")
            .with_context(|| format!("Invalid cutoff_time '{}'", self.cutoff_time))
    }
}

impl TradingConfig {
    /// Upper-case every symbol, including sector weight keys
    ///
    /// File sources may lower-case map keys.
    pub fn normalize_symbols(&mut self) {
        for list in [&mut self.tickers, &mut self.sector_etfs, &mut self.mag7_stocks] {
            for symbol in list.iter_mut() {
                *symbol = symbol.trim().to_uppercase();
            }
        }
        self.sector_weights = self
            .sector_weights
            .drain()
            .map(|(symbol, weight)| (symbol.trim().to_uppercase(), weight))
            .collect();
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

impl BotConfig {
    /// Load from `JIGSAW_CONFIG` (or `config/jigsaw.*`) plus environment overrides
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("JIGSAW_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration sources")?;

        let mut config: BotConfig = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.trading.normalize_symbols();
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the strategy cannot run with
    pub fn validate(&self) -> Result<()> {
        self.trading.cutoff()?;

        if self.trading.tickers.is_empty() {
            anyhow::bail!("trading.tickers must not be empty");
        }
        if self.trading.contracts_per_trade == 0 {
            anyhow::bail!("trading.contracts_per_trade must be at least 1");
        }
        if self.trading.stochastic_k_period == 0
            || self.trading.stochastic_d_period == 0
            || self.trading.stochastic_smooth == 0
        {
            anyhow::bail!("stochastic periods must be positive");
        }

        Ok(())
    }

    /// Default `EnvFilter` directive for this config
    pub fn log_filter(&self) -> String {
        format!("jigsawbot={}", self.logging.level.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BotConfig::default();
        assert_eq!(config.trading.tickers.len(), 5);
        assert_eq!(config.trading.sector_weights.get("XLK"), Some(&32.0));
        assert_eq!(config.trading.sector_weight_threshold, 43.0);
        assert_eq!(
            config.trading.trailing_stop_method,
            TrailingStopMethod::HeikinAshiCandle
        );
        assert_eq!(config.trading.stop_loss_method, StopLossMethod::AtrMultiple);
        assert!(config.broker.auto_trading_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cutoff_parsing() {
        let mut trading = TradingConfig::default();
        assert_eq!(
            trading.cutoff().unwrap(),
            NaiveTime::from_hms_opt(15, 15, 0).unwrap()
        );

        trading.cutoff_time = "quarter past three".to_string();
        assert!(trading.cutoff().is_err());
    }

    #[test]
    fn test_method_names_deserialize() {
        let method: TrailingStopMethod =
            serde_json::from_str("\"ATR-Based Trail (1.5x ATR)\"").unwrap();
        assert_eq!(method, TrailingStopMethod::Atr);

        let method: TrailingStopMethod = serde_json::from_str("\"percent\"").unwrap();
        assert_eq!(method, TrailingStopMethod::PercentPrice);

        let stop: StopLossMethod = serde_json::from_str("\"Structure-based\"").unwrap();
        assert_eq!(stop, StopLossMethod::Structure);
    }

    #[test]
    fn test_partial_json_merges_with_defaults() {
        let config: BotConfig = serde_json::from_str(
            r#"{"trading": {"tickers": ["IWM"], "adx_minimum": 25.0}}"#,
        )
        .unwrap();

        assert_eq!(config.trading.tickers, vec!["IWM".to_string()]);
        assert_eq!(config.trading.adx_minimum, 25.0);
        assert_eq!(config.trading.ema_value, 15);
        assert_eq!(config.database.redis_url, "redis://127.0.0.1:6379");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = BotConfig::load_from("does/not/exist/jigsaw").unwrap();
        assert_eq!(config.trading.failsafe_minutes, 20);
    }

    #[test]
    fn test_shipped_config_loads() {
        let config = BotConfig::load_from("config/jigsaw").unwrap();
        assert!(!config.broker.auto_trading_enabled);
        assert_eq!(config.trading.sector_weights.get("XLK"), Some(&32.0));
        assert_eq!(config.trading.sector_weights.len(), 4);
    }

    #[test]
    fn test_symbols_normalized() {
        let mut trading = TradingConfig {
            tickers: vec![" spy".to_string()],
            sector_weights: [("xlk".to_string(), 32.0)].into_iter().collect(),
            ..TradingConfig::default()
        };
        trading.normalize_symbols();
        assert_eq!(trading.tickers, vec!["SPY".to_string()]);
        assert_eq!(trading.sector_weights.get("XLK"), Some(&32.0));
    }

    #[test]
    fn test_empty_tickers_rejected() {
        let mut config = BotConfig::default();
        config.trading.tickers.clear();
        assert!(config.validate().is_err());
    }
}
