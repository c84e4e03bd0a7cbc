//! Layered configuration loading.
//!
//! Sources are merged in order, later winning: `config/default.toml`,
//! `config/{env}.toml`, `config/local.toml`, then environment variables
//! prefixed `JANUS` with `__` as the section separator
//! (`JANUS__BROKER__WORKER_POOL=4`).

use anyhow::Result;
use config::{Config, ConfigError, Environment, File, FileFormat};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Live,
    #[default]
    Backtest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_worker_pool")]
    pub worker_pool: usize,
    #[serde(default = "default_rate_limit_permits")]
    pub rate_limit_permits: usize,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    /// Minutes between portfolio snapshots handed to the persistence
    /// sink; 0 disables them.
    #[serde(default = "default_snapshot_minutes")]
    pub snapshot_minutes: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            worker_pool: default_worker_pool(),
            rate_limit_permits: default_rate_limit_permits(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            snapshot_minutes: default_snapshot_minutes(),
        }
    }
}

/// Simulated matching engine selection, backtest mode only.
#[derive(Debug, Clone, Deserialize)]
pub struct MatcherConfig {
    #[serde(default)]
    pub kind: MatcherKind,
    #[serde(default)]
    pub fee_rate: Decimal,
    #[serde(default)]
    pub slippage: Decimal,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            kind: MatcherKind::default(),
            fee_rate: Decimal::ZERO,
            slippage: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherKind {
    Simple,
    #[default]
    Cross,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RiskConfig {
    #[serde(default)]
    pub max_order_notional: Option<Decimal>,
    #[serde(default)]
    pub max_position_notional: Option<Decimal>,
    /// Drawdown kill-switch threshold as a fraction of asset value.
    #[serde(default)]
    pub drawdown_limit: Option<Decimal>,
    /// Per-position stop loss as a fraction of position notional.
    #[serde(default)]
    pub position_stop_loss: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    pub strategy_id: String,
    pub strategy_type: String,
    #[serde(default)]
    pub universe: Vec<String>,
    /// Initial holdings seeded into the strategy's portfolio.
    #[serde(default)]
    pub positions: HashMap<String, Decimal>,
    /// Free-form strategy arguments, decoded by the strategy itself.
    #[serde(default)]
    pub arguments: HashMap<String, Value>,
    #[serde(default = "default_accounting_unit")]
    pub accounting_unit: String,
    /// Per-strategy risk overrides keyed by check name.
    #[serde(default)]
    pub risks: HashMap<String, Value>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_worker_pool() -> usize {
    10
}

fn default_rate_limit_permits() -> usize {
    20
}

fn default_rate_limit_window_secs() -> u64 {
    1
}

fn default_snapshot_minutes() -> u64 {
    30
}

fn default_accounting_unit() -> String {
    "USDT".to_string()
}

/// Load from the `config/` directory next to the working directory,
/// overlaying `{env}.toml` and `local.toml` when present, then the
/// environment.
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    load_config_from(Path::new("config"), env)
}

pub fn load_config_from(base_path: &Path, env: Option<&str>) -> Result<AppConfig> {
    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(true));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }
    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));
    builder = builder.add_source(
        Environment::with_prefix("JANUS")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    config
        .try_deserialize()
        .map_err(|err: ConfigError| err.into())
}

/// Parse a single TOML document, used by tests and embedded defaults.
pub fn parse_config(toml: &str) -> Result<AppConfig> {
    let config = Config::builder()
        .add_source(File::from_str(toml, FileFormat::Toml))
        .build()?;
    config
        .try_deserialize()
        .map_err(|err: ConfigError| err.into())
}
