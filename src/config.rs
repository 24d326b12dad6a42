//! Configuration surfaces. Every struct is built once at startup and passed
//! to the components that need it.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::exchange::{PositionMode, RetryPolicy};
use crate::model::{EntryKey, Tier, TierTable};

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Yaml(PathBuf, serde_yaml::Error),
    Csv(PathBuf, csv::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "failed to read {}: {}", path.display(), e),
            ConfigError::Yaml(path, e) => write!(f, "failed to parse {}: {}", path.display(), e),
            ConfigError::Csv(path, e) => write!(f, "failed to parse {}: {}", path.display(), e),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let yaml_str =
        fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
    serde_yaml::from_str(&yaml_str).map_err(|e| ConfigError::Yaml(path.to_path_buf(), e))
}

fn default_db_path() -> String {
    "trade_db.sqlite".to_string()
}

fn default_bots_dir() -> String {
    "bots".to_string()
}

fn default_keys_path() -> String {
    "keys.csv".to_string()
}

fn default_proxies_path() -> String {
    "proxies.csv".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_lock_lease_secs() -> u64 {
    600
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5000
}

/// Process-wide settings shared by every binary.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct MasterConfig {
    #[serde(default)]
    pub testnet: bool,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_bots_dir")]
    pub bots_dir: String,
    #[serde(default = "default_keys_path")]
    pub keys_path: String,
    #[serde(default = "default_proxies_path")]
    pub proxies_path: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_true")]
    pub audit_log_enabled: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Accounts run in hedge mode, with separate long and short slots.
    #[serde(default = "default_true")]
    pub hedge_mode: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            testnet: false,
            db_path: default_db_path(),
            bots_dir: default_bots_dir(),
            keys_path: default_keys_path(),
            proxies_path: default_proxies_path(),
            log_dir: default_log_dir(),
            audit_log_enabled: true,
            poll_interval_ms: default_poll_interval_ms(),
            lock_lease_secs: default_lock_lease_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            hedge_mode: true,
        }
    }
}

impl MasterConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        read_yaml(path)
    }

    /// Path from `SIGNAL_TRADER_CONFIG`, falling back to `master.yaml`.
    pub fn path_from_env() -> PathBuf {
        std::env::var("SIGNAL_TRADER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("master.yaml"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    pub fn position_mode(&self) -> PositionMode {
        if self.hedge_mode {
            PositionMode::Hedge
        } else {
            PositionMode::OneWay
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, Duration::from_millis(self.retry_delay_ms))
    }

    pub fn bot_config_path(&self, bot_id: &str) -> PathBuf {
        Path::new(&self.bots_dir).join(format!("{}.yaml", bot_id))
    }
}

fn default_max_message_age_secs() -> u64 {
    90
}

fn default_max_order_secs() -> u64 {
    60
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TimingConfig {
    #[serde(default = "default_max_message_age_secs")]
    pub max_message_age_secs: u64,
    #[serde(default = "default_max_order_secs")]
    pub max_order_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            max_message_age_secs: default_max_message_age_secs(),
            max_order_secs: default_max_order_secs(),
        }
    }
}

/// One rung of the take-profit ladder placed after an entry.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TakeProfitLevel {
    /// Distance from the entry price, in percent.
    pub percent: f64,
    /// Share of the position closed at this level, in percent.
    pub position_percent: f64,
}

/// What take-profit-*-3 does when the target is not reached.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TakeProfitMiss {
    /// Fail the command with a warning.
    #[default]
    Reject,
    /// Place a new balance-sized market order in the position's direction.
    Reenter,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PairConfig {
    pub leverage: f64,
    #[serde(default)]
    pub is_isolated: bool,
    pub portfolio_percent: f64,
    /// Stop distance from entry in percent; no stop is attached when unset.
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profits: Vec<TakeProfitLevel>,
    #[serde(default)]
    pub take_profit_miss: TakeProfitMiss,
}

/// Per-bot trade parameters, `<bots_dir>/<bot_id>.yaml`.
#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub struct BotConfig {
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub pairs: HashMap<String, PairConfig>,
}

impl BotConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        read_yaml(path)
    }

    /// Pair settings, looked up case-insensitively.
    pub fn pair(&self, pair: &str) -> Option<&PairConfig> {
        let wanted = pair.to_uppercase();
        self.pairs
            .iter()
            .find(|(name, _)| name.to_uppercase() == wanted)
            .map(|(_, config)| config)
    }

    pub fn max_message_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.timing.max_message_age_secs as i64)
    }

    pub fn max_order_time(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.timing.max_order_secs as i64)
    }
}

fn default_tiers_path() -> String {
    "sl_settings.csv".to_string()
}

/// Trailing stop controller settings, `sl_adjuster.yaml`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct AdjusterConfig {
    pub slow_mode_delay_secs: u64,
    pub fast_mode_delay_secs: u64,
    #[serde(default = "default_tiers_path")]
    pub tiers_path: String,
}

impl AdjusterConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: AdjusterConfig = read_yaml(path)?;
        if config.slow_mode_delay_secs == 0 || config.fast_mode_delay_secs == 0 {
            return Err(ConfigError::Invalid(
                "slow_mode_delay_secs and fast_mode_delay_secs must be positive".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn slow_delay(&self) -> Duration {
        Duration::from_secs(self.slow_mode_delay_secs)
    }

    pub fn fast_delay(&self) -> Duration {
        Duration::from_secs(self.fast_mode_delay_secs)
    }
}

/// Tier table of one monitored (bot, pair).
#[derive(Debug, Clone, PartialEq)]
pub struct TierEntry {
    pub key: EntryKey,
    pub table: TierTable,
}

/// Parses the tier CSV: `botid,pair,1a,1b,2a,2b,...`.
///
/// `Na` is the PnL% threshold and `Nb` the stop offset of tier N. Each row's
/// tiers end at the first pair with a missing or empty cell.
pub fn parse_tier_entries<R: std::io::Read>(reader: R) -> Result<Vec<TierEntry>, csv::Error> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    let column = |name: &str| headers.iter().position(|h| h == name);
    let bot_col = column("botid");
    let pair_col = column("pair");

    let mut entries = Vec::new();
    for record in rdr.records() {
        let record = record?;
        let cell = |idx: Option<usize>| idx.and_then(|i| record.get(i)).filter(|v| !v.is_empty());

        let (Some(bot_id), Some(pair)) = (cell(bot_col), cell(pair_col)) else {
            continue;
        };

        let mut tiers = Vec::new();
        let mut n = 1;
        loop {
            let threshold = cell(column(&format!("{}a", n))).and_then(|v| v.parse::<f64>().ok());
            let offset = cell(column(&format!("{}b", n))).and_then(|v| v.parse::<f64>().ok());
            match (threshold, offset) {
                (Some(threshold), Some(offset)) => tiers.push(Tier::new(threshold, offset)),
                _ => break,
            }
            n += 1;
        }

        entries.push(TierEntry {
            key: EntryKey::new(bot_id, pair.to_uppercase()),
            table: TierTable::new(tiers),
        });
    }
    Ok(entries)
}

pub fn load_tier_entries(path: &Path) -> Result<Vec<TierEntry>, ConfigError> {
    let file = fs::File::open(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
    parse_tier_entries(file).map_err(|e| ConfigError::Csv(path.to_path_buf(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_config_defaults() {
        let config: MasterConfig = serde_yaml::from_str("testnet: true\n").unwrap();
        assert!(config.testnet);
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.lock_lease(), Duration::from_secs(600));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.bot_config_path("7"), PathBuf::from("bots/7.yaml"));
    }

    #[test]
    fn test_position_mode_setting() {
        let hedge: MasterConfig = serde_yaml::from_str("testnet: false\n").unwrap();
        assert_eq!(hedge.position_mode(), PositionMode::Hedge);
        let one_way: MasterConfig = serde_yaml::from_str("hedge_mode: false\n").unwrap();
        assert_eq!(one_way.position_mode(), PositionMode::OneWay);
    }

    #[test]
    fn test_bot_config_from_yaml() {
        let yaml = r#"
timing:
  max_message_age_secs: 30
pairs:
  BTCUSDT:
    leverage: 5
    is_isolated: true
    portfolio_percent: 20
    stop_loss: 2.5
    take_profits:
      - { percent: 10, position_percent: 50 }
      - { percent: 20, position_percent: 50 }
  ETHUSDT:
    leverage: 3
    portfolio_percent: 10
    take_profit_miss: reenter
"#;
        let config: BotConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.timing.max_message_age_secs, 30);
        assert_eq!(config.timing.max_order_secs, 60);

        let btc = config.pair("btcusdt").unwrap();
        assert_eq!(btc.leverage, 5.0);
        assert!(btc.is_isolated);
        assert_eq!(btc.stop_loss, Some(2.5));
        assert_eq!(btc.take_profits.len(), 2);
        assert_eq!(btc.take_profit_miss, TakeProfitMiss::Reject);

        let eth = config.pair("ETHUSDT").unwrap();
        assert!(!eth.is_isolated);
        assert_eq!(eth.stop_loss, None);
        assert!(eth.take_profits.is_empty());
        assert_eq!(eth.take_profit_miss, TakeProfitMiss::Reenter);

        assert!(config.pair("SOLUSDT").is_none());
    }

    #[test]
    fn test_bot_config_timing_defaults() {
        let config: BotConfig = serde_yaml::from_str("pairs: {}\n").unwrap();
        assert_eq!(config.max_message_age(), chrono::Duration::seconds(90));
        assert_eq!(config.max_order_time(), chrono::Duration::seconds(60));
    }

    #[test]
    fn test_parse_tier_entries_stops_at_first_gap() {
        let csv = "botid,pair,1a,1b,2a,2b,3a,3b\n\
                   1,btcusdt,0,1,5,3,10,6\n\
                   2,ETHUSDT,1,0.5,,2,7,4\n\
                   3,SOLUSDT,,,,,,\n";
        let entries = parse_tier_entries(csv.as_bytes()).unwrap();
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].key, EntryKey::new("1", "BTCUSDT"));
        assert_eq!(
            entries[0].table.tiers(),
            &[Tier::new(0.0, 1.0), Tier::new(5.0, 3.0), Tier::new(10.0, 6.0)]
        );

        // tier 2 is missing its threshold, so tier 3 is never read
        assert_eq!(entries[1].table.tiers(), &[Tier::new(1.0, 0.5)]);
        assert!(entries[2].table.is_empty());
    }

    #[test]
    fn test_adjuster_rejects_zero_delay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sl_adjuster.yaml");
        fs::write(&path, "slow_mode_delay_secs: 0\nfast_mode_delay_secs: 5\n").unwrap();
        assert!(matches!(AdjusterConfig::load(&path), Err(ConfigError::Invalid(_))));

        fs::write(&path, "slow_mode_delay_secs: 60\nfast_mode_delay_secs: 5\n").unwrap();
        let config = AdjusterConfig::load(&path).unwrap();
        assert_eq!(config.slow_delay(), Duration::from_secs(60));
        assert_eq!(config.tiers_path, "sl_settings.csv");
    }
}
