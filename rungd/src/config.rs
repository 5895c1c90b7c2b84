//! Daemon configuration.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use rust_decimal::Decimal;

use rung_engine::{default_limit_offset, AllocationSchedule, Thresholds};

use crate::error::{DaemonError, DaemonResult};

// =============================================================================
// Configuration
// =============================================================================

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Environment (test, development, production)
    pub environment: Environment,
    /// Reconciliation cycle
    pub reconcile: ReconcileConfig,
    /// Take-profit ladder
    pub ladder: LadderConfig,
    /// Price monitor
    pub monitor: MonitorConfig,
    /// Persistence
    pub store: StoreConfig,
    /// Exchange access
    pub exchange: ExchangeConfig,
    /// Push notifications
    pub notify: NotifyConfig,
    /// Emit logs as JSON lines
    pub log_json: bool,
}

/// Reconciliation cycle configuration.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Seconds between ticks
    pub interval_secs: u64,
    /// Close / fill thresholds
    pub thresholds: Thresholds,
    /// Whether TP/SL orders are managed at startup
    pub tpsl_enabled: bool,
}

/// Ladder configuration.
#[derive(Debug, Clone)]
pub struct LadderConfig {
    /// Percent of live quantity per level
    pub schedule: AllocationSchedule,
    /// Limit price offset past the target (0.001 = 0.1%)
    pub limit_offset: Decimal,
}

/// Price monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Minimum time between two triggers on one position
    pub debounce_ms: u64,
    /// Fallback cache refresh period
    pub refresh_secs: u64,
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Master position file
    pub path: PathBuf,
    /// Closed-position history file
    pub history_path: PathBuf,
    /// Optimistic write attempts before giving up
    pub max_retries: u32,
}

/// Exchange configuration.
#[derive(Clone)]
pub struct ExchangeConfig {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    /// Leverage applied before placing entries
    pub default_leverage: u32,
}

/// Push notification configuration.
#[derive(Debug, Clone, Default)]
pub struct NotifyConfig {
    pub join_api_key: Option<String>,
    pub join_device_id: Option<String>,
}

/// Environment type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Test environment (uses stubs)
    Test,
    /// Development environment
    Development,
    /// Production environment
    Production,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> DaemonResult<Self> {
        // Load .env file if present (ignore errors)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> DaemonResult<Self> {
        let vars = Vars(&lookup);
        let defaults = Self::default();

        let environment = match vars.get("RUNG_ENV") {
            Some(raw) => parse_environment(&raw)?,
            None => defaults.environment,
        };

        let schedule = match vars.get("RUNG_TP_ALLOCATION") {
            Some(raw) => AllocationSchedule::parse(&raw)?,
            None => defaults.ladder.schedule,
        };

        let thresholds = Thresholds {
            close_epsilon: vars.parse("RUNG_CLOSE_EPSILON", defaults.reconcile.thresholds.close_epsilon)?,
            min_fill_qty: vars.parse("RUNG_MIN_FILL_QTY", defaults.reconcile.thresholds.min_fill_qty)?,
            force_close_unidentified: vars.flag(
                "RUNG_FORCE_CLOSE_UNIDENTIFIED",
                defaults.reconcile.thresholds.force_close_unidentified,
            )?,
        };

        let config = Self {
            environment,
            reconcile: ReconcileConfig {
                interval_secs: vars.parse("RUNG_RECONCILE_INTERVAL_SECS", defaults.reconcile.interval_secs)?,
                thresholds,
                tpsl_enabled: vars.flag("RUNG_TPSL_ENABLED", defaults.reconcile.tpsl_enabled)?,
            },
            ladder: LadderConfig {
                schedule,
                limit_offset: vars.parse("RUNG_TP_LIMIT_OFFSET", defaults.ladder.limit_offset)?,
            },
            monitor: MonitorConfig {
                debounce_ms: vars.parse("RUNG_TRIGGER_DEBOUNCE_MS", defaults.monitor.debounce_ms)?,
                refresh_secs: vars.parse("RUNG_MONITOR_REFRESH_SECS", defaults.monitor.refresh_secs)?,
            },
            store: StoreConfig {
                path: vars.get("RUNG_STORE_PATH").map(PathBuf::from).unwrap_or(defaults.store.path),
                history_path: vars
                    .get("RUNG_HISTORY_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.store.history_path),
                max_retries: vars.parse("RUNG_STORE_MAX_RETRIES", defaults.store.max_retries)?,
            },
            exchange: ExchangeConfig {
                api_key: vars.get("BITUNIX_API_KEY"),
                api_secret: vars.get("BITUNIX_API_SECRET"),
                default_leverage: vars.parse("RUNG_DEFAULT_LEVERAGE", defaults.exchange.default_leverage)?,
            },
            notify: NotifyConfig {
                join_api_key: vars.get("JOIN_API_KEY"),
                join_device_id: vars.get("JOIN_DEVICE_ID"),
            },
            log_json: vars.flag("RUNG_LOG_JSON", false)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Create test configuration.
    pub fn test() -> Self {
        let mut config = Self::default();
        config.environment = Environment::Test;
        config.reconcile.interval_secs = 1;
        config.monitor.debounce_ms = 200;
        config.monitor.refresh_secs = 1;
        config.store.max_retries = 20;
        config
    }

    fn validate(&self) -> DaemonResult<()> {
        if self.reconcile.interval_secs == 0 {
            return Err(DaemonError::Config("RUNG_RECONCILE_INTERVAL_SECS must be positive".to_string()));
        }
        if self.monitor.refresh_secs == 0 {
            return Err(DaemonError::Config("RUNG_MONITOR_REFRESH_SECS must be positive".to_string()));
        }
        if self.store.max_retries == 0 {
            return Err(DaemonError::Config("RUNG_STORE_MAX_RETRIES must be positive".to_string()));
        }
        if self.environment != Environment::Test
            && (self.exchange.api_key.is_none() || self.exchange.api_secret.is_none())
        {
            return Err(DaemonError::Config(format!(
                "BITUNIX_API_KEY and BITUNIX_API_SECRET must be set in {} environment",
                self.environment
            )));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            reconcile: ReconcileConfig {
                interval_secs: 30,
                thresholds: Thresholds::default(),
                tpsl_enabled: true,
            },
            ladder: LadderConfig {
                schedule: AllocationSchedule::standard(),
                limit_offset: default_limit_offset(),
            },
            monitor: MonitorConfig {
                debounce_ms: 5_000,
                refresh_secs: 60,
            },
            store: StoreConfig {
                path: PathBuf::from("positions.json"),
                history_path: PathBuf::from("history.jsonl"),
                max_retries: 5,
            },
            exchange: ExchangeConfig {
                api_key: None,
                api_secret: None,
                default_leverage: 15,
            },
            notify: NotifyConfig::default(),
            log_json: false,
        }
    }
}

impl fmt::Debug for ExchangeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeConfig")
            .field("api_key", &self.api_key)
            .field("api_secret", &self.api_secret.as_ref().map(|_| "<redacted>"))
            .field("default_leverage", &self.default_leverage)
            .finish()
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Test => write!(f, "test"),
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

fn parse_environment(raw: &str) -> DaemonResult<Environment> {
    match raw.to_lowercase().as_str() {
        "test" => Ok(Environment::Test),
        "development" | "dev" => Ok(Environment::Development),
        "production" | "prod" => Ok(Environment::Production),
        other => Err(DaemonError::Config(format!(
            "Invalid RUNG_ENV: {}. Expected: test, development, production",
            other
        ))),
    }
}

/// Typed access to a key lookup. Empty values count as unset.
struct Vars<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> DaemonResult<T> {
        match self.get(key) {
            Some(val) => val
                .parse()
                .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val))),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> DaemonResult<bool> {
        match self.get(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(DaemonError::Config(format!("Invalid {} value: {}", key, v))),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
