//! Service configuration from `RENTLEDGER_*` environment variables.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::flush::FlushConfig;
use crate::retry::RetryPolicy;

const PREFIX: &str = "RENTLEDGER_";

/// Which `RecordStore` backend holds the booking table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Csv,
    Snapshot,
}

impl StoreKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            StoreKind::Csv => "bookings.csv",
            StoreKind::Snapshot => "bookings.snap",
        }
    }
}

impl FromStr for StoreKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(StoreKind::Csv),
            "snapshot" | "snap" => Ok(StoreKind::Snapshot),
            _ => Err(()),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub store: StoreKind,
    pub items_file: PathBuf,
    pub flush_interval: Duration,
    pub flush_batch_size: u64,
    pub flush_retries: usize,
    pub flush_retry_delay_ms: u64,
    pub max_connections: usize,
    pub command_timeout: Duration,
    /// Requesters allowed to cancel other people's bookings.
    pub admins: Vec<String>,
    /// Shared secret the chat front-end presents with `auth`. `None` disables auth.
    pub chat_token: Option<String>,
    pub metrics_port: Option<u16>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind", &self.bind)
            .field("port", &self.port)
            .field("data_dir", &self.data_dir)
            .field("store", &self.store)
            .field("items_file", &self.items_file)
            .field("flush_interval", &self.flush_interval)
            .field("flush_batch_size", &self.flush_batch_size)
            .field("flush_retries", &self.flush_retries)
            .field("flush_retry_delay_ms", &self.flush_retry_delay_ms)
            .field("max_connections", &self.max_connections)
            .field("command_timeout", &self.command_timeout)
            .field("admins", &self.admins)
            .field("chat_token", &self.chat_token.as_ref().map(|_| "<redacted>"))
            .field("metrics_port", &self.metrics_port)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { var: String, value: String },
    Zero(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid value for {var}: {value:?}"),
            ConfigError::Zero(var) => write!(f, "{var} must be greater than zero"),
        }
    }
}

impl std::error::Error for ConfigError {}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    /// Trimmed value; unset and blank are the same.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(&format!("{PREFIX}{key}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.get(key)
            .map(|raw| {
                raw.parse().map_err(|_| ConfigError::Invalid {
                    var: format!("{PREFIX}{key}"),
                    value: raw,
                })
            })
            .transpose()
    }

    fn or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        Ok(self.parsed(key)?.unwrap_or(default))
    }

    fn positive<T: FromStr + Default + PartialEq>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        let value = self.or(key, default)?;
        if value == T::default() {
            return Err(ConfigError::Zero(format!("{PREFIX}{key}")));
        }
        Ok(value)
    }
}

impl Config {
    /// Read the process environment. Call `dotenvy::dotenv()` first to pick up a `.env`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Keys are given without the `RENTLEDGER_` prefix.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(lookup);
        let data_dir = PathBuf::from(vars.or("DATA_DIR", "./data".to_string())?);
        let items_file = vars
            .get("ITEMS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("items.csv"));

        Ok(Self {
            bind: vars.or("BIND", "0.0.0.0".to_string())?,
            port: vars.or("PORT", 7878)?,
            store: vars.or("STORE", StoreKind::Csv)?,
            items_file,
            data_dir,
            flush_interval: Duration::from_secs(vars.positive("FLUSH_INTERVAL_SECONDS", 10)?),
            flush_batch_size: vars.positive("FLUSH_BATCH_SIZE", 50)?,
            flush_retries: vars.positive("FLUSH_RETRIES", 3)?,
            flush_retry_delay_ms: vars.or("FLUSH_RETRY_DELAY_MS", 500)?,
            max_connections: vars.positive("MAX_CONNECTIONS", 256)?,
            command_timeout: Duration::from_millis(vars.positive("COMMAND_TIMEOUT_MS", 5000)?),
            admins: vars
                .get("ADMINS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|a| !a.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            chat_token: vars.get("CHAT_TOKEN"),
            metrics_port: vars.parsed("METRICS_PORT")?,
        })
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(self.store.file_name())
    }

    pub fn flush_config(&self) -> FlushConfig {
        FlushConfig {
            interval: self.flush_interval,
            batch_size: self.flush_batch_size,
            retry: RetryPolicy::new(
                self.flush_retries,
                self.flush_retry_delay_ms,
                self.flush_retry_delay_ms.saturating_mul(16),
            ),
        }
    }
}
