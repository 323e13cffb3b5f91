use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;

use crate::engine::EngineConfig;
use crate::model::Ms;
use crate::notify::DEFAULT_OBSERVER_BUFFER;

pub const DEFAULT_ADMIN_PASSWORD: &str = "stationd";

/// Process configuration, read from `STATIOND_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub admin_password: String,
    pub member_password: Option<String>,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub lock_wait: Duration,
    pub past_grace_ms: Ms,
    pub granularity_ms: Option<Ms>,
    pub observer_buffer: usize,
    /// Lab-local time zone for day views and day bookings.
    pub utc_offset: FixedOffset,
}

#[derive(Debug)]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.key, self.value)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys take defaults; set but
    /// unparseable keys are an error rather than silently defaulted.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            bind: lookup("STATIOND_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&lookup, "STATIOND_PORT")?.unwrap_or(7878),
            data_dir: lookup("STATIOND_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            admin_password: lookup("STATIOND_ADMIN_PASSWORD").unwrap_or_else(|| DEFAULT_ADMIN_PASSWORD.into()),
            member_password: lookup("STATIOND_MEMBER_PASSWORD"),
            max_connections: parsed(&lookup, "STATIOND_MAX_CONNECTIONS")?.unwrap_or(256),
            metrics_port: parsed(&lookup, "STATIOND_METRICS_PORT")?,
            compact_threshold: parsed(&lookup, "STATIOND_COMPACT_THRESHOLD")?.unwrap_or(1000),
            sweep_interval: Duration::from_millis(
                parsed(&lookup, "STATIOND_SWEEP_INTERVAL_MS")?.unwrap_or(5_000),
            ),
            lock_wait: Duration::from_millis(parsed(&lookup, "STATIOND_LOCK_WAIT_MS")?.unwrap_or(500)),
            past_grace_ms: parsed(&lookup, "STATIOND_PAST_GRACE_MS")?.unwrap_or(5 * 60_000),
            granularity_ms: parsed::<Ms>(&lookup, "STATIOND_GRANULARITY_MS")?.filter(|g| *g > 0),
            observer_buffer: parsed(&lookup, "STATIOND_OBSERVER_BUFFER")?.unwrap_or(DEFAULT_OBSERVER_BUFFER),
            utc_offset: utc_offset(&lookup)?,
        })
    }

    /// True when no admin password was configured and the built-in one is
    /// in force.
    pub fn uses_default_admin_password(&self) -> bool {
        self.admin_password == DEFAULT_ADMIN_PASSWORD
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            lock_wait: self.lock_wait,
            past_grace_ms: self.past_grace_ms,
            granularity_ms: self.granularity_ms,
            utc_offset: self.utc_offset,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("stationd.wal")
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => match value.trim().parse() {
            Ok(v) => Ok(Some(v)),
            Err(_) => Err(ConfigError { key, value }),
        },
    }
}

fn utc_offset(lookup: &impl Fn(&str) -> Option<String>) -> Result<FixedOffset, ConfigError> {
    const KEY: &str = "STATIOND_UTC_OFFSET_MINUTES";
    let minutes: i32 = parsed(lookup, KEY)?.unwrap_or(0);
    minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| ConfigError {
            key: KEY,
            value: minutes.to_string(),
        })
}
