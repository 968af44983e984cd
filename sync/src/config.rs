//! `maple-sync.toml` loading.
//!
//! The file is deserialized into [`SyncConfigToml`], where everything is
//! optional, then resolved into [`SyncConfig`] with the defaults below.

use chrono::DateTime;
use chrono::Utc;
use dirs::home_dir;
use maple_client::DEFAULT_BASE_URL;
use maple_client::MAX_PENALTY;
use maple_state::BackfillScope;
use maple_state::DEFAULT_BUSY_TIMEOUT;
use maple_state::DEFAULT_EVICTION_THRESHOLD;
use serde::Deserialize;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_TOML_FILE: &str = "maple-sync.toml";
pub const MAPLE_SYNC_HOME_ENV: &str = "MAPLE_SYNC_HOME";

pub const DEFAULT_WORLD: &str = "挑戰者";
pub const DEFAULT_API_KEY_ENV: &str = "MAPLE_API_KEY";
pub const DEFAULT_API_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_RATE_LIMIT_REQUESTS: u32 = 10;
pub const DEFAULT_RATE_LIMIT_PER_MS: u64 = 1_000;
pub const DEFAULT_RATE_LIMIT_PENALTY_MS: u64 = 10_000;
pub const DEFAULT_RATE_LIMIT_MAX_RETRY_AFTER_MS: u64 = 600_000;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_MIN_REFRESH_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_BOOTSTRAP_LIMIT: usize = 500;
pub const DEFAULT_STAT_MIN_LEVEL: i64 = 270;
pub const DEFAULT_BACKFILL_SWEEP: &str = "full";
pub const DEFAULT_BACKFILL_BATCH_SIZE: usize = 100;
pub const DEFAULT_BACKFILL_STORE_RETRY_MS: u64 = 1_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("environment variable `{var}` with the API key is not set")]
    MissingApiKey { var: String },
    #[error("could not find home directory")]
    NoHome,
}

/// On-disk shape of `maple-sync.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SyncConfigToml {
    pub home: Option<PathBuf>,
    pub world: Option<String>,
    pub eviction_threshold: Option<u32>,
    /// How long a write waits on a lock held by another connection.
    pub busy_timeout_ms: Option<u64>,
    #[serde(default)]
    pub api: ApiToml,
    #[serde(default)]
    pub rate_limit: RateLimitToml,
    #[serde(default)]
    pub scheduler: SchedulerToml,
    #[serde(default)]
    pub backfill: BackfillToml,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ApiToml {
    pub base_url: Option<String>,
    pub key_env: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RateLimitToml {
    pub requests: Option<u32>,
    pub per_ms: Option<u64>,
    pub penalty_ms: Option<u64>,
    pub max_retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SchedulerToml {
    pub poll_interval_secs: Option<u64>,
    pub min_refresh_interval_secs: Option<u64>,
    pub workers: Option<usize>,
    pub max_per_cycle: Option<usize>,
    pub bootstrap_limit: Option<usize>,
    pub stat_min_level: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BackfillToml {
    pub sweep: Option<String>,
    pub batch_size: Option<usize>,
    pub from_entity: Option<String>,
    pub to_entity: Option<String>,
    /// RFC 3339 timestamp.
    pub seen_before: Option<String>,
    pub only_incomplete: Option<bool>,
    pub store_retry_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub base_url: String,
    pub key_env: String,
    pub timeout: Duration,
    pub stat_min_level: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub requests: u32,
    pub per: Duration,
    pub penalty: Duration,
    pub max_retry_after: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub world: String,
    pub poll_interval: Duration,
    pub min_refresh_interval: Duration,
    pub workers: usize,
    /// `None` refreshes every due entity each cycle.
    pub max_per_cycle: Option<usize>,
    pub bootstrap_limit: usize,
    pub eviction_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillConfig {
    pub sweep: String,
    pub batch_size: usize,
    pub workers: usize,
    pub eviction_threshold: u32,
    pub scope: BackfillScope,
    /// First wait before retrying a batch the store refused; doubles per try.
    pub store_retry: Duration,
}

/// Resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub home: PathBuf,
    pub busy_timeout: Duration,
    pub api: ApiConfig,
    pub rate_limit: RateLimitConfig,
    pub scheduler: SchedulerConfig,
    pub backfill: BackfillConfig,
}

impl SyncConfig {
    /// Load `path`, or `<home>/maple-sync.toml` when it exists, or defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (find_maple_home()?.join(CONFIG_TOML_FILE), false),
        };
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if !required && err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        let toml = toml::from_str::<SyncConfigToml>(&contents)
            .map_err(|source| ConfigError::Parse { path, source })?;
        toml.resolve()
    }

    /// API key from the environment variable named by `api.key_env`.
    pub fn api_key(&self) -> Result<String, ConfigError> {
        std::env::var(&self.api.key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingApiKey {
                var: self.api.key_env.clone(),
            })
    }
}

impl SyncConfigToml {
    pub fn resolve(self) -> Result<SyncConfig, ConfigError> {
        let home = match self.home {
            Some(home) => home,
            None => find_maple_home()?,
        };
        let world = self.world.unwrap_or_else(|| DEFAULT_WORLD.to_string());
        if world.trim().is_empty() {
            return Err(invalid("world", "must not be empty"));
        }
        let eviction_threshold = self.eviction_threshold.unwrap_or(DEFAULT_EVICTION_THRESHOLD);
        if eviction_threshold == 0 {
            return Err(invalid("eviction_threshold", "must be at least 1"));
        }

        let api = ApiConfig {
            base_url: self
                .api
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            key_env: self
                .api
                .key_env
                .unwrap_or_else(|| DEFAULT_API_KEY_ENV.to_string()),
            timeout: Duration::from_millis(self.api.timeout_ms.unwrap_or(DEFAULT_API_TIMEOUT_MS)),
            stat_min_level: self
                .scheduler
                .stat_min_level
                .unwrap_or(DEFAULT_STAT_MIN_LEVEL),
        };
        if api.timeout.is_zero() {
            return Err(invalid("api.timeout_ms", "must be positive"));
        }

        let rate_limit = RateLimitConfig {
            requests: self
                .rate_limit
                .requests
                .unwrap_or(DEFAULT_RATE_LIMIT_REQUESTS),
            per: Duration::from_millis(self.rate_limit.per_ms.unwrap_or(DEFAULT_RATE_LIMIT_PER_MS)),
            penalty: Duration::from_millis(
                self.rate_limit
                    .penalty_ms
                    .unwrap_or(DEFAULT_RATE_LIMIT_PENALTY_MS),
            ),
            max_retry_after: Duration::from_millis(
                self.rate_limit
                    .max_retry_after_ms
                    .unwrap_or(DEFAULT_RATE_LIMIT_MAX_RETRY_AFTER_MS),
            ),
        };
        if rate_limit.requests == 0 {
            return Err(invalid("rate_limit.requests", "must be at least 1"));
        }
        if rate_limit.per.is_zero() {
            return Err(invalid("rate_limit.per_ms", "must be positive"));
        }
        if rate_limit.max_retry_after > MAX_PENALTY {
            return Err(invalid(
                "rate_limit.max_retry_after_ms",
                format!("must be at most {} ms", MAX_PENALTY.as_millis()),
            ));
        }

        let workers = self.scheduler.workers.unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(invalid("scheduler.workers", "must be at least 1"));
        }
        let scheduler = SchedulerConfig {
            world,
            poll_interval: Duration::from_secs(
                self.scheduler
                    .poll_interval_secs
                    .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            ),
            min_refresh_interval: Duration::from_secs(
                self.scheduler
                    .min_refresh_interval_secs
                    .unwrap_or(DEFAULT_MIN_REFRESH_INTERVAL_SECS),
            ),
            workers,
            max_per_cycle: self.scheduler.max_per_cycle,
            bootstrap_limit: self
                .scheduler
                .bootstrap_limit
                .unwrap_or(DEFAULT_BOOTSTRAP_LIMIT),
            eviction_threshold,
        };
        if scheduler.max_per_cycle == Some(0) {
            return Err(invalid("scheduler.max_per_cycle", "must be at least 1"));
        }

        let seen_before = self
            .backfill
            .seen_before
            .as_deref()
            .map(parse_seen_before)
            .transpose()?;
        let backfill = BackfillConfig {
            sweep: self
                .backfill
                .sweep
                .unwrap_or_else(|| DEFAULT_BACKFILL_SWEEP.to_string()),
            batch_size: self
                .backfill
                .batch_size
                .unwrap_or(DEFAULT_BACKFILL_BATCH_SIZE),
            workers,
            eviction_threshold,
            scope: BackfillScope {
                from_entity: self.backfill.from_entity,
                to_entity: self.backfill.to_entity,
                seen_before,
                only_incomplete: self.backfill.only_incomplete.unwrap_or(false),
            },
            store_retry: Duration::from_millis(
                self.backfill
                    .store_retry_ms
                    .unwrap_or(DEFAULT_BACKFILL_STORE_RETRY_MS),
            ),
        };
        if backfill.store_retry.is_zero() {
            return Err(invalid("backfill.store_retry_ms", "must be positive"));
        }
        if backfill.batch_size == 0 {
            return Err(invalid("backfill.batch_size", "must be at least 1"));
        }
        if backfill.sweep.trim().is_empty() {
            return Err(invalid("backfill.sweep", "must not be empty"));
        }

        let busy_timeout = self
            .busy_timeout_ms
            .map_or(DEFAULT_BUSY_TIMEOUT, Duration::from_millis);

        Ok(SyncConfig {
            home,
            busy_timeout,
            api,
            rate_limit,
            scheduler,
            backfill,
        })
    }
}

/// Parse an RFC 3339 `seen_before` bound.
pub fn parse_seen_before(value: &str) -> Result<DateTime<Utc>, ConfigError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| invalid("backfill.seen_before", err.to_string()))
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// `$MAPLE_SYNC_HOME` when set, otherwise `~/.maple-sync`.
pub fn find_maple_home() -> Result<PathBuf, ConfigError> {
    if let Some(home) = std::env::var_os(MAPLE_SYNC_HOME_ENV).filter(|val| !val.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    let mut home = home_dir().ok_or(ConfigError::NoHome)?;
    home.push(".maple-sync");
    Ok(home)
}
