//! Configuration management for the data store.

use std::env;
use std::time::Duration;

/// Tunables consumed by the data store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataStoreConfig {
    /// How often a full sync runs
    pub sync_interval: Duration,
    /// Maximum records fetched per model in one sync
    pub sync_max_records: u32,
    /// Page size used while syncing
    pub sync_page_size: u32,
    /// Changes collected before an observed query emits a snapshot
    pub observe_query_max_records: u32,
    /// Longest an observed query waits before emitting collected changes
    pub observe_query_max_time: Duration,
    /// Attempts per outbox entry before it is reported as failed
    pub outbox_max_attempts: u32,
    /// First retry delay; doubled per attempt
    pub outbox_retry_base_delay: Duration,
    /// Upper bound for a retry delay
    pub outbox_retry_max_delay: Duration,
    /// Concurrent operations on the worker pool
    pub worker_pool_size: usize,
    /// Deadline for a single facade operation
    pub operation_timeout: Duration,
    /// SQLite connection URL; in-memory storage when absent
    pub database_url: Option<String>,
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(24 * 60 * 60),
            sync_max_records: 1000,
            sync_page_size: 1000,
            observe_query_max_records: 1000,
            observe_query_max_time: Duration::from_secs(2),
            outbox_max_attempts: 5,
            outbox_retry_base_delay: Duration::from_millis(100),
            outbox_retry_max_delay: Duration::from_secs(10),
            worker_pool_size: 4,
            operation_timeout: Duration::from_secs(30),
            database_url: None,
        }
    }
}

impl DataStoreConfig {
    pub fn builder() -> Self {
        Self::default()
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_sync_max_records(mut self, max: u32) -> Self {
        self.sync_max_records = max;
        self
    }

    pub fn with_sync_page_size(mut self, size: u32) -> Self {
        self.sync_page_size = size;
        self
    }

    pub fn with_observe_query_max_records(mut self, max: u32) -> Self {
        self.observe_query_max_records = max;
        self
    }

    pub fn with_observe_query_max_time(mut self, time: Duration) -> Self {
        self.observe_query_max_time = time;
        self
    }

    pub fn with_outbox_max_attempts(mut self, attempts: u32) -> Self {
        self.outbox_max_attempts = attempts;
        self
    }

    pub fn with_outbox_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.outbox_retry_base_delay = base;
        self.outbox_retry_max_delay = max;
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }

    /// Every count and duration must be strictly positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("syncInterval", self.sync_interval),
            ("observeQueryMaxTime", self.observe_query_max_time),
            ("outboxRetryBaseDelay", self.outbox_retry_base_delay),
            ("outboxRetryMaxDelay", self.outbox_retry_max_delay),
            ("operationTimeout", self.operation_timeout),
        ];
        for (key, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::NonPositive(key));
            }
        }
        let counts = [
            ("syncMaxRecords", self.sync_max_records as usize),
            ("syncPageSize", self.sync_page_size as usize),
            ("observeQueryMaxRecords", self.observe_query_max_records as usize),
            ("outboxMaxAttempts", self.outbox_max_attempts as usize),
            ("workerPoolSize", self.worker_pool_size),
        ];
        for (key, value) in counts {
            if value == 0 {
                return Err(ConfigError::NonPositive(key));
            }
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.outbox_retry_base_delay
            .saturating_mul(factor)
            .min(self.outbox_retry_max_delay)
    }

    /// Load configuration from environment variables, reading `.env` first.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup, starting from the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
            raw.trim().parse().map_err(|_| ConfigError::Invalid { key })
        }

        let mut config = Self::default();
        if let Some(raw) = lookup("HARBOR_SYNC_INTERVAL_MS") {
            config.sync_interval = Duration::from_millis(parse("HARBOR_SYNC_INTERVAL_MS", &raw)?);
        }
        if let Some(raw) = lookup("HARBOR_SYNC_MAX_RECORDS") {
            config.sync_max_records = parse("HARBOR_SYNC_MAX_RECORDS", &raw)?;
        }
        if let Some(raw) = lookup("HARBOR_SYNC_PAGE_SIZE") {
            config.sync_page_size = parse("HARBOR_SYNC_PAGE_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("HARBOR_OBSERVE_QUERY_MAX_RECORDS") {
            config.observe_query_max_records = parse("HARBOR_OBSERVE_QUERY_MAX_RECORDS", &raw)?;
        }
        if let Some(raw) = lookup("HARBOR_OBSERVE_QUERY_MAX_TIME_MS") {
            config.observe_query_max_time =
                Duration::from_millis(parse("HARBOR_OBSERVE_QUERY_MAX_TIME_MS", &raw)?);
        }
        if let Some(raw) = lookup("HARBOR_OUTBOX_MAX_ATTEMPTS") {
            config.outbox_max_attempts = parse("HARBOR_OUTBOX_MAX_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = lookup("HARBOR_WORKER_POOL_SIZE") {
            config.worker_pool_size = parse("HARBOR_WORKER_POOL_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("HARBOR_OPERATION_TIMEOUT_MS") {
            config.operation_timeout =
                Duration::from_millis(parse("HARBOR_OPERATION_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = lookup("HARBOR_DATABASE_URL") {
            config.database_url = Some(raw);
        }
        config.build()
    }

    /// Read the plugin configuration object.
    ///
    /// Durations are given in seconds. Unknown keys are rejected.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, ConfigError> {
        let obj = value.as_object().ok_or(ConfigError::Invalid { key: "<root>" })?;
        let mut config = Self::default();
        for (key, raw) in obj {
            match key.as_str() {
                "syncInterval" => {
                    config.sync_interval = Duration::from_secs(json_u64("syncInterval", raw)?)
                }
                "syncMaxRecords" => config.sync_max_records = json_u32("syncMaxRecords", raw)?,
                "syncPageSize" => config.sync_page_size = json_u32("syncPageSize", raw)?,
                "observeQueryMaxRecords" => {
                    config.observe_query_max_records = json_u32("observeQueryMaxRecords", raw)?
                }
                "observeQueryMaxTime" => {
                    config.observe_query_max_time =
                        Duration::from_secs(json_u64("observeQueryMaxTime", raw)?)
                }
                other => return Err(ConfigError::UnknownKey(other.to_string())),
            }
        }
        config.build()
    }
}

fn json_u64(key: &'static str, raw: &serde_json::Value) -> Result<u64, ConfigError> {
    raw.as_u64().ok_or(ConfigError::Invalid { key })
}

fn json_u32(key: &'static str, raw: &serde_json::Value) -> Result<u32, ConfigError> {
    json_u64(key, raw)?
        .try_into()
        .map_err(|_| ConfigError::Invalid { key })
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be positive")]
    NonPositive(&'static str),

    #[error("Invalid value for {key}")]
    Invalid { key: &'static str },

    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),
}
