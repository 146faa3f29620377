//! Worker configuration.
//!
//! This module provides configuration for the worker: engine sizing and
//! retry limits, idle backoff bounds, the stream source (partition locks,
//! checkpoint TTLs, backing stores) and the point-queue source.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Which job source the worker pulls from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Partitioned log with distributed partition claiming.
    Stream,
    /// Point queue with per-message visibility leases.
    Queue,
}

impl FromStr for SourceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stream" => Ok(SourceKind::Stream),
            "queue" => Ok(SourceKind::Queue),
            other => Err(ConfigError::InvalidValue {
                key: "WORKER_JOB_SOURCE".to_string(),
                message: format!("expected 'stream' or 'queue', got '{}'", other),
            }),
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Stream => write!(f, "stream"),
            SourceKind::Queue => write!(f, "queue"),
        }
    }
}

/// Settings for the partitioned stream source.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Key prefix of the stream; partitions live at `{stream_name}:{partition}`.
    pub stream_name: String,
    /// Namespace for lock and checkpoint keys shared by cooperating workers.
    pub consumer_group: String,
    /// Maximum records read per partition claim.
    pub batch_size: usize,
    /// Page size used when listing partitions.
    pub list_page_size: usize,
    /// TTL of a partition lock.
    pub lock_ttl: Duration,
    /// TTL of the short-term (cached) read position.
    pub short_term_ttl: Duration,
    /// Retention of the long-term (durable) marker.
    pub long_term_ttl: Duration,
    /// SQLite database holding long-term markers.
    pub checkpoint_db: PathBuf,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream_name: "jobs".to_string(),
            consumer_group: "leaseworker".to_string(),
            batch_size: 100,
            list_page_size: 100,
            lock_ttl: Duration::from_secs(10),
            short_term_ttl: Duration::from_secs(5 * 60 - 5),
            long_term_ttl: Duration::from_secs(23 * 3600),
            checkpoint_db: PathBuf::from("leaseworker_checkpoints.db"),
        }
    }
}

/// Settings for the point-queue source.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Key prefix of the queue.
    pub queue_name: String,
    /// Maximum messages received per batch.
    pub batch_size: usize,
    /// Visibility lease granted on receive and on every heartbeat.
    pub visibility_timeout: Duration,
    /// Queue that receives payloads of failed jobs. `None` disables forwarding.
    pub dead_letter_queue: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_name: "jobs".to_string(),
            batch_size: 10,
            visibility_timeout: Duration::from_secs(30),
            dead_letter_queue: None,
        }
    }
}

/// Top-level worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    // Engine settings
    /// Number of persistent worker tasks (clamped to at least 1).
    pub worker_thread_count: usize,
    /// Local retries for retryable job errors.
    pub internal_retry_count: u32,
    /// How long the engine waits on the completion signal before re-checking.
    pub completion_poll_interval: Duration,

    // Idle backoff
    /// Lower bound of the "no jobs" backoff delay.
    pub min_idle_wait: Duration,
    /// Upper bound of the "no jobs" backoff delay.
    pub max_idle_wait: Duration,

    // Source settings
    /// Source to pull jobs from.
    pub source: SourceKind,
    /// Redis URL used for locks, short-term checkpoints, streams and queues.
    pub redis_url: String,
    pub stream: StreamConfig,
    pub queue: QueueConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_thread_count: 4,
            internal_retry_count: 2,
            completion_poll_interval: Duration::from_secs(1),

            min_idle_wait: Duration::from_secs(1),
            max_idle_wait: Duration::from_secs(30),

            source: SourceKind::Stream,
            redis_url: "redis://localhost:6379".to_string(),
            stream: StreamConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from environment variables on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Engine settings
        if let Ok(val) = std::env::var("WORKER_THREAD_COUNT") {
            config.worker_thread_count = parse_env_value(&val, "WORKER_THREAD_COUNT")?;
        }

        if let Ok(val) = std::env::var("WORKER_INTERNAL_RETRY_COUNT") {
            config.internal_retry_count = parse_env_value(&val, "WORKER_INTERNAL_RETRY_COUNT")?;
        }

        if let Ok(val) = std::env::var("WORKER_MIN_IDLE_WAIT_SECS") {
            let secs: u64 = parse_env_value(&val, "WORKER_MIN_IDLE_WAIT_SECS")?;
            config.min_idle_wait = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("WORKER_MAX_IDLE_WAIT_SECS") {
            let secs: u64 = parse_env_value(&val, "WORKER_MAX_IDLE_WAIT_SECS")?;
            config.max_idle_wait = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("WORKER_JOB_SOURCE") {
            config.source = val.parse()?;
        }

        if let Ok(val) = std::env::var("REDIS_URL") {
            config.redis_url = val;
        }

        // Stream settings
        if let Ok(val) = std::env::var("STREAM_NAME") {
            config.stream.stream_name = val;
        }

        if let Ok(val) = std::env::var("STREAM_CONSUMER_GROUP") {
            config.stream.consumer_group = val;
        }

        if let Ok(val) = std::env::var("STREAM_BATCH_SIZE") {
            config.stream.batch_size = parse_env_value(&val, "STREAM_BATCH_SIZE")?;
        }

        if let Ok(val) = std::env::var("STREAM_LIST_PAGE_SIZE") {
            config.stream.list_page_size = parse_env_value(&val, "STREAM_LIST_PAGE_SIZE")?;
        }

        if let Ok(val) = std::env::var("STREAM_LOCK_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "STREAM_LOCK_TTL_SECS")?;
            config.stream.lock_ttl = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("STREAM_SHORT_TERM_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "STREAM_SHORT_TERM_TTL_SECS")?;
            config.stream.short_term_ttl = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("STREAM_LONG_TERM_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "STREAM_LONG_TERM_TTL_SECS")?;
            config.stream.long_term_ttl = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("STREAM_CHECKPOINT_DB") {
            config.stream.checkpoint_db = PathBuf::from(val);
        }

        // Queue settings
        if let Ok(val) = std::env::var("QUEUE_NAME") {
            config.queue.queue_name = val;
        }

        if let Ok(val) = std::env::var("QUEUE_BATCH_SIZE") {
            config.queue.batch_size = parse_env_value(&val, "QUEUE_BATCH_SIZE")?;
        }

        if let Ok(val) = std::env::var("QUEUE_VISIBILITY_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "QUEUE_VISIBILITY_TIMEOUT_SECS")?;
            config.queue.visibility_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("DEAD_LETTER_QUEUE") {
            if !val.trim().is_empty() {
                config.queue.dead_letter_queue = Some(val);
            }
        }

        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_idle_wait.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "max_idle_wait must be greater than 0".to_string(),
            ));
        }

        if self.min_idle_wait > self.max_idle_wait {
            return Err(ConfigError::ValidationFailed(
                "min_idle_wait cannot exceed max_idle_wait".to_string(),
            ));
        }

        if self.completion_poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "completion_poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        match self.source {
            SourceKind::Stream => self.validate_stream(),
            SourceKind::Queue => self.validate_queue(),
        }
    }

    fn validate_stream(&self) -> Result<(), ConfigError> {
        let stream = &self.stream;

        if stream.stream_name.is_empty() || stream.consumer_group.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "stream_name and consumer_group cannot be empty".to_string(),
            ));
        }

        if stream.batch_size == 0 || stream.list_page_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "stream batch_size and list_page_size must be greater than 0".to_string(),
            ));
        }

        if stream.lock_ttl.as_millis() == 0 {
            return Err(ConfigError::ValidationFailed(
                "lock_ttl must be greater than 0".to_string(),
            ));
        }

        if stream.short_term_ttl.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "short_term_ttl must be at least one second".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_queue(&self) -> Result<(), ConfigError> {
        if self.queue.queue_name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_name cannot be empty".to_string(),
            ));
        }

        if self.queue.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "queue batch_size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Effective pool size.
    pub fn worker_count(&self) -> usize {
        self.worker_thread_count.max(1)
    }

    /// Builder method to set the worker thread count.
    pub fn with_worker_thread_count(mut self, count: usize) -> Self {
        self.worker_thread_count = count;
        self
    }

    /// Builder method to set the internal retry count.
    pub fn with_internal_retry_count(mut self, count: u32) -> Self {
        self.internal_retry_count = count;
        self
    }

    /// Builder method to set the completion poll interval.
    pub fn with_completion_poll_interval(mut self, interval: Duration) -> Self {
        self.completion_poll_interval = interval;
        self
    }

    /// Builder method to set the idle backoff bounds.
    pub fn with_idle_wait(mut self, min: Duration, max: Duration) -> Self {
        self.min_idle_wait = min;
        self.max_idle_wait = max;
        self
    }

    /// Builder method to set the job source.
    pub fn with_source(mut self, source: SourceKind) -> Self {
        self.source = source;
        self
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to replace the stream settings.
    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    /// Builder method to replace the queue settings.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }
}

/// Parse an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.worker_thread_count, 4);
        assert_eq!(config.internal_retry_count, 2);
        assert_eq!(config.min_idle_wait, Duration::from_secs(1));
        assert_eq!(config.max_idle_wait, Duration::from_secs(30));
        assert_eq!(config.source, SourceKind::Stream);
        assert_eq!(config.stream.lock_ttl, Duration::from_secs(10));
        assert_eq!(config.stream.short_term_ttl, Duration::from_secs(295));
        assert_eq!(config.stream.long_term_ttl, Duration::from_secs(82800));
        assert_eq!(config.queue.visibility_timeout, Duration::from_secs(30));
        assert!(config.queue.dead_letter_queue.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerConfig::new()
            .with_worker_thread_count(8)
            .with_internal_retry_count(5)
            .with_idle_wait(Duration::from_secs(2), Duration::from_secs(60))
            .with_source(SourceKind::Queue)
            .with_redis_url("redis://custom:6380");

        assert_eq!(config.worker_thread_count, 8);
        assert_eq!(config.internal_retry_count, 5);
        assert_eq!(config.min_idle_wait, Duration::from_secs(2));
        assert_eq!(config.max_idle_wait, Duration::from_secs(60));
        assert_eq!(config.source, SourceKind::Queue);
        assert_eq!(config.redis_url, "redis://custom:6380");
    }

    #[test]
    fn test_worker_count_is_at_least_one() {
        let config = WorkerConfig::new().with_worker_thread_count(0);
        assert_eq!(config.worker_count(), 1);
    }

    #[test]
    fn test_validation_rejects_inverted_idle_bounds() {
        let config =
            WorkerConfig::new().with_idle_wait(Duration::from_secs(60), Duration::from_secs(10));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_idle_wait"));
    }

    #[test]
    fn test_validation_rejects_zero_stream_batch() {
        let stream = StreamConfig {
            batch_size: 0,
            ..Default::default()
        };
        let config = WorkerConfig::new().with_stream(stream);
        assert!(config.validate().is_err());

        // Queue validation ignores stream settings.
        let stream = StreamConfig {
            batch_size: 0,
            ..Default::default()
        };
        let config = WorkerConfig::new()
            .with_stream(stream)
            .with_source(SourceKind::Queue);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_source_kind_parse() {
        assert_eq!("stream".parse::<SourceKind>().unwrap(), SourceKind::Stream);
        assert_eq!("QUEUE".parse::<SourceKind>().unwrap(), SourceKind::Queue);
        assert!("kafka".parse::<SourceKind>().is_err());
        assert_eq!(SourceKind::Queue.to_string(), "queue");
    }

    #[test]
    fn test_parse_env_value() {
        let value: usize = parse_env_value(" 12 ", "WORKER_THREAD_COUNT").unwrap();
        assert_eq!(value, 12);

        let err = parse_env_value::<usize>("many", "WORKER_THREAD_COUNT").unwrap_err();
        assert!(err.to_string().contains("WORKER_THREAD_COUNT"));
    }
}
