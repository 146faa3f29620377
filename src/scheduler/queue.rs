//! Redis-based point queue with visibility leases.
//!
//! This module provides a job source backed by Redis that supports:
//!
//! - Atomic receive of up to N messages with a visibility deadline
//! - Lease extension while a message is being processed
//! - Deletion only on success; failed or abandoned messages reappear
//!
//! # Queue Structure
//!
//! - `{queue_name}`: list of ready message ids
//! - `{queue_name}:messages`: hash of message id to JSON body
//! - `{queue_name}:inflight`: sorted set of received ids scored by their
//!   visibility deadline in unix milliseconds
//!
//! # Reliability
//!
//! Every receive first moves in-flight messages whose deadline has passed
//! back to the ready list, so a crashed worker only delays its messages by
//! one visibility timeout.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::SourceError;

use super::job::{
    decode_payload, sort_longest_first, JobPayload, JobSource, JobSourceResponse, JobUnit,
};

/// Lower bound for the visibility lease granted on receive.
pub const MIN_RECEIVE_VISIBILITY: Duration = Duration::from_secs(20);

/// Lower bound for the extension granted by a heartbeat.
pub const MIN_HEARTBEAT_EXTENSION: Duration = Duration::from_secs(1);

const REQUEUE_EXPIRED_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(ids) do
    redis.call('ZREM', KEYS[1], id)
    redis.call('RPUSH', KEYS[2], id)
end
return #ids
"#;

const RECEIVE_SCRIPT: &str = r#"
local out = {}
for i = 1, tonumber(ARGV[1]) do
    local id = redis.call('RPOP', KEYS[1])
    if not id then
        break
    end
    local body = redis.call('HGET', KEYS[3], id)
    if body then
        redis.call('ZADD', KEYS[2], ARGV[2], id)
        table.insert(out, id)
        table.insert(out, body)
    end
end
return out
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[2]) then
    redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
    return 1
end
return 0
"#;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize message data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The message is no longer leased to this consumer.
    #[error("Message {0} is not in flight")]
    MessageNotInFlight(String),
}

/// A message handed out by `receive`.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub id: String,
    pub body: String,
}

/// Redis-backed point queue implementing the job source contract.
pub struct QueueJobSource {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Name of the ready list.
    queue_name: String,
    /// Key of the message body hash.
    messages_key: String,
    /// Key of the in-flight sorted set.
    inflight_key: String,
    batch_size: usize,
    visibility_timeout: Duration,
}

impl QueueJobSource {
    /// Connects to Redis and creates a queue source.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, config: &QueueConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, config))
    }

    /// Creates a queue source from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, config: &QueueConfig) -> Self {
        Self {
            redis,
            queue_name: config.queue_name.clone(),
            messages_key: format!("{}:messages", config.queue_name),
            inflight_key: format!("{}:inflight", config.queue_name),
            batch_size: config.batch_size,
            visibility_timeout: config.visibility_timeout,
        }
    }

    /// Adds a message to the queue and returns its id.
    pub async fn enqueue(&self, payload: &JobPayload) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        let body = serde_json::to_string(payload)?;

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&self.messages_key, &id, &body)
            .lpush(&self.queue_name, &id);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(id)
    }

    /// Moves in-flight messages whose lease has expired back to the ready list.
    ///
    /// Returns the number of messages made visible again.
    pub async fn requeue_expired(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let moved: usize = redis::Script::new(REQUEUE_EXPIRED_SCRIPT)
            .key(&self.inflight_key)
            .key(&self.queue_name)
            .arg(now_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    /// Receives up to `max` messages, hiding them for `visibility`.
    pub async fn receive(
        &self,
        max: usize,
        visibility: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let requeued = self.requeue_expired().await?;
        if requeued > 0 {
            debug!(queue = %self.queue_name, requeued = requeued, "Expired messages visible again");
        }

        let mut conn = self.redis.clone();
        let deadline = now_millis() + visibility.as_millis() as i64;
        let flat: Vec<String> = redis::Script::new(RECEIVE_SCRIPT)
            .key(&self.queue_name)
            .key(&self.inflight_key)
            .key(&self.messages_key)
            .arg(max)
            .arg(deadline)
            .invoke_async(&mut conn)
            .await?;

        Ok(flat
            .chunks_exact(2)
            .map(|pair| ReceivedMessage {
                id: pair[0].clone(),
                body: pair[1].clone(),
            })
            .collect())
    }

    /// Pushes the visibility deadline of an in-flight message forward.
    pub async fn extend_visibility(&self, id: &str, timeout: Duration) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let deadline = now_millis() + timeout.as_millis() as i64;
        let extended: i64 = redis::Script::new(EXTEND_SCRIPT)
            .key(&self.inflight_key)
            .arg(deadline)
            .arg(id)
            .invoke_async(&mut conn)
            .await?;

        if extended == 0 {
            return Err(QueueError::MessageNotInFlight(id.to_string()));
        }
        Ok(())
    }

    /// Removes a message for good.
    pub async fn delete(&self, id: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrem(&self.inflight_key, id)
            .hdel(&self.messages_key, id);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Returns queue statistics.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();
        let pending: usize = conn.llen(&self.queue_name).await?;
        let in_flight: usize = conn.zcard(&self.inflight_key).await?;

        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            pending_messages: pending,
            in_flight_messages: in_flight,
        })
    }

    /// Returns the queue name.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    fn to_job(&self, message: &ReceivedMessage) -> Option<JobUnit> {
        match decode_payload(&message.body) {
            Ok(Some(payload)) => Some(JobUnit::new(message.id.clone(), payload)),
            Ok(None) => {
                warn!(queue = %self.queue_name, message_id = %message.id, "Message carries no job, dropping");
                None
            }
            Err(e) => {
                warn!(queue = %self.queue_name, message_id = %message.id, error = %e, "Undecodable message, dropping");
                None
            }
        }
    }
}

#[async_trait]
impl JobSource for QueueJobSource {
    async fn get_jobs(&self, _cancel: &CancellationToken) -> Result<JobSourceResponse, SourceError> {
        let visibility = receive_visibility(self.visibility_timeout);
        let messages = self.receive(self.batch_size, visibility).await?;

        let mut jobs = Vec::with_capacity(messages.len());
        for message in &messages {
            match self.to_job(message) {
                Some(job) => jobs.push(job),
                None => self.delete(&message.id).await?,
            }
        }

        if jobs.is_empty() {
            return Ok(JobSourceResponse::empty());
        }

        sort_longest_first(&mut jobs);
        debug!(queue = %self.queue_name, count = jobs.len(), "Received jobs");

        Ok(JobSourceResponse::new(
            jobs,
            recommended_heartbeat_seconds(visibility),
        ))
    }

    async fn heartbeat(&self, job: &JobUnit, _cancel: &CancellationToken) -> Result<(), SourceError> {
        let extension = self.visibility_timeout.max(MIN_HEARTBEAT_EXTENSION);
        self.extend_visibility(&job.id, extension).await?;
        Ok(())
    }

    async fn acknowledge_completion(
        &self,
        job: &JobUnit,
        success: bool,
        _cancel: &CancellationToken,
    ) -> Result<(), SourceError> {
        // Failed messages stay in flight and reappear after the lease expires.
        if success {
            self.delete(&job.id).await?;
        }
        Ok(())
    }
}

/// Lease granted on receive: the configured timeout, floored.
pub fn receive_visibility(configured: Duration) -> Duration {
    configured.max(MIN_RECEIVE_VISIBILITY)
}

/// Renew leases at three quarters of the visibility window.
pub fn recommended_heartbeat_seconds(visibility: Duration) -> u64 {
    (visibility.as_secs() * 3).div_ceil(4)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Statistics about queue state.
#[derive(Debug, Clone)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue_name: String,
    /// Number of messages waiting to be received.
    pub pending_messages: usize,
    /// Number of messages currently leased to a consumer.
    pub in_flight_messages: usize,
}

impl QueueStats {
    /// Returns the total number of messages in the queue.
    pub fn total_messages(&self) -> usize {
        self.pending_messages + self.in_flight_messages
    }
}
