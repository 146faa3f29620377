//! Bounded reads from one partition of the log.
//!
//! A reader turns a position token into a batch of decoded jobs, the
//! position to continue from and, when records were consumed, a durable
//! marker worth keeping in the long-term checkpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::StreamRangeReply;
use tracing::warn;

use crate::error::ReadError;
use crate::scheduler::job::{decode_payload, JobPayload, JobUnit};

use super::lister::partition_registry_key;

/// Field of a stream entry that carries the JSON payload.
pub const PAYLOAD_FIELD: &str = "data";

/// Result of one partition read.
#[derive(Debug, Clone, Default)]
pub struct PartitionRead {
    /// Decoded jobs in log order. Undecodable records are already dropped.
    pub jobs: Vec<JobUnit>,
    /// Where the next read should start. `None` means the position is gone
    /// and the cached checkpoint must be cleared.
    pub next_position: Option<String>,
    /// Marker of the last record consumed, if any were.
    pub durable_marker: Option<String>,
}

impl PartitionRead {
    /// The read produced by an expired position.
    pub fn expired() -> Self {
        Self::default()
    }
}

/// Reads batches of jobs from a partition.
#[async_trait]
pub trait PartitionReader: Send + Sync {
    /// Position of the first record of any partition.
    fn start_position(&self) -> String;

    /// Position of the first record after `marker`.
    fn position_after(&self, marker: &str) -> String;

    /// Reads up to `limit` records starting at `position`.
    ///
    /// # Errors
    ///
    /// `ReadError::PositionExpired` when `position` is no longer valid.
    async fn read(
        &self,
        partition: &str,
        position: &str,
        limit: usize,
    ) -> Result<PartitionRead, ReadError>;
}

/// Decodes raw records, dropping the ones that carry no job.
fn decode_records(partition: &str, records: Vec<(String, Option<String>)>) -> Vec<JobUnit> {
    records
        .into_iter()
        .filter_map(|(id, body)| {
            let Some(body) = body else {
                warn!(partition = partition, record_id = %id, "Record has no payload field, dropping");
                return None;
            };
            match decode_payload(&body) {
                Ok(Some(payload)) => Some(JobUnit::new(id, payload)),
                Ok(None) => {
                    warn!(partition = partition, record_id = %id, "Record carries no job, dropping");
                    None
                }
                Err(e) => {
                    warn!(partition = partition, record_id = %id, error = %e, "Undecodable record, dropping");
                    None
                }
            }
        })
        .collect()
}

/// Reads partitions stored as Redis streams at `{stream}:{partition}`.
///
/// Positions are entry ids; a read starts strictly after its position, so
/// the position after a marker is the marker itself.
#[derive(Clone)]
pub struct RedisStreamReader {
    redis: ConnectionManager,
    stream_name: String,
}

impl RedisStreamReader {
    pub fn new(redis: ConnectionManager, stream_name: &str) -> Self {
        Self {
            redis,
            stream_name: stream_name.to_string(),
        }
    }

    fn partition_key(&self, partition: &str) -> String {
        format!("{}:{}", self.stream_name, partition)
    }

    /// Appends a job to a partition and registers the partition.
    ///
    /// Returns the new entry id.
    pub async fn append(&self, partition: &str, payload: &JobPayload) -> Result<String, ReadError> {
        let body = serde_json::to_string(payload)
            .map_err(|e| redis::RedisError::from((redis::ErrorKind::TypeError, "payload", e.to_string())))?;

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("XADD")
            .arg(self.partition_key(partition))
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(&body)
            .cmd("SADD")
            .arg(partition_registry_key(&self.stream_name))
            .arg(partition)
            .ignore();

        let (id,): (String,) = pipe.query_async(&mut conn).await?;
        Ok(id)
    }
}

/// Whether `position` looks like a stream entry id (`<ms>-<seq>`).
fn is_entry_id(position: &str) -> bool {
    let mut parts = position.splitn(2, '-');
    matches!(
        (parts.next(), parts.next()),
        (Some(ms), Some(seq)) if ms.parse::<u64>().is_ok() && seq.parse::<u64>().is_ok()
    )
}

#[async_trait]
impl PartitionReader for RedisStreamReader {
    fn start_position(&self) -> String {
        "0-0".to_string()
    }

    fn position_after(&self, marker: &str) -> String {
        marker.to_string()
    }

    async fn read(
        &self,
        partition: &str,
        position: &str,
        limit: usize,
    ) -> Result<PartitionRead, ReadError> {
        let expired = || ReadError::PositionExpired {
            partition: partition.to_string(),
            position: position.to_string(),
        };
        if !is_entry_id(position) {
            return Err(expired());
        }

        let mut conn = self.redis.clone();
        let reply: StreamRangeReply = match redis::cmd("XRANGE")
            .arg(self.partition_key(partition))
            .arg(format!("({}", position))
            .arg("+")
            .arg("COUNT")
            .arg(limit)
            .query_async(&mut conn)
            .await
        {
            Ok(reply) => reply,
            Err(e) if e.to_string().contains("Invalid stream ID") => return Err(expired()),
            Err(e) => return Err(e.into()),
        };

        let Some(last) = reply.ids.last().map(|entry| entry.id.clone()) else {
            return Ok(PartitionRead {
                jobs: Vec::new(),
                next_position: Some(position.to_string()),
                durable_marker: None,
            });
        };

        let records = reply
            .ids
            .into_iter()
            .map(|entry| {
                let body = entry.get::<String>(PAYLOAD_FIELD);
                (entry.id, body)
            })
            .collect();

        Ok(PartitionRead {
            jobs: decode_records(partition, records),
            next_position: Some(last.clone()),
            durable_marker: Some(last),
        })
    }
}

/// Process-local partitioned log.
///
/// Records are addressed by their index in the partition; a position is the
/// index of the next record to read. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPartitionReader {
    partitions: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

impl InMemoryPartitionReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw record and returns its index.
    pub fn push_raw(&self, partition: &str, body: impl Into<String>) -> String {
        let mut partitions = self.partitions.lock().unwrap_or_else(|e| e.into_inner());
        let records = partitions.entry(partition.to_string()).or_default();
        records.push(body.into());
        (records.len() - 1).to_string()
    }

    /// Appends a job and returns its index.
    pub fn push(&self, partition: &str, payload: &JobPayload) -> String {
        let body = serde_json::json!({ "SleepDurationSeconds": payload.sleep_duration_seconds });
        self.push_raw(partition, body.to_string())
    }
}

#[async_trait]
impl PartitionReader for InMemoryPartitionReader {
    fn start_position(&self) -> String {
        "0".to_string()
    }

    fn position_after(&self, marker: &str) -> String {
        marker
            .parse::<usize>()
            .map(|index| (index + 1).to_string())
            .unwrap_or_else(|_| marker.to_string())
    }

    async fn read(
        &self,
        partition: &str,
        position: &str,
        limit: usize,
    ) -> Result<PartitionRead, ReadError> {
        let Ok(start) = position.parse::<usize>() else {
            return Err(ReadError::PositionExpired {
                partition: partition.to_string(),
                position: position.to_string(),
            });
        };

        let records: Vec<(String, Option<String>)> = {
            let partitions = self.partitions.lock().unwrap_or_else(|e| e.into_inner());
            partitions
                .get(partition)
                .map(|records| {
                    records
                        .iter()
                        .enumerate()
                        .skip(start)
                        .take(limit)
                        .map(|(i, body)| (i.to_string(), Some(body.clone())))
                        .collect()
                })
                .unwrap_or_default()
        };

        let consumed = records.len();
        let durable_marker = records.last().map(|(id, _)| id.clone());

        Ok(PartitionRead {
            jobs: decode_records(partition, records),
            next_position: Some((start + consumed).to_string()),
            durable_marker,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_entry_id() {
        assert!(is_entry_id("0-0"));
        assert!(is_entry_id("1700000000000-12"));
        assert!(!is_entry_id("garbage"));
        assert!(!is_entry_id("12"));
        assert!(!is_entry_id("a-1"));
    }

    #[test]
    fn test_decode_records_drops_bad_entries() {
        let records = vec![
            ("1-0".to_string(), Some(r#"{"SleepDurationSeconds": 2}"#.to_string())),
            ("2-0".to_string(), Some("null".to_string())),
            ("3-0".to_string(), Some("{broken".to_string())),
            ("4-0".to_string(), None),
            ("5-0".to_string(), Some(r#"{"SleepDurationSeconds": 1}"#.to_string())),
        ];

        let jobs = decode_records("p0", records);
        let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["1-0", "5-0"]);
    }

    #[tokio::test]
    async fn test_in_memory_reader_pages_through_partition() {
        let reader = InMemoryPartitionReader::new();
        for secs in 0..5 {
            reader.push("p0", &JobPayload::sleep(secs));
        }

        let first = reader.read("p0", &reader.start_position(), 3).await.unwrap();
        assert_eq!(first.jobs.len(), 3);
        assert_eq!(first.next_position.as_deref(), Some("3"));
        assert_eq!(first.durable_marker.as_deref(), Some("2"));

        let second = reader.read("p0", "3", 3).await.unwrap();
        assert_eq!(second.jobs.len(), 2);
        assert_eq!(second.next_position.as_deref(), Some("5"));

        let empty = reader.read("p0", "5", 3).await.unwrap();
        assert!(empty.jobs.is_empty());
        assert_eq!(empty.next_position.as_deref(), Some("5"));
        assert!(empty.durable_marker.is_none());

        assert_eq!(reader.position_after("2"), "3");
    }

    #[tokio::test]
    async fn test_in_memory_reader_rejects_unknown_position() {
        let reader = InMemoryPartitionReader::new();
        let result = reader.read("p0", "not-a-position", 10).await;
        assert!(matches!(result, Err(ReadError::PositionExpired { .. })));
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server (REDIS_URL)"]
    async fn test_redis_reader_round_trip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let client = redis::Client::open(url).unwrap();
        let conn = ConnectionManager::new(client).await.unwrap();
        let stream = format!("leaseworker-test-{}", uuid::Uuid::new_v4());
        let reader = RedisStreamReader::new(conn, &stream);

        let mut ids = Vec::new();
        for secs in 1..=3 {
            ids.push(reader.append("p0", &JobPayload::sleep(secs)).await.unwrap());
        }

        let read = reader.read("p0", &reader.start_position(), 2).await.unwrap();
        assert_eq!(read.jobs.len(), 2);
        assert_eq!(read.next_position.as_deref(), Some(ids[1].as_str()));

        let rest = reader
            .read("p0", &reader.position_after(&ids[1]), 10)
            .await
            .unwrap();
        assert_eq!(rest.jobs.len(), 1);
        assert_eq!(rest.jobs[0].payload.sleep_duration_seconds, 3);

        assert!(matches!(
            reader.read("p0", "bogus", 10).await,
            Err(ReadError::PositionExpired { .. })
        ));
    }
}
