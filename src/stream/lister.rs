//! Partition enumeration.

use std::future::Future;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::error::ReadError;

/// Lists the partitions of a stream.
#[async_trait]
pub trait PartitionLister: Send + Sync {
    /// Every partition, with pagination followed to the end.
    async fn list_partitions(&self) -> Result<Vec<String>, ReadError>;
}

/// Follows a cursor until the backend reports the end (cursor `0`).
///
/// The result is sorted and free of duplicates.
pub async fn collect_pages<F, Fut, E>(mut fetch_page: F) -> Result<Vec<String>, E>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<(u64, Vec<String>), E>>,
{
    let mut cursor = 0u64;
    let mut all = Vec::new();

    loop {
        let (next, page) = fetch_page(cursor).await?;
        all.extend(page);
        if next == 0 {
            break;
        }
        cursor = next;
    }

    all.sort();
    all.dedup();
    Ok(all)
}

/// Partitions registered in the Redis set `{stream}:partitions`.
#[derive(Clone)]
pub struct RedisPartitionLister {
    redis: ConnectionManager,
    registry_key: String,
    page_size: usize,
}

impl RedisPartitionLister {
    pub fn new(redis: ConnectionManager, stream_name: &str, page_size: usize) -> Self {
        Self {
            redis,
            registry_key: partition_registry_key(stream_name),
            page_size: page_size.max(1),
        }
    }
}

/// Key of the set that records a stream's partitions.
pub fn partition_registry_key(stream_name: &str) -> String {
    format!("{}:partitions", stream_name)
}

#[async_trait]
impl PartitionLister for RedisPartitionLister {
    async fn list_partitions(&self) -> Result<Vec<String>, ReadError> {
        let partitions = collect_pages(|cursor| {
            let mut conn = self.redis.clone();
            let key = self.registry_key.clone();
            let page_size = self.page_size;
            async move {
                redis::cmd("SSCAN")
                    .arg(&key)
                    .arg(cursor)
                    .arg("COUNT")
                    .arg(page_size)
                    .query_async::<_, (u64, Vec<String>)>(&mut conn)
                    .await
            }
        })
        .await?;

        tracing::trace!(key = %self.registry_key, count = partitions.len(), "Listed partitions");
        Ok(partitions)
    }
}

/// A fixed set of partitions.
#[derive(Debug, Clone, Default)]
pub struct StaticPartitionLister {
    partitions: Vec<String>,
}

impl StaticPartitionLister {
    pub fn new<I, S>(partitions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            partitions: partitions.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl PartitionLister for StaticPartitionLister {
    async fn list_partitions(&self) -> Result<Vec<String>, ReadError> {
        Ok(self.partitions.clone())
    }
}
