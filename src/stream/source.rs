//! Job source that claims partitions of a sharded log.
//!
//! Each call to `get_jobs` scans the partitions, claims the first one whose
//! lock is free and that has something to read, and keeps the lock until
//! every job drawn from it has been acknowledged. Checkpoints are advanced
//! when the batch is drawn, so an instance that takes over after a lost
//! lease resumes from the cached position.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::error::{LockError, ReadError, SourceError};
use crate::metrics::{ClaimOutcome, MetricsCollector};
use crate::scheduler::job::{sort_longest_first, JobSource, JobSourceResponse, JobUnit};

use super::checkpoint::CheckpointStore;
use super::keys::KeyHelper;
use super::lister::PartitionLister;
use super::lock::{DistributedLock, LockProvider, ReleaseOutcome};
use super::reader::{PartitionRead, PartitionReader};

/// The partition whose batch is still being processed.
struct HeldPartition {
    partition: String,
    lock: Box<dyn DistributedLock>,
    drawn: usize,
    acknowledged: usize,
}

/// Partition-claiming job source.
pub struct StreamJobSource {
    lister: Arc<dyn PartitionLister>,
    reader: Arc<dyn PartitionReader>,
    locks: Arc<dyn LockProvider>,
    checkpoints: CheckpointStore,
    keys: KeyHelper,
    lock_ttl: Duration,
    batch_size: usize,
    held: Mutex<Option<HeldPartition>>,
    metrics: MetricsCollector,
}

impl StreamJobSource {
    pub fn new(
        lister: Arc<dyn PartitionLister>,
        reader: Arc<dyn PartitionReader>,
        locks: Arc<dyn LockProvider>,
        checkpoints: CheckpointStore,
        config: &StreamConfig,
    ) -> Self {
        Self {
            lister,
            reader,
            locks,
            checkpoints,
            keys: KeyHelper::new(config.consumer_group.clone()),
            lock_ttl: config.lock_ttl,
            batch_size: config.batch_size.max(1),
            held: Mutex::new(None),
            metrics: MetricsCollector::new(),
        }
    }

    /// Partition currently held for an unacknowledged batch.
    pub async fn held_partition(&self) -> Option<String> {
        self.held.lock().await.as_ref().map(|h| h.partition.clone())
    }

    /// Resolves the read position, reads one batch and advances checkpoints.
    async fn draw(&self, partition: &str) -> Result<Vec<JobUnit>, SourceError> {
        let key = self.keys.checkpoint_key(partition);
        let position = self.checkpoints.resolve(&key, self.reader.as_ref()).await?;

        let read = match self.reader.read(partition, &position, self.batch_size).await {
            Ok(read) => read,
            Err(ReadError::PositionExpired { .. }) => {
                warn!(
                    partition = partition,
                    position = %position,
                    "Read position expired, falling back to the durable checkpoint"
                );
                PartitionRead::expired()
            }
            Err(e) => return Err(e.into()),
        };

        self.checkpoints
            .update(
                &key,
                read.next_position.as_deref(),
                read.durable_marker.as_deref(),
            )
            .await?;

        let mut jobs = read.jobs;
        sort_longest_first(&mut jobs);
        Ok(jobs)
    }

    async fn release(
        &self,
        partition: &str,
        lock: &mut dyn DistributedLock,
    ) -> Result<(), LockError> {
        match lock.release().await? {
            ReleaseOutcome::Released => {
                debug!(partition = partition, "Released partition lock");
            }
            ReleaseOutcome::Lost => {
                warn!(
                    partition = partition,
                    lock = lock.name(),
                    "Partition lock expired before release; the batch may be processed again"
                );
                self.metrics.record_lease_lost();
            }
            ReleaseOutcome::NotHeld => {}
        }
        Ok(())
    }

    /// Releases a lock on an error path. Failures are only logged.
    async fn release_quietly(&self, partition: &str, lock: &mut dyn DistributedLock) {
        if let Err(e) = self.release(partition, lock).await {
            warn!(partition = partition, error = %e, "Failed to release partition lock");
        }
    }
}

#[async_trait]
impl JobSource for StreamJobSource {
    async fn get_jobs(&self, cancel: &CancellationToken) -> Result<JobSourceResponse, SourceError> {
        let mut held = self.held.lock().await;
        if let Some(h) = held.as_ref() {
            return Err(SourceError::BatchOutstanding {
                partition: h.partition.clone(),
                drawn: h.drawn,
                acknowledged: h.acknowledged,
            });
        }

        let partitions = self.lister.list_partitions().await?;
        debug!(partitions = partitions.len(), "Scanning partitions");

        for partition in partitions {
            if cancel.is_cancelled() {
                break;
            }

            let mut lock = self
                .locks
                .acquire_lock(&self.keys.lock_key(&partition), self.lock_ttl)
                .await?;
            if !lock.is_acquired() {
                debug!(partition = %partition, "Partition is held elsewhere");
                self.metrics.record_claim(ClaimOutcome::Busy);
                continue;
            }

            let jobs = match self.draw(&partition).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    self.release_quietly(&partition, lock.as_mut()).await;
                    return Err(e);
                }
            };

            if jobs.is_empty() {
                self.metrics.record_claim(ClaimOutcome::Empty);
                self.release_quietly(&partition, lock.as_mut()).await;
                continue;
            }

            info!(partition = %partition, jobs = jobs.len(), "Claimed partition");
            self.metrics.record_claim(ClaimOutcome::Claimed);
            *held = Some(HeldPartition {
                partition,
                lock,
                drawn: jobs.len(),
                acknowledged: 0,
            });
            // Stream leases live on the partition lock, not per job.
            return Ok(JobSourceResponse::new(jobs, 0));
        }

        Ok(JobSourceResponse::empty())
    }

    async fn heartbeat(&self, _job: &JobUnit, _cancel: &CancellationToken) -> Result<(), SourceError> {
        Ok(())
    }

    async fn acknowledge_completion(
        &self,
        job: &JobUnit,
        success: bool,
        _cancel: &CancellationToken,
    ) -> Result<(), SourceError> {
        let mut held = self.held.lock().await;
        let Some(current) = held.as_mut() else {
            debug!(job_id = %job.id, "Acknowledgement with no partition held");
            return Ok(());
        };

        current.acknowledged += 1;
        debug!(
            job_id = %job.id,
            success = success,
            acknowledged = current.acknowledged,
            drawn = current.drawn,
            "Job acknowledged"
        );
        if current.acknowledged < current.drawn {
            return Ok(());
        }

        if let Some(mut finished) = held.take() {
            self.release(&finished.partition, finished.lock.as_mut())
                .await?;
        }
        Ok(())
    }
}
