//! End-to-end tests wiring the engine, the worker loop and the stream source
//! over in-memory backends.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use leaseworker::config::StreamConfig;
use leaseworker::scheduler::{
    JobLogicRunner, JobManager, JobPayload, JobSource, JobSourceResponse, JobUnit,
    NoReactionFailureHandler, SafeJobRunner, WorkerLoop,
};
use leaseworker::stream::{
    CheckpointStore, InMemoryLockProvider, InMemoryLongTermStore, InMemoryPartitionReader,
    InMemoryShortTermStore, KeyHelper, StaticPartitionLister, StreamJobSource,
};
use leaseworker::{JobError, ShutdownArbiter, SourceError};

/// Sleeps for the payload duration; a zero-length job fails permanently.
#[derive(Default)]
struct RecordingLogic {
    seen: Mutex<Vec<u64>>,
}

#[async_trait]
impl JobLogicRunner for RecordingLogic {
    async fn run(&self, payload: &JobPayload, _cancel: &CancellationToken) -> Result<(), JobError> {
        self.seen.lock().unwrap().push(payload.sleep_duration_seconds);
        if payload.sleep_duration_seconds == 0 {
            return Err(JobError::Fatal("empty job".to_string()));
        }
        tokio::time::sleep(payload.sleep_duration()).await;
        Ok(())
    }
}

/// Source that only ever acknowledges; batches are fed to the engine directly.
struct NullSource;

#[async_trait]
impl JobSource for NullSource {
    async fn get_jobs(&self, _cancel: &CancellationToken) -> Result<JobSourceResponse, SourceError> {
        Ok(JobSourceResponse::empty())
    }

    async fn heartbeat(&self, _job: &JobUnit, _cancel: &CancellationToken) -> Result<(), SourceError> {
        Ok(())
    }

    async fn acknowledge_completion(
        &self,
        _job: &JobUnit,
        _success: bool,
        _cancel: &CancellationToken,
    ) -> Result<(), SourceError> {
        Ok(())
    }
}

struct StreamFixture {
    reader: InMemoryPartitionReader,
    locks: InMemoryLockProvider,
    checkpoints: CheckpointStore,
    keys: KeyHelper,
    config: StreamConfig,
}

impl StreamFixture {
    fn new() -> Self {
        Self {
            reader: InMemoryPartitionReader::new(),
            locks: InMemoryLockProvider::new(),
            checkpoints: CheckpointStore::new(
                Arc::new(InMemoryShortTermStore::new()),
                Arc::new(InMemoryLongTermStore::new(Duration::from_secs(23 * 3600))),
                Duration::from_secs(295),
            ),
            keys: KeyHelper::new("e2e"),
            config: StreamConfig {
                consumer_group: "e2e".to_string(),
                lock_ttl: Duration::from_secs(60),
                ..StreamConfig::default()
            },
        }
    }

    /// A worker instance sharing this fixture's backends.
    fn source(&self, partitions: &[&str]) -> StreamJobSource {
        StreamJobSource::new(
            Arc::new(StaticPartitionLister::new(partitions.iter().copied())),
            Arc::new(self.reader.clone()),
            Arc::new(self.locks.clone()),
            self.checkpoints.clone(),
            &self.config,
        )
    }
}

#[tokio::test(start_paused = true)]
async fn test_pool_runs_batch_with_mixed_outcomes() {
    let logic = Arc::new(RecordingLogic::default());
    let runner = Arc::new(SafeJobRunner::new(
        logic.clone(),
        Arc::new(NoReactionFailureHandler),
        1,
    ));
    let manager = JobManager::new(2, Arc::new(NullSource), runner);
    manager.start().unwrap();

    let batch = JobSourceResponse::new(
        vec![
            JobUnit::new("long", JobPayload::sleep(2)),
            JobUnit::new("broken", JobPayload::sleep(0)),
            JobUnit::new("short", JobPayload::sleep(1)),
        ],
        0,
    );

    let report = manager.run(batch, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.total(), 3);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed(), 1);

    let outcome = |id: &str| {
        report
            .results
            .iter()
            .find(|(job, _)| job.id == id)
            .map(|(_, success)| *success)
    };
    assert_eq!(outcome("long"), Some(true));
    assert_eq!(outcome("broken"), Some(false));
    assert_eq!(outcome("short"), Some(true));

    // Two workers: the long job runs alongside the failed and short ones.
    assert!(report.elapsed >= Duration::from_secs(2));
    assert!(report.elapsed < Duration::from_secs(3));

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_worker_loop_drains_stream_partition() {
    let fixture = StreamFixture::new();
    for secs in [3, 1, 4, 1, 5] {
        fixture.reader.push("p0", &JobPayload::sleep(secs));
    }

    let source = Arc::new(fixture.source(&["p0"]));
    let logic = Arc::new(RecordingLogic::default());
    let runner = Arc::new(SafeJobRunner::new(
        logic.clone(),
        Arc::new(NoReactionFailureHandler),
        0,
    ));
    let manager = Arc::new(JobManager::new(2, source.clone(), runner));
    let arbiter = ShutdownArbiter::new();
    let worker = WorkerLoop::new(
        manager,
        source.clone(),
        arbiter.clone(),
        Duration::from_secs(1),
        Duration::from_secs(4),
    );

    let handle = tokio::spawn(async move { worker.run().await });
    tokio::time::sleep(Duration::from_secs(30)).await;
    arbiter.trigger();
    handle.await.unwrap().unwrap();

    let mut seen = logic.seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec![1, 1, 3, 4, 5]);

    let key = fixture.keys.checkpoint_key("p0");
    assert_eq!(
        fixture.checkpoints.short_term_position(&key).await.unwrap().as_deref(),
        Some("5")
    );
    assert_eq!(
        fixture.checkpoints.long_term_marker(&key).await.unwrap().as_deref(),
        Some("4")
    );
    assert!(!fixture.locks.is_locked(&fixture.keys.lock_key("p0")));
    assert!(source.held_partition().await.is_none());
}

#[tokio::test]
async fn test_cooperating_instances_claim_disjoint_partitions() {
    let fixture = StreamFixture::new();
    fixture.reader.push("p0", &JobPayload::sleep(1));
    fixture.reader.push("p1", &JobPayload::sleep(2));

    let first = fixture.source(&["p0", "p1"]);
    let second = fixture.source(&["p0", "p1"]);
    let third = fixture.source(&["p0", "p1"]);
    let cancel = CancellationToken::new();

    let a = first.get_jobs(&cancel).await.unwrap();
    let b = second.get_jobs(&cancel).await.unwrap();
    let c = third.get_jobs(&cancel).await.unwrap();

    assert_eq!(first.held_partition().await.as_deref(), Some("p0"));
    assert_eq!(second.held_partition().await.as_deref(), Some("p1"));
    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 1);
    assert!(c.is_empty());

    // Once the first instance acknowledges, the partition is free again but
    // its checkpoint has moved past the processed record.
    first
        .acknowledge_completion(&a.items[0], true, &cancel)
        .await
        .unwrap();
    assert!(!fixture.locks.is_locked(&fixture.keys.lock_key("p0")));
    assert!(third.get_jobs(&cancel).await.unwrap().is_empty());

    fixture.reader.push("p0", &JobPayload::sleep(7));
    let next = third.get_jobs(&cancel).await.unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(next.items[0].payload.sleep_duration_seconds, 7);
}
