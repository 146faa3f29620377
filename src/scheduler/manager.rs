//! Execution engine: a fixed worker pool fed one batch at a time.
//!
//! Workers are long-lived tasks that loop through
//! READY -> wait for dispatch -> drain the batch queue -> signal done.
//! `JobManager::run` waits until every worker is ready, opens the dispatch
//! gate once, enqueues the batch and closes the queue, then blocks until
//! every worker has drained it. While the batch runs an optional heartbeat
//! task renews the lease of every job that has not finished yet.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::EngineError;
use crate::metrics::MetricsCollector;

use super::job::{BatchReport, JobSource, JobSourceResponse, JobUnit};
use super::runner::SafeJobRunner;

/// Default time the engine waits on the completion signal before re-checking.
pub const DEFAULT_COMPLETION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on how far ahead of each interval boundary a lease is renewed.
const MAX_RENEWAL_LEAD: Duration = Duration::from_secs(1);

/// A job in flight together with its result slot.
///
/// The slot's lock also serialises lease renewal against result recording.
pub struct JobEnvelope {
    pub job: JobUnit,
    result: tokio::sync::Mutex<Option<bool>>,
}

impl JobEnvelope {
    fn new(job: JobUnit) -> Self {
        Self {
            job,
            result: tokio::sync::Mutex::new(None),
        }
    }

    /// The recorded result, or `None` while the job is still running.
    pub async fn result(&self) -> Option<bool> {
        *self.result.lock().await
    }
}

/// Queue shared by the workers for one batch.
///
/// Closed once the whole batch has been enqueued; an empty closed queue
/// tells a worker it is done.
struct BatchQueue {
    items: Mutex<VecDeque<Arc<JobEnvelope>>>,
    closed: AtomicBool,
    available: Notify,
}

impl BatchQueue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            available: Notify::new(),
        }
    }

    fn closed() -> Self {
        let queue = Self::new();
        queue.closed.store(true, Ordering::SeqCst);
        queue
    }

    fn push_all(&self, envelopes: impl IntoIterator<Item = Arc<JobEnvelope>>) {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(envelopes);
        self.available.notify_waiters();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.available.notify_waiters();
    }

    fn try_pop(&self) -> Option<Arc<JobEnvelope>> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Next envelope, or `None` once the queue is closed and empty or the
    /// pool is shutting down.
    async fn pop(&self, shutdown: &CancellationToken) -> Option<Arc<JobEnvelope>> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(envelope) = self.try_pop() {
                return Some(envelope);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }

            tokio::select! {
                _ = notified => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }
}

/// What the dispatch gate broadcasts to the workers.
#[derive(Clone)]
struct Dispatch {
    generation: u64,
    queue: Arc<BatchQueue>,
    cancel: CancellationToken,
}

/// Counters and signals shared between the engine and its workers.
struct PoolState {
    ready_workers: AtomicUsize,
    completed_workers: AtomicUsize,
    completed_jobs: AtomicUsize,
    successful_jobs: AtomicUsize,
    ready_changed: Notify,
    done: Notify,
    gate: watch::Sender<Dispatch>,
}

impl PoolState {
    fn new() -> Self {
        let (gate, _) = watch::channel(Dispatch {
            generation: 0,
            queue: Arc::new(BatchQueue::closed()),
            cancel: CancellationToken::new(),
        });

        Self {
            ready_workers: AtomicUsize::new(0),
            completed_workers: AtomicUsize::new(0),
            completed_jobs: AtomicUsize::new(0),
            successful_jobs: AtomicUsize::new(0),
            ready_changed: Notify::new(),
            done: Notify::new(),
            gate,
        }
    }

    fn reset_batch_counters(&self) {
        self.completed_workers.store(0, Ordering::SeqCst);
        self.completed_jobs.store(0, Ordering::SeqCst);
        self.successful_jobs.store(0, Ordering::SeqCst);
    }
}

/// Clears the in-progress flag when a `run` call ends, even if it is dropped.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The execution engine.
pub struct JobManager {
    worker_count: usize,
    source: Arc<dyn JobSource>,
    runner: Arc<SafeJobRunner>,
    completion_poll_interval: Duration,
    state: Arc<PoolState>,
    generation: AtomicU64,
    started: AtomicBool,
    running: AtomicBool,
    shutdown: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    metrics: MetricsCollector,
}

impl JobManager {
    /// Creates an engine with `worker_count` workers (at least one).
    pub fn new(worker_count: usize, source: Arc<dyn JobSource>, runner: Arc<SafeJobRunner>) -> Self {
        Self {
            worker_count: worker_count.max(1),
            source,
            runner,
            completion_poll_interval: DEFAULT_COMPLETION_POLL_INTERVAL,
            state: Arc::new(PoolState::new()),
            generation: AtomicU64::new(0),
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            worker_handles: Mutex::new(Vec::new()),
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets how long the engine waits on the completion signal before re-checking.
    pub fn with_completion_poll_interval(mut self, interval: Duration) -> Self {
        self.completion_poll_interval = interval;
        self
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Launches the worker tasks.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::AlreadyStarted` on every call after the first.
    pub fn start(&self) -> Result<(), EngineError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::AlreadyStarted);
        }

        let mut handles = self
            .worker_handles
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        for i in 0..self.worker_count {
            let worker = Worker {
                id: format!("worker-{}", i),
                state: Arc::clone(&self.state),
                runner: Arc::clone(&self.runner),
                shutdown: self.shutdown.clone(),
                metrics: self.metrics.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }

        info!(num_workers = self.worker_count, "Job manager started");
        Ok(())
    }

    /// Runs one batch to completion.
    ///
    /// Blocks until every job has a recorded result and the heartbeat task
    /// has stopped. `cancel` is passed to job logic and lease renewal.
    ///
    /// # Errors
    ///
    /// - `EngineError::NotStarted` if `start` has not been called
    /// - `EngineError::RunInProgress` if another `run` is active
    /// - `EngineError::Cancelled` if `cancel` fires before dispatch
    pub async fn run(
        &self,
        batch: JobSourceResponse,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, EngineError> {
        if !self.is_started() {
            return Err(EngineError::NotStarted);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::RunInProgress);
        }
        let _guard = RunGuard(&self.running);

        let started_at = Instant::now();
        let heartbeat_interval = batch.heartbeat_interval();
        let envelopes: Vec<Arc<JobEnvelope>> = batch
            .items
            .into_iter()
            .map(|job| Arc::new(JobEnvelope::new(job)))
            .collect();

        self.wait_for_ready_workers(cancel).await?;
        self.state.reset_batch_counters();

        // Renewal deadlines are fixed before any job starts its clock.
        let renewals = heartbeat_interval.map(|interval| renewal_schedule(Instant::now(), interval));

        let queue = Arc::new(BatchQueue::new());
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.gate.send_replace(Dispatch {
            generation,
            queue: Arc::clone(&queue),
            cancel: cancel.clone(),
        });

        queue.push_all(envelopes.iter().cloned());
        queue.close();
        debug!(generation = generation, jobs = envelopes.len(), "Batch dispatched");

        let heartbeat_stop = cancel.child_token();
        let heartbeat = renewals.map(|renewals| {
            let monitor = HeartbeatMonitor {
                source: Arc::clone(&self.source),
                tracked: envelopes.clone(),
                renewals,
                stop: heartbeat_stop.clone(),
                cancel: cancel.clone(),
                metrics: self.metrics.clone(),
            };
            tokio::spawn(monitor.run())
        });

        if !self.wait_for_completion().await {
            info!(generation = generation, "Engine shut down mid-batch, unfinished jobs count as failed");
        }

        heartbeat_stop.cancel();
        if let Some(handle) = heartbeat {
            if let Err(e) = handle.await {
                error!(error = %e, "Heartbeat task panicked");
            }
        }

        let mut results = Vec::with_capacity(envelopes.len());
        for envelope in &envelopes {
            let success = envelope.result().await.unwrap_or(false);
            results.push((envelope.job.clone(), success));
        }

        let report = BatchReport {
            succeeded: results.iter().filter(|(_, ok)| *ok).count(),
            results,
            elapsed: started_at.elapsed(),
        };

        self.metrics.record_batch(report.elapsed.as_secs_f64());
        info!(
            duration_ms = report.elapsed.as_millis() as u64,
            succeeded = report.succeeded,
            total = report.total(),
            "Batch finished"
        );

        Ok(report)
    }

    /// Stops the workers and waits for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = self
            .worker_handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked during shutdown");
            }
        }

        info!("Job manager shutdown complete");
    }

    async fn wait_for_ready_workers(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        loop {
            let notified = self.state.ready_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.ready_workers.load(Ordering::SeqCst) == self.worker_count {
                return Ok(());
            }

            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = self.shutdown.cancelled() => return Err(EngineError::Cancelled),
            }
        }
    }

    /// Returns `false` if the engine was shut down before every worker
    /// finished the batch.
    ///
    /// Batch cancellation is not observed here: it makes job logic return
    /// early, so the workers still drain the queue promptly.
    async fn wait_for_completion(&self) -> bool {
        loop {
            let notified = self.state.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.completed_workers.load(Ordering::SeqCst) >= self.worker_count {
                return true;
            }

            // The timeout only bounds a missed wakeup.
            tokio::select! {
                _ = tokio::time::timeout(self.completion_poll_interval, notified) => {}
                _ = self.shutdown.cancelled() => return false,
            }
        }
    }
}

/// A single long-lived worker task.
struct Worker {
    id: String,
    state: Arc<PoolState>,
    runner: Arc<SafeJobRunner>,
    shutdown: CancellationToken,
    metrics: MetricsCollector,
}

impl Worker {
    async fn run(self) {
        debug!(worker_id = %self.id, "Worker started");
        let mut gate = self.state.gate.subscribe();
        let mut seen_generation = gate.borrow().generation;

        loop {
            self.state.ready_workers.fetch_add(1, Ordering::SeqCst);
            self.state.ready_changed.notify_waiters();

            let dispatch = tokio::select! {
                changed = gate.wait_for(|d| d.generation > seen_generation) => match changed {
                    Ok(dispatch) => dispatch.clone(),
                    Err(_) => break,
                },
                _ = self.shutdown.cancelled() => {
                    // A batch may have been dispatched that this worker never saw.
                    self.state.completed_workers.fetch_add(1, Ordering::SeqCst);
                    self.state.done.notify_waiters();
                    break;
                }
            };
            self.state.ready_workers.fetch_sub(1, Ordering::SeqCst);
            seen_generation = dispatch.generation;

            while let Some(envelope) = dispatch.queue.pop(&self.shutdown).await {
                self.process(&envelope, &dispatch.cancel).await;
            }

            self.state.completed_workers.fetch_add(1, Ordering::SeqCst);
            self.state.done.notify_waiters();
        }

        debug!(worker_id = %self.id, "Worker stopped");
    }

    async fn process(&self, envelope: &JobEnvelope, cancel: &CancellationToken) {
        let job = &envelope.job;
        debug!(worker_id = %self.id, job_id = %job.id, "Processing job");

        let success = match AssertUnwindSafe(self.runner.run(job, cancel))
            .catch_unwind()
            .await
        {
            Ok(success) => success,
            Err(_) => {
                error!(worker_id = %self.id, job_id = %job.id, "Job panicked");
                false
            }
        };

        *envelope.result.lock().await = Some(success);

        self.state.completed_jobs.fetch_add(1, Ordering::SeqCst);
        if success {
            self.state.successful_jobs.fetch_add(1, Ordering::SeqCst);
        }
        self.metrics.record_job(success);

        debug!(worker_id = %self.id, job_id = %job.id, success = success, "Job finished");
    }
}

/// Renewal ticks every `interval`, each one slightly ahead of the boundary
/// so a job lasting an exact multiple of `interval` is renewed at every
/// boundary it reaches.
fn renewal_schedule(start: Instant, interval: Duration) -> tokio::time::Interval {
    let lead = (interval / 10).min(MAX_RENEWAL_LEAD);
    let mut ticks = tokio::time::interval_at(start + (interval - lead), interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticks
}

/// Renews leases of unfinished jobs at a fixed interval.
struct HeartbeatMonitor {
    source: Arc<dyn JobSource>,
    tracked: Vec<Arc<JobEnvelope>>,
    renewals: tokio::time::Interval,
    stop: CancellationToken,
    cancel: CancellationToken,
    metrics: MetricsCollector,
}

impl HeartbeatMonitor {
    async fn run(mut self) {
        while !self.tracked.is_empty() {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = self.renewals.tick() => {}
            }

            let mut still_running = Vec::with_capacity(self.tracked.len());
            for envelope in std::mem::take(&mut self.tracked) {
                if self.renew(&envelope).await {
                    still_running.push(envelope);
                }
            }
            self.tracked = still_running;
        }
    }

    /// Returns whether the envelope should stay tracked.
    async fn renew(&self, envelope: &JobEnvelope) -> bool {
        let result = envelope.result.lock().await;
        if result.is_some() {
            return false;
        }

        match self.source.heartbeat(&envelope.job, &self.cancel).await {
            Ok(()) => {
                self.metrics.record_heartbeat(true);
                true
            }
            Err(e) => {
                self.metrics.record_heartbeat(false);
                error!(job_id = %envelope.job.id, error = %e, "Heartbeat failed, no longer renewing");
                false
            }
        }
    }
}
