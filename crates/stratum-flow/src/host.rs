//! The generic worker host.
//!
//! The host runs a fixed number of worker slots over one [`JobQueue`]. Each
//! worker loops: dequeue → build the handler → run the handler and a
//! heartbeat timer in parallel → complete or abandon.
//!
//! - Heartbeat cadence is one third of the lease duration. Each beat
//!   persists the handler's latest progress snapshot and observes the
//!   cooperative cancellation flag, which trips the handler's
//!   [`CancellationToken`].
//! - A heartbeat that reports a lost lease marks the attempt a zombie; the
//!   worker abandons the job silently and a later dequeue re-leases it.
//! - Handler errors split by kind: retriable errors leave the job Running
//!   for re-lease, fatal errors complete it Failed, and an observed
//!   cancellation completes it so the queue derives the Cancelled status.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use stratum_core::{MessageQueue, TableStore};

use crate::error::Result;
use crate::job::{JobInfo, JobStatus};
use crate::queue_client::{DequeueOutcome, JobQueue};

/// Shared progress snapshot between a handler and its heartbeat.
///
/// The handler reports progress after every state change; the next heartbeat
/// persists the latest snapshot as the job's result, so crash recovery
/// resumes from there.
#[derive(Debug, Default)]
pub struct JobProgress {
    latest: Mutex<Bytes>,
}

impl JobProgress {
    /// Creates a progress handle seeded with the job's stored result.
    #[must_use]
    pub fn new(initial: Bytes) -> Self {
        Self {
            latest: Mutex::new(initial),
        }
    }

    /// Replaces the progress snapshot.
    pub fn report(&self, snapshot: Bytes) {
        if let Ok(mut latest) = self.latest.lock() {
            *latest = snapshot;
        }
    }

    /// Returns the latest snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Bytes {
        self.latest
            .lock()
            .map(|latest| latest.clone())
            .unwrap_or_default()
    }
}

/// A job implementation hosted by the worker loop.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Executes the job and returns its serialized result.
    ///
    /// The handler must report progress through `progress` after every state
    /// change and return [`Error::Cancelled`] promptly once `cancel` trips.
    async fn execute(
        &self,
        job: &JobInfo,
        progress: &JobProgress,
        cancel: &CancellationToken,
    ) -> Result<Bytes>;
}

/// Builds handlers for dequeued jobs.
pub trait JobHandlerFactory: Send + Sync {
    /// Constructs the handler for `job`, inspecting its definition.
    ///
    /// # Errors
    ///
    /// An error here is fatal to the job: the host completes it Failed.
    fn create(&self, job: &JobInfo) -> Result<Arc<dyn JobHandler>>;
}

/// Runtime options for the host.
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Number of concurrent worker slots.
    pub worker_slots: usize,
    /// Lease duration requested on dequeue, in seconds.
    pub heartbeat_timeout_sec: u32,
    /// How long a worker sleeps when the queue is empty.
    pub poll_interval: Duration,
    /// Whether a failed job cancels its whole group.
    pub request_cancellation_on_failure: bool,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            worker_slots: 4,
            heartbeat_timeout_sec: 30,
            poll_interval: Duration::from_secs(1),
            request_cancellation_on_failure: true,
        }
    }
}

impl HostOptions {
    /// Heartbeat cadence: one third of the lease, at least one second.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.heartbeat_timeout_sec.max(3)) / 3)
    }
}

/// The worker host for one queue type.
pub struct JobHost<T: TableStore + ?Sized + 'static, Q: MessageQueue + ?Sized + 'static> {
    queue: JobQueue<T, Q>,
    factory: Arc<dyn JobHandlerFactory>,
    options: HostOptions,
}

impl<T: TableStore + ?Sized + 'static, Q: MessageQueue + ?Sized + 'static> JobHost<T, Q> {
    /// Creates a host over the given queue client and handler factory.
    pub fn new(
        queue: JobQueue<T, Q>,
        factory: Arc<dyn JobHandlerFactory>,
        options: HostOptions,
    ) -> Self {
        Self {
            queue,
            factory,
            options,
        }
    }

    /// Runs the configured worker slots until `shutdown` trips.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut handles = Vec::with_capacity(self.options.worker_slots);
        for slot in 0..self.options.worker_slots {
            let worker = Worker {
                queue: self.queue.clone(),
                factory: Arc::clone(&self.factory),
                options: self.options.clone(),
                name: format!("worker-{slot}-{}", ulid::Ulid::new()),
            };
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move { worker.run(shutdown).await }));
        }
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "worker task panicked");
            }
        }
    }

    /// Dequeues and runs at most one job; returns true if a job was leased.
    ///
    /// Deterministic entry point used by tests and by embedders that drive
    /// their own loop.
    ///
    /// # Errors
    ///
    /// Surfaces dequeue failures; handler failures are absorbed into the
    /// job's terminal status.
    pub async fn poll_once(&self, shutdown: &CancellationToken) -> Result<bool> {
        let worker = Worker {
            queue: self.queue.clone(),
            factory: Arc::clone(&self.factory),
            options: self.options.clone(),
            name: format!("poll-{}", ulid::Ulid::new()),
        };
        match worker
            .queue
            .dequeue(&worker.name, worker.options.heartbeat_timeout_sec)
            .await?
        {
            DequeueOutcome::Leased(job) => {
                worker.run_job(job, shutdown).await;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

struct Worker<T: TableStore + ?Sized + 'static, Q: MessageQueue + ?Sized + 'static> {
    queue: JobQueue<T, Q>,
    factory: Arc<dyn JobHandlerFactory>,
    options: HostOptions,
    name: String,
}

impl<T: TableStore + ?Sized + 'static, Q: MessageQueue + ?Sized + 'static> Worker<T, Q> {
    async fn run(&self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match self
                .queue
                .dequeue(&self.name, self.options.heartbeat_timeout_sec)
                .await
            {
                Ok(DequeueOutcome::Leased(job)) => {
                    self.run_job(job, &shutdown).await;
                }
                Ok(DequeueOutcome::Discarded(reason)) => {
                    debug!(worker = %self.name, reason = reason.as_str(), "discarded message");
                }
                Ok(_) => {
                    tokio::select! {
                        () = shutdown.cancelled() => return,
                        () = tokio::time::sleep(self.options.poll_interval) => {}
                    }
                }
                Err(err) => {
                    warn!(worker = %self.name, error = %err, "dequeue failed");
                    tokio::select! {
                        () = shutdown.cancelled() => return,
                        () = tokio::time::sleep(self.options.poll_interval) => {}
                    }
                }
            }
        }
    }

    async fn run_job(&self, mut job: JobInfo, shutdown: &CancellationToken) {
        let handler = match self.factory.create(&job) {
            Ok(handler) => handler,
            Err(err) => {
                warn!(worker = %self.name, job_id = %job.id, error = %err, "handler construction failed");
                job.status = JobStatus::Failed;
                self.finish(&job).await;
                return;
            }
        };

        let progress = Arc::new(JobProgress::new(job.result.clone()));
        let cancel = shutdown.child_token();
        let lease_lost = Arc::new(AtomicBool::new(false));
        let cancel_observed = Arc::new(AtomicBool::new(false));

        let heartbeat_stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.queue.clone(),
            job.clone(),
            Arc::clone(&progress),
            cancel.clone(),
            Arc::clone(&lease_lost),
            Arc::clone(&cancel_observed),
            heartbeat_stop.clone(),
            self.options.heartbeat_interval(),
        ));

        let outcome = handler.execute(&job, &progress, &cancel).await;

        heartbeat_stop.cancel();
        if let Err(err) = heartbeat.await {
            error!(worker = %self.name, job_id = %job.id, error = %err, "heartbeat task panicked");
        }

        if lease_lost.load(Ordering::SeqCst) {
            debug!(worker = %self.name, job_id = %job.id, "lease lost; abandoning attempt");
            return;
        }

        match outcome {
            Ok(result) => {
                job.result = result;
                self.finish(&job).await;
            }
            Err(err) if err.is_cancelled() => {
                if cancel_observed.load(Ordering::SeqCst) {
                    job.result = progress.snapshot();
                    self.finish(&job).await;
                } else {
                    // Shutdown, not the stored flag: leave the job Running
                    // so the next dequeue re-leases it.
                    debug!(worker = %self.name, job_id = %job.id, "shutdown during job; leaving for re-lease");
                }
            }
            Err(err) if err.is_job_not_exist() => {
                debug!(worker = %self.name, job_id = %job.id, "job vanished under handler");
            }
            Err(err) if err.is_retriable() => {
                warn!(worker = %self.name, job_id = %job.id, error = %err, "retriable failure; leaving job for re-lease");
            }
            Err(err) => {
                warn!(worker = %self.name, job_id = %job.id, error = %err, "fatal failure; marking job failed");
                job.status = JobStatus::Failed;
                job.result = progress.snapshot();
                self.finish(&job).await;
            }
        }
    }

    async fn finish(&self, job: &JobInfo) {
        match self
            .queue
            .complete(job, self.options.request_cancellation_on_failure)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_job_not_exist() => {
                debug!(worker = %self.name, job_id = %job.id, "completion refused; a newer lease owns the job");
            }
            Err(err) => {
                warn!(worker = %self.name, job_id = %job.id, error = %err, "completion failed; job will be re-leased");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn heartbeat_loop<T: TableStore + ?Sized, Q: MessageQueue + ?Sized>(
    queue: JobQueue<T, Q>,
    job: JobInfo,
    progress: Arc<JobProgress>,
    cancel: CancellationToken,
    lease_lost: Arc<AtomicBool>,
    cancel_observed: Arc<AtomicBool>,
    stop: CancellationToken,
    interval: Duration,
) {
    loop {
        tokio::select! {
            () = stop.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }

        let mut snapshot = job.clone();
        snapshot.result = progress.snapshot();
        match queue.keep_alive(&snapshot).await {
            Ok(true) => {
                cancel_observed.store(true, Ordering::SeqCst);
                cancel.cancel();
            }
            Ok(false) => {}
            Err(err) if err.is_job_not_exist() => {
                lease_lost.store(true, Ordering::SeqCst);
                cancel.cancel();
                return;
            }
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "heartbeat failed; retrying next beat");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::prelude::{MemoryQueue, MemoryTable};
    use stratum_core::{GroupId, QueueType};

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn execute(
            &self,
            job: &JobInfo,
            _progress: &JobProgress,
            _cancel: &CancellationToken,
        ) -> Result<Bytes> {
            Ok(job.definition.clone())
        }
    }

    struct EchoFactory;

    impl JobHandlerFactory for EchoFactory {
        fn create(&self, _job: &JobInfo) -> Result<Arc<dyn JobHandler>> {
            Ok(Arc::new(EchoHandler))
        }
    }

    fn harness() -> (
        JobQueue<MemoryTable, MemoryQueue>,
        JobHost<MemoryTable, MemoryQueue>,
    ) {
        let queue = JobQueue::new(
            Arc::new(MemoryTable::new()),
            Arc::new(MemoryQueue::new()),
            QueueType::new(1),
        );
        let host = JobHost::new(queue.clone(), Arc::new(EchoFactory), HostOptions::default());
        (queue, host)
    }

    #[test]
    fn heartbeat_interval_is_a_third_of_the_lease() {
        let options = HostOptions {
            heartbeat_timeout_sec: 30,
            ..HostOptions::default()
        };
        assert_eq!(options.heartbeat_interval(), Duration::from_secs(10));

        let tiny = HostOptions {
            heartbeat_timeout_sec: 1,
            ..HostOptions::default()
        };
        assert_eq!(tiny.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn progress_snapshot_roundtrip() {
        let progress = JobProgress::new(Bytes::from_static(b"initial"));
        assert_eq!(progress.snapshot(), Bytes::from_static(b"initial"));
        progress.report(Bytes::from_static(b"updated"));
        assert_eq!(progress.snapshot(), Bytes::from_static(b"updated"));
    }

    #[tokio::test]
    async fn poll_once_runs_a_job_to_completion() -> Result<()> {
        let (queue, host) = harness();
        let jobs = queue
            .enqueue(&[Bytes::from_static(b"payload")], GroupId::new(1))
            .await?;

        let shutdown = CancellationToken::new();
        assert!(host.poll_once(&shutdown).await?);

        let done = queue.get_job_by_id(jobs[0].id).await?.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result, Bytes::from_static(b"payload"));
        Ok(())
    }

    #[tokio::test]
    async fn poll_once_on_empty_queue_returns_false() -> Result<()> {
        let (_queue, host) = harness();
        let shutdown = CancellationToken::new();
        assert!(!host.poll_once(&shutdown).await?);
        Ok(())
    }
}
