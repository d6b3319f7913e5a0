//! The scheduler service.
//!
//! One scheduler instance per agent; a lease on the trigger-lease row makes
//! exactly one of them the leader per queue type. Only the leader advances
//! the sliding window:
//!
//! 1. Close the current trigger when its orchestrator reached a terminal
//!    status — Completed advances the cursor to the window end and bumps the
//!    sequence; Failed or Cancelled parks the trigger for an operator.
//! 2. When the cadence has elapsed and new data is past the lag, enqueue the
//!    next orchestrator job over `[cursor, min(now - lag, cursor + max_window))`.
//! 3. Renew the lease well inside its expiry.
//!
//! Non-leaders poll the lease and take over when it lapses.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stratum_core::{GroupId, MessageQueue, TableStore};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::job::JobStatus;
use crate::metadata::{CurrentTrigger, MetadataStore, TriggerStatus};
use crate::orchestrator::{JobType, OrchestratorJobInputData};
use crate::queue_client::JobQueue;

/// Runtime options for the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Lease duration; renewal happens every tick, which must be well
    /// inside this.
    pub lease_ttl: Duration,
    /// Delay between ticks for leaders and candidates alike.
    pub tick_interval: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(60),
            tick_interval: Duration::from_secs(15),
        }
    }
}

/// The sliding-window scheduler for one pipeline.
pub struct SchedulerService<T: TableStore + ?Sized + 'static, Q: MessageQueue + ?Sized + 'static> {
    queue: JobQueue<T, Q>,
    metadata: MetadataStore<T>,
    config: PipelineConfig,
    options: SchedulerOptions,
    instance_id: String,
}

impl<T: TableStore + ?Sized + 'static, Q: MessageQueue + ?Sized + 'static> SchedulerService<T, Q> {
    /// Creates a scheduler instance with a fresh identity.
    pub fn new(
        queue: JobQueue<T, Q>,
        metadata: MetadataStore<T>,
        config: PipelineConfig,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            queue,
            metadata,
            config,
            options,
            instance_id: format!("scheduler-{}", ulid::Ulid::new()),
        }
    }

    /// Returns this instance's identity.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Runs the scheduler until `shutdown` trips, releasing the lease on
    /// the way out.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if let Err(err) = self.tick().await {
                warn!(instance = %self.instance_id, error = %err, "scheduler tick failed");
            }
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.options.tick_interval) => {}
            }
        }
        match self.metadata.release_trigger_lease(&self.instance_id).await {
            Ok(true) => info!(instance = %self.instance_id, "scheduler lease released"),
            Ok(false) => {}
            Err(err) => warn!(instance = %self.instance_id, error = %err, "lease release failed"),
        }
    }

    /// Runs one scheduling round: acquire or renew the lease, then advance
    /// the trigger state machine as leader.
    ///
    /// Returns true if this instance acted as leader.
    ///
    /// # Errors
    ///
    /// Surfaces storage faults; the loop logs and retries on the next tick.
    pub async fn tick(&self) -> Result<bool> {
        let _tick_timer = crate::metrics::time_scheduler_tick();
        let is_leader = self
            .metadata
            .try_acquire_trigger_lease(&self.instance_id, self.options.lease_ttl)
            .await?;
        if !is_leader {
            debug!(instance = %self.instance_id, "not the scheduler leader");
            return Ok(false);
        }

        self.advance_trigger().await?;
        Ok(true)
    }

    async fn advance_trigger(&self) -> Result<()> {
        let now = Utc::now();
        let mut current = self.metadata.get_current_trigger().await?;

        // Close a terminal orchestrator first so the same tick can open the
        // successor window.
        if let Some(trigger) = &current {
            if trigger.status == TriggerStatus::Running {
                self.close_if_terminal(trigger.clone()).await?;
                current = self.metadata.get_current_trigger().await?;
            }
        }

        match current {
            None => {
                // First window of the pipeline.
                let Some(end) = self.next_window_end(None, now) else {
                    return Ok(());
                };
                self.start_trigger(0, None, end).await
            }
            Some(trigger) => match trigger.status {
                TriggerStatus::Running => Ok(()),
                TriggerStatus::Completed => {
                    let cursor = trigger.data_end_time;
                    if now - cursor < self.cadence(&trigger) {
                        return Ok(());
                    }
                    let Some(end) = self.next_window_end(Some(cursor), now) else {
                        return Ok(());
                    };
                    self.start_trigger(trigger.sequence_id + 1, Some(cursor), end)
                        .await
                }
                TriggerStatus::Failed => {
                    debug!(sequence = trigger.sequence_id, "trigger parked as failed");
                    Ok(())
                }
            },
        }
    }

    /// Window cadence: the initial interval until the first window lands,
    /// the incremental interval afterwards.
    fn cadence(&self, trigger: &CurrentTrigger) -> chrono::Duration {
        let interval = if trigger.sequence_id == 0 {
            self.config.initial_orchestration_interval
        } else {
            self.config.incremental_orchestration_interval
        };
        chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::seconds(60))
    }

    /// Computes the next window end, or `None` when no new data is past the
    /// lag yet.
    fn next_window_end(
        &self,
        cursor: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let lagged_now = now
            - chrono::Duration::from_std(self.config.window_lag)
                .unwrap_or_else(|_| chrono::Duration::zero());
        match cursor {
            None => Some(lagged_now),
            Some(cursor) => {
                let capped = match self
                    .config
                    .max_window
                    .and_then(|max_window| chrono::Duration::from_std(max_window).ok())
                    .and_then(|width| cursor.checked_add_signed(width))
                {
                    Some(cap) => lagged_now.min(cap),
                    None => lagged_now,
                };
                (capped > cursor).then_some(capped)
            }
        }
    }

    async fn start_trigger(
        &self,
        sequence_id: u64,
        data_start_time: Option<DateTime<Utc>>,
        data_end_time: DateTime<Utc>,
    ) -> Result<()> {
        let input = OrchestratorJobInputData {
            job_type: JobType::Orchestrator,
            trigger_sequence_id: sequence_id,
            data_start_time,
            data_end_time,
            since: data_start_time,
            job_version: 1,
        };
        let definition = Bytes::from(serde_json::to_vec(&input)?);
        let jobs = self
            .queue
            .enqueue(&[definition], GroupId::new(sequence_id))
            .await?;

        let trigger = CurrentTrigger {
            sequence_id,
            status: TriggerStatus::Running,
            data_start_time,
            data_end_time,
            orchestrator_job_id: Some(jobs[0].id),
        };
        self.metadata.save_current_trigger(&trigger).await?;
        info!(
            sequence = sequence_id,
            job_id = %jobs[0].id,
            end = %data_end_time,
            "trigger window started"
        );
        Ok(())
    }

    async fn close_if_terminal(&self, trigger: CurrentTrigger) -> Result<()> {
        let Some(job_id) = trigger.orchestrator_job_id else {
            return Err(Error::retriable(format!(
                "running trigger {} has no orchestrator job",
                trigger.sequence_id
            )));
        };
        let Some(job) = self.queue.get_job_by_id(job_id).await? else {
            return Err(Error::retriable(format!(
                "orchestrator job {job_id} has no record"
            )));
        };

        match job.status {
            JobStatus::Completed => {
                let closed = CurrentTrigger {
                    status: TriggerStatus::Completed,
                    ..trigger
                };
                self.metadata.save_current_trigger(&closed).await?;
                info!(
                    sequence = closed.sequence_id,
                    cursor = %closed.data_end_time,
                    "trigger window completed; cursor advanced"
                );
            }
            JobStatus::Failed | JobStatus::Cancelled => {
                warn!(
                    sequence = trigger.sequence_id,
                    job_id = %job_id,
                    status = %job.status,
                    "orchestrator ended abnormally; parking trigger"
                );
                let parked = CurrentTrigger {
                    status: TriggerStatus::Failed,
                    ..trigger
                };
                self.metadata.save_current_trigger(&parked).await?;
            }
            JobStatus::Created | JobStatus::Running => {}
        }
        Ok(())
    }
}
