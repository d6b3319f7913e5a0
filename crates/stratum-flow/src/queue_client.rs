//! The durable job queue client.
//!
//! This module implements enqueue / dequeue / keep-alive / complete / cancel
//! over a [`TableStore`] and a [`MessageQueue`]. It is safe under concurrent
//! multi-writer enqueue and under arbitrary crash points:
//!
//! - **Idempotent enqueue**: the [`JobLock`] row makes a repeated enqueue of
//!   the same `(queue_type, group_id, definition)` return the existing job.
//!   Every enqueue step only adds state, so a crashed call is resumed by the
//!   next one.
//! - **Messages are pointers**: a queue message never carries authority. A
//!   message whose job is terminal is garbage and is discarded on sight.
//! - **Versions linearise leases**: each dequeue stamps a fresh `version`;
//!   keep-alive and complete refuse a caller whose version no longer matches
//!   the stored row.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, warn};

use stratum_core::{
    GroupId, JobId, MessageQueue, QueueType, TableEntity, TableStore, TransactionBatch,
};

use crate::error::{Error, Result};
use crate::metrics::PipelineMetrics;
use crate::job::{
    counter_partition_key, job_info_row_prefix, job_lock_row_key, job_partition_key,
    lease_version_now, reverse_index_partition_key, JobIdCounter, JobInfo, JobLock, JobMessage,
    JobReverseIndex, JobStatus, COUNTER_ROW_KEY,
};

/// Maximum number of definitions accepted by one enqueue call.
pub const MAX_ENQUEUE_DEFINITIONS: usize = 50;

/// Maximum serialized size of a job definition or result (64 KiB).
pub const MAX_PROPERTY_SIZE: usize = 64 * 1024;

/// Bounded retries for optimistic-concurrency loops (id allocation,
/// cancellation flag writes).
const CAS_RETRY_LIMIT: usize = 8;

/// Why a dequeued message was handled without leasing a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The message body did not parse as a job pointer.
    Malformed,
    /// The referenced table rows do not exist.
    Orphaned,
    /// The referenced job already reached a terminal status.
    Terminal,
    /// The lock references a different message; this one is left over from
    /// an earlier enqueue.
    Stale,
}

impl DiscardReason {
    /// Returns the label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Orphaned => "orphaned",
            Self::Terminal => "terminal",
            Self::Stale => "stale",
        }
    }
}

/// Outcome of one dequeue attempt.
#[derive(Debug, Clone)]
pub enum DequeueOutcome {
    /// A job was leased; the caller owns it until the heartbeat lapses.
    Leased(JobInfo),
    /// No message was visible.
    Empty,
    /// A message was received but its enqueue has not finished publishing;
    /// the message was left in place.
    NotReady,
    /// The referenced job is Running under a live lease held elsewhere; the
    /// message was left to re-appear.
    LeaseHeld,
    /// A garbage message was deleted.
    Discarded(DiscardReason),
}

impl DequeueOutcome {
    /// Returns the leased job, if one was obtained.
    #[must_use]
    pub fn job(self) -> Option<JobInfo> {
        match self {
            Self::Leased(job) => Some(job),
            _ => None,
        }
    }

    /// Returns true if a job was leased.
    #[must_use]
    pub const fn is_leased(&self) -> bool {
        matches!(self, Self::Leased(_))
    }

    /// Returns the label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Leased(_) => "leased",
            Self::Empty => "empty",
            Self::NotReady => "not_ready",
            Self::LeaseHeld => "lease_held",
            Self::Discarded(_) => "discarded",
        }
    }
}

/// The durable job queue over a table and a message queue.
///
/// Cheap to clone; clones share the backends.
pub struct JobQueue<T: TableStore + ?Sized, Q: MessageQueue + ?Sized> {
    table: Arc<T>,
    queue: Arc<Q>,
    queue_type: QueueType,
    metrics: PipelineMetrics,
}

impl<T: TableStore + ?Sized, Q: MessageQueue + ?Sized> Clone for JobQueue<T, Q> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            queue: Arc::clone(&self.queue),
            queue_type: self.queue_type,
            metrics: self.metrics.clone(),
        }
    }
}

impl<T: TableStore + ?Sized, Q: MessageQueue + ?Sized> JobQueue<T, Q> {
    /// Creates a queue client for one queue type.
    pub fn new(table: Arc<T>, queue: Arc<Q>, queue_type: QueueType) -> Self {
        Self {
            table,
            queue,
            queue_type,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Returns the queue type this client operates on.
    #[must_use]
    pub const fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    /// Enqueues up to [`MAX_ENQUEUE_DEFINITIONS`] job definitions into a
    /// group.
    ///
    /// Re-enqueueing a definition that already exists in the group is a
    /// no-op returning the existing job, so concurrent writers converge on
    /// one job per `(queue_type, group_id, definition)`.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateDefinition`] if the call itself repeats a
    ///   definition
    /// - [`Error::PropertyTooLarge`] if a definition exceeds 64 KiB
    /// - transient storage faults are surfaced to the caller; re-calling
    ///   resumes from the persisted state
    pub async fn enqueue(&self, definitions: &[Bytes], group_id: GroupId) -> Result<Vec<JobInfo>> {
        if definitions.is_empty() || definitions.len() > MAX_ENQUEUE_DEFINITIONS {
            return Err(Error::Configuration {
                message: format!(
                    "enqueue accepts 1..={MAX_ENQUEUE_DEFINITIONS} definitions, got {}",
                    definitions.len()
                ),
            });
        }
        for definition in definitions {
            check_property_size("definition", definition)?;
        }
        let lock_row_keys: Vec<String> = definitions
            .iter()
            .map(|d| job_lock_row_key(d))
            .collect();
        {
            let mut seen = std::collections::HashSet::new();
            for key in &lock_row_keys {
                if !seen.insert(key.as_str()) {
                    return Err(Error::DuplicateDefinition {
                        group_id: group_id.value(),
                    });
                }
            }
        }

        let partition_key = job_partition_key(self.queue_type, group_id);
        let jobs = self
            .insert_jobs_and_locks(&partition_key, definitions, &lock_row_keys, group_id)
            .await?;
        self.insert_reverse_indices(&partition_key, &jobs).await?;
        self.dispatch_messages(&partition_key, &jobs, &lock_row_keys)
            .await?;

        Ok(jobs)
    }

    /// Leases the next available job, hiding its message for
    /// `heartbeat_timeout_sec`.
    ///
    /// `worker` identifies the caller in logs only; ownership is fenced by
    /// the job version, never by the worker name.
    ///
    /// # Errors
    ///
    /// Surfaces transient storage faults; garbage messages are deleted and
    /// reported through [`DequeueOutcome::Discarded`] rather than errors.
    pub async fn dequeue(
        &self,
        worker: &str,
        heartbeat_timeout_sec: u32,
    ) -> Result<DequeueOutcome> {
        let outcome = self.dequeue_inner(worker, heartbeat_timeout_sec).await?;
        self.metrics.record_dequeue(outcome.as_str());
        Ok(outcome)
    }

    async fn dequeue_inner(
        &self,
        worker: &str,
        heartbeat_timeout_sec: u32,
    ) -> Result<DequeueOutcome> {
        let visibility = std::time::Duration::from_secs(u64::from(heartbeat_timeout_sec));
        let Some(message) = self.queue.receive(visibility).await? else {
            return Ok(DequeueOutcome::Empty);
        };

        let Ok(pointer) = JobMessage::from_body(&message.body) else {
            warn!(worker, message_id = %message.message_id, "discarding malformed job message");
            self.queue
                .delete(&message.message_id, &message.pop_receipt)
                .await?;
            return Ok(DequeueOutcome::Discarded(DiscardReason::Malformed));
        };

        let info_entity = self.table.get(&pointer.pk, &pointer.rk).await?;
        let lock_entity = self.table.get(&pointer.pk, &pointer.lockrk).await?;
        let (Some(info_entity), Some(lock_entity)) = (info_entity, lock_entity) else {
            warn!(worker, message_id = %message.message_id, "discarding orphaned job message");
            self.queue
                .delete(&message.message_id, &message.pop_receipt)
                .await?;
            return Ok(DequeueOutcome::Discarded(DiscardReason::Orphaned));
        };

        let mut job = JobInfo::from_payload(&info_entity.payload)?;
        let mut lock = JobLock::from_payload(&lock_entity.payload)?;

        if job.is_terminal() {
            debug!(worker, job_id = %job.id, status = %job.status, "discarding message for terminal job");
            self.queue
                .delete(&message.message_id, &message.pop_receipt)
                .await?;
            return Ok(DequeueOutcome::Discarded(DiscardReason::Terminal));
        }

        let Some(lock_message_id) = lock.message_id.clone() else {
            // Enqueue has inserted the rows but not yet recorded the message;
            // leave the message alone and let the race settle.
            return Ok(DequeueOutcome::NotReady);
        };
        if lock_message_id != message.message_id {
            debug!(worker, job_id = %job.id, "discarding stale message from a prior enqueue");
            self.queue
                .delete(&message.message_id, &message.pop_receipt)
                .await?;
            return Ok(DequeueOutcome::Discarded(DiscardReason::Stale));
        }

        let now = Utc::now();
        if job.lease_is_live(now) {
            debug!(worker, job_id = %job.id, "lease still live; leaving message to re-appear");
            return Ok(DequeueOutcome::LeaseHeld);
        }

        job.status = JobStatus::Running;
        job.version = lease_version_now();
        job.heartbeat_date_time = now;
        job.heartbeat_timeout_sec = heartbeat_timeout_sec;
        lock.pop_receipt = Some(message.pop_receipt.clone());

        let batch = TransactionBatch::new(&pointer.pk)
            .update(&pointer.rk, job.to_payload()?, info_entity.etag)
            .update(&pointer.lockrk, lock.to_payload()?, lock_entity.etag);
        match self.table.submit(batch).await {
            Ok(_) => {}
            Err(err) if err.is_precondition_failed() => {
                // Another writer touched the rows between read and commit;
                // the message stays invisible and re-appears later.
                return Err(Error::retriable_with_source("job rows contended during dequeue", err));
            }
            Err(err) => return Err(err.into()),
        }

        debug!(worker, job_id = %job.id, version = job.version, "job leased");
        Ok(DequeueOutcome::Leased(job))
    }

    /// Extends the caller's lease and persists its latest progress snapshot.
    ///
    /// Returns the stored `cancel_requested` flag so the worker can observe
    /// cooperative cancellation.
    ///
    /// # Errors
    ///
    /// [`Error::JobNotExist`] when the caller's version no longer matches
    /// the stored row or the queue message is gone — the lease is lost and
    /// the caller must abandon the job.
    pub async fn keep_alive(&self, job: &JobInfo) -> Result<bool> {
        match self.keep_alive_inner(job).await {
            Ok(cancel_requested) => {
                self.metrics.record_heartbeat(if cancel_requested {
                    "cancel_requested"
                } else {
                    "renewed"
                });
                Ok(cancel_requested)
            }
            Err(err) => {
                if err.is_job_not_exist() {
                    self.metrics.record_heartbeat("lost");
                }
                Err(err)
            }
        }
    }

    async fn keep_alive_inner(&self, job: &JobInfo) -> Result<bool> {
        check_property_size("result", &job.result)?;
        let partition_key = job.partition_key();
        let row_key = job.row_key();

        let mut attempts = 0;
        loop {
            let (stored, info_etag) = self.load_job(&partition_key, &row_key, job.id).await?;
            if stored.version != job.version {
                return Err(Error::JobNotExist { job_id: job.id });
            }

            let lock_row_key = job_lock_row_key(&stored.definition);
            let Some(lock_entity) = self.table.get(&partition_key, &lock_row_key).await? else {
                return Err(Error::JobNotExist { job_id: job.id });
            };
            let mut lock = JobLock::from_payload(&lock_entity.payload)?;
            let (Some(message_id), Some(pop_receipt)) =
                (lock.message_id.clone(), lock.pop_receipt.clone())
            else {
                return Err(Error::JobNotExist { job_id: job.id });
            };

            let visibility =
                std::time::Duration::from_secs(u64::from(stored.heartbeat_timeout_sec));
            let new_receipt = match self.queue.extend(&message_id, &pop_receipt, visibility).await {
                Ok(receipt) => receipt,
                Err(
                    stratum_core::Error::MessageNotFound { .. }
                    | stratum_core::Error::ReceiptMismatch { .. },
                ) => return Err(Error::JobNotExist { job_id: job.id }),
                Err(err) => return Err(err.into()),
            };

            let mut updated = stored.clone();
            updated.result = job.result.clone();
            updated.heartbeat_date_time = Utc::now();
            lock.pop_receipt = Some(new_receipt);

            let batch = TransactionBatch::new(&partition_key)
                .update(&row_key, updated.to_payload()?, info_etag)
                .update(&lock_row_key, lock.to_payload()?, lock_entity.etag);
            match self.table.submit(batch).await {
                Ok(_) => return Ok(stored.cancel_requested),
                Err(err) if err.is_precondition_failed() && attempts < CAS_RETRY_LIMIT => {
                    attempts += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Completes the job and deletes its message.
    ///
    /// The final status is Failed if the caller marked the job Failed,
    /// Cancelled if cancellation was requested, Completed otherwise. When
    /// `request_cancellation_on_failure` is set and the job failed, every
    /// other job in the group is cancelled.
    ///
    /// # Errors
    ///
    /// [`Error::JobNotExist`] on version mismatch — a newer lease owns the
    /// job.
    pub async fn complete(
        &self,
        job: &JobInfo,
        request_cancellation_on_failure: bool,
    ) -> Result<()> {
        check_property_size("result", &job.result)?;
        let partition_key = job.partition_key();
        let row_key = job.row_key();

        let mut attempts = 0;
        let final_status = loop {
            let (stored, info_etag) = self.load_job(&partition_key, &row_key, job.id).await?;
            if stored.version != job.version {
                return Err(Error::JobNotExist { job_id: job.id });
            }

            let final_status = if job.status == JobStatus::Failed {
                JobStatus::Failed
            } else if stored.cancel_requested {
                JobStatus::Cancelled
            } else {
                JobStatus::Completed
            };
            if !stored.status.can_transition_to(final_status) {
                return Err(Error::InvalidTransition {
                    from: stored.status.as_str(),
                    to: final_status.as_str(),
                });
            }

            let mut updated = stored;
            updated.status = final_status;
            updated.result = job.result.clone();
            match self
                .table
                .update(&partition_key, &row_key, updated.to_payload()?, &info_etag)
                .await
            {
                Ok(_) => break final_status,
                Err(err) if err.is_precondition_failed() && attempts < CAS_RETRY_LIMIT => {
                    attempts += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        };

        self.delete_job_message(&partition_key, &job.definition)
            .await?;
        self.metrics.record_completion(final_status.as_str());
        debug!(job_id = %job.id, status = %final_status, "job completed");

        if final_status == JobStatus::Failed && request_cancellation_on_failure {
            // The failed job is already terminal, so only siblings change.
            self.cancel_by_group(job.group_id).await?;
        }
        Ok(())
    }

    /// Requests cancellation of every job in a group.
    ///
    /// Created jobs move to Cancelled immediately; Running jobs observe the
    /// flag on their next keep-alive and complete with Cancelled status.
    pub async fn cancel_by_group(&self, group_id: GroupId) -> Result<()> {
        let partition_key = job_partition_key(self.queue_type, group_id);
        let prefix = job_info_row_prefix(group_id);
        let entities = self.table.query_prefix(&partition_key, &prefix).await?;
        for entity in entities {
            self.apply_cancel(&partition_key, entity).await?;
        }
        Ok(())
    }

    /// Requests cancellation of a single job by id.
    ///
    /// # Errors
    ///
    /// [`Error::JobNotExist`] if the id is unknown.
    pub async fn cancel_by_id(&self, id: JobId) -> Result<()> {
        let Some((partition_key, entity)) = self.lookup_by_id(id).await? else {
            return Err(Error::JobNotExist { job_id: id });
        };
        self.apply_cancel(&partition_key, entity).await
    }

    /// Fetches a job by id through the reverse index.
    pub async fn get_job_by_id(&self, id: JobId) -> Result<Option<JobInfo>> {
        let Some((_, entity)) = self.lookup_by_id(id).await? else {
            return Ok(None);
        };
        Ok(Some(JobInfo::from_payload(&entity.payload)?))
    }

    /// Returns the approximate depth of the underlying message queue.
    pub async fn approximate_depth(&self) -> Result<usize> {
        Ok(self.queue.approximate_depth().await?)
    }

    // --- enqueue steps ---

    async fn insert_jobs_and_locks(
        &self,
        partition_key: &str,
        definitions: &[Bytes],
        lock_row_keys: &[String],
        group_id: GroupId,
    ) -> Result<Vec<JobInfo>> {
        let ids = self.allocate_ids(definitions.len() as u64).await?;
        let jobs: Vec<JobInfo> = definitions
            .iter()
            .zip(&ids)
            .map(|(definition, &id)| {
                JobInfo::new(self.queue_type, group_id, id, definition.clone())
            })
            .collect();

        let mut batch = TransactionBatch::new(partition_key);
        for (job, lock_row_key) in jobs.iter().zip(lock_row_keys) {
            let lock = JobLock::new(job.row_key());
            batch = batch
                .insert(job.row_key(), job.to_payload()?)
                .insert(lock_row_key, lock.to_payload()?);
        }
        match self.table.submit(batch).await {
            Ok(_) => {
                for _ in &jobs {
                    self.metrics.record_enqueue("created");
                }
                Ok(jobs)
            }
            Err(err) if err.is_entity_exists() => {
                // At least one lock already exists; converge on the stored
                // jobs definition by definition. The freshly allocated ids
                // for existing definitions are abandoned, never reused.
                self.resume_enqueue(partition_key, definitions, lock_row_keys, group_id)
                    .await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn resume_enqueue(
        &self,
        partition_key: &str,
        definitions: &[Bytes],
        lock_row_keys: &[String],
        group_id: GroupId,
    ) -> Result<Vec<JobInfo>> {
        let mut jobs = Vec::with_capacity(definitions.len());
        for (definition, lock_row_key) in definitions.iter().zip(lock_row_keys) {
            let mut attempts = 0;
            let job = loop {
                if let Some(lock_entity) = self.table.get(partition_key, lock_row_key).await? {
                    let lock = JobLock::from_payload(&lock_entity.payload)?;
                    let Some(info_entity) = self
                        .table
                        .get(partition_key, &lock.job_info_row_key)
                        .await?
                    else {
                        return Err(Error::retriable(format!(
                            "job lock {lock_row_key} references missing job info"
                        )));
                    };
                    self.metrics.record_enqueue("deduplicated");
                    break JobInfo::from_payload(&info_entity.payload)?;
                }

                let ids = self.allocate_ids(1).await?;
                let job = JobInfo::new(self.queue_type, group_id, ids[0], definition.clone());
                let lock = JobLock::new(job.row_key());
                let batch = TransactionBatch::new(partition_key)
                    .insert(job.row_key(), job.to_payload()?)
                    .insert(lock_row_key, lock.to_payload()?);
                match self.table.submit(batch).await {
                    Ok(_) => {
                        self.metrics.record_enqueue("created");
                        break job;
                    }
                    Err(err) if err.is_entity_exists() && attempts < CAS_RETRY_LIMIT => {
                        attempts += 1;
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                }
            };
            jobs.push(job);
        }
        Ok(jobs)
    }

    async fn insert_reverse_indices(&self, partition_key: &str, jobs: &[JobInfo]) -> Result<()> {
        let index_partition = reverse_index_partition_key(self.queue_type);
        let mut batch = TransactionBatch::new(&index_partition);
        for job in jobs {
            let index = JobReverseIndex {
                job_info_partition_key: partition_key.to_string(),
                job_info_row_key: job.row_key(),
            };
            batch = batch.insert(job.id.key_encoded(), index.to_payload()?);
        }
        match self.table.submit(batch).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_entity_exists() => {
                // The batch is atomic, so fall back to per-row inserts and
                // swallow the rows that already exist.
                for job in jobs {
                    let index = JobReverseIndex {
                        job_info_partition_key: partition_key.to_string(),
                        job_info_row_key: job.row_key(),
                    };
                    match self
                        .table
                        .insert(&index_partition, &job.id.key_encoded(), index.to_payload()?)
                        .await
                    {
                        Ok(_) => {}
                        Err(err) if err.is_entity_exists() => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn dispatch_messages(
        &self,
        partition_key: &str,
        jobs: &[JobInfo],
        lock_row_keys: &[String],
    ) -> Result<()> {
        for (job, lock_row_key) in jobs.iter().zip(lock_row_keys) {
            let Some(lock_entity) = self.table.get(partition_key, lock_row_key).await? else {
                return Err(Error::retriable(format!(
                    "job lock {lock_row_key} disappeared during enqueue"
                )));
            };
            let mut lock = JobLock::from_payload(&lock_entity.payload)?;
            if lock.message_id.is_some() {
                continue;
            }

            let sent = self.queue.send(JobMessage::new(
                partition_key,
                lock.job_info_row_key.clone(),
                lock_row_key.clone(),
            )
            .to_body()?)
            .await?;
            lock.message_id = Some(sent.message_id);
            lock.pop_receipt = Some(sent.pop_receipt);

            match self
                .table
                .update(
                    partition_key,
                    lock_row_key,
                    lock.to_payload()?,
                    &lock_entity.etag,
                )
                .await
            {
                Ok(_) => {}
                // Another agent recorded its message first; ours becomes a
                // stale message that dequeue discards on sight.
                Err(err) if err.is_precondition_failed() => {
                    debug!(job_id = %job.id, "another agent recorded the job message first");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn allocate_ids(&self, count: u64) -> Result<Vec<JobId>> {
        let partition_key = counter_partition_key(self.queue_type);
        let mut attempts = 0;
        loop {
            let first = match self.table.get(&partition_key, COUNTER_ROW_KEY).await? {
                None => {
                    let counter = JobIdCounter { next_job_id: count };
                    match self
                        .table
                        .insert(&partition_key, COUNTER_ROW_KEY, counter.to_payload()?)
                        .await
                    {
                        Ok(_) => 1,
                        Err(err) if err.is_entity_exists() => {
                            if attempts >= CAS_RETRY_LIMIT {
                                return Err(Error::retriable("job id counter contended"));
                            }
                            attempts += 1;
                            continue;
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                Some(entity) => {
                    let counter = JobIdCounter::from_payload(&entity.payload)?;
                    let updated = JobIdCounter {
                        next_job_id: counter.next_job_id + count,
                    };
                    match self
                        .table
                        .update(
                            &partition_key,
                            COUNTER_ROW_KEY,
                            updated.to_payload()?,
                            &entity.etag,
                        )
                        .await
                    {
                        Ok(_) => counter.next_job_id + 1,
                        Err(err) if err.is_precondition_failed() => {
                            if attempts >= CAS_RETRY_LIMIT {
                                return Err(Error::retriable("job id counter contended"));
                            }
                            attempts += 1;
                            continue;
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            };
            return Ok((first..first + count).map(JobId::new).collect());
        }
    }

    // --- shared helpers ---

    async fn load_job(
        &self,
        partition_key: &str,
        row_key: &str,
        id: JobId,
    ) -> Result<(JobInfo, stratum_core::Etag)> {
        let Some(entity) = self.table.get(partition_key, row_key).await? else {
            return Err(Error::JobNotExist { job_id: id });
        };
        let job = JobInfo::from_payload(&entity.payload)?;
        Ok((job, entity.etag))
    }

    async fn lookup_by_id(&self, id: JobId) -> Result<Option<(String, TableEntity)>> {
        let index_partition = reverse_index_partition_key(self.queue_type);
        let Some(index_entity) = self.table.get(&index_partition, &id.key_encoded()).await? else {
            return Ok(None);
        };
        let index = JobReverseIndex::from_payload(&index_entity.payload)?;
        let Some(entity) = self
            .table
            .get(&index.job_info_partition_key, &index.job_info_row_key)
            .await?
        else {
            return Ok(None);
        };
        Ok(Some((index.job_info_partition_key, entity)))
    }

    async fn apply_cancel(&self, partition_key: &str, entity: TableEntity) -> Result<()> {
        let mut entity = entity;
        let mut attempts = 0;
        loop {
            let mut job = JobInfo::from_payload(&entity.payload)?;
            if job.is_terminal() {
                return Ok(());
            }
            job.cancel_requested = true;
            if job.status == JobStatus::Created {
                job.status = JobStatus::Cancelled;
            }
            match self
                .table
                .update(partition_key, &entity.row_key, job.to_payload()?, &entity.etag)
                .await
            {
                Ok(_) => return Ok(()),
                Err(err) if err.is_precondition_failed() && attempts < CAS_RETRY_LIMIT => {
                    attempts += 1;
                    let Some(fresh) = self.table.get(partition_key, &entity.row_key).await? else {
                        return Ok(());
                    };
                    entity = fresh;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn delete_job_message(&self, partition_key: &str, definition: &Bytes) -> Result<()> {
        let lock_row_key = job_lock_row_key(definition);
        let Some(lock_entity) = self.table.get(partition_key, &lock_row_key).await? else {
            return Ok(());
        };
        let lock = JobLock::from_payload(&lock_entity.payload)?;
        let (Some(message_id), Some(pop_receipt)) = (lock.message_id, lock.pop_receipt) else {
            return Ok(());
        };
        match self.queue.delete(&message_id, &pop_receipt).await {
            Ok(()) => Ok(()),
            // The message is already gone or re-leased; a later dequeue will
            // see the terminal status and discard it.
            Err(
                stratum_core::Error::MessageNotFound { .. }
                | stratum_core::Error::ReceiptMismatch { .. },
            ) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn check_property_size(property: &'static str, value: &Bytes) -> Result<()> {
    if value.len() > MAX_PROPERTY_SIZE {
        return Err(Error::PropertyTooLarge {
            property,
            size: value.len(),
            limit: MAX_PROPERTY_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::prelude::{MemoryQueue, MemoryTable};

    fn client() -> JobQueue<MemoryTable, MemoryQueue> {
        JobQueue::new(
            Arc::new(MemoryTable::new()),
            Arc::new(MemoryQueue::new()),
            QueueType::new(1),
        )
    }

    fn defs(texts: &[&str]) -> Vec<Bytes> {
        texts.iter().map(|t| Bytes::from(t.to_string())).collect()
    }

    #[tokio::test]
    async fn allocate_ids_are_contiguous_and_monotone() -> Result<()> {
        let queue = client();
        let first = queue.allocate_ids(3).await?;
        let second = queue.allocate_ids(2).await?;

        assert_eq!(first, vec![JobId::new(1), JobId::new(2), JobId::new(3)]);
        assert_eq!(second, vec![JobId::new(4), JobId::new(5)]);
        Ok(())
    }

    #[tokio::test]
    async fn enqueue_rejects_empty_and_oversized_calls() {
        let queue = client();
        let err = queue.enqueue(&[], GroupId::new(1)).await.unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));

        let many: Vec<Bytes> = (0..=MAX_ENQUEUE_DEFINITIONS)
            .map(|i| Bytes::from(format!("d{i}")))
            .collect();
        let err = queue.enqueue(&many, GroupId::new(1)).await.unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn enqueue_rejects_intra_call_duplicates() {
        let queue = client();
        let err = queue
            .enqueue(&defs(&["same", "same"]), GroupId::new(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateDefinition { .. }));
    }

    #[tokio::test]
    async fn enqueue_rejects_oversized_definition() {
        let queue = client();
        let big = vec![Bytes::from(vec![b'x'; MAX_PROPERTY_SIZE + 1])];
        let err = queue.enqueue(&big, GroupId::new(1)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::PropertyTooLarge {
                property: "definition",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn discard_reason_labels() {
        assert_eq!(DiscardReason::Malformed.as_str(), "malformed");
        assert_eq!(DiscardReason::Stale.as_str(), "stale");
    }
}
