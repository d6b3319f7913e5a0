//! The orchestrator job.
//!
//! One orchestrator drives one trigger window. It produces processing
//! sub-jobs — from the splitter for system scope, from patient chunks for
//! group scope — keeps a bounded in-flight pool, and folds completed child
//! results into its aggregate.
//!
//! The aggregate result doubles as the progress record: it is reported to
//! the host after every state change, so a re-leased orchestrator resumes
//! from `submitted_resource_timestamps` (system scope) or
//! `next_patient_index` (group scope) and re-polls `running_job_ids`.
//! Child creation stays at-most-once across resumes because re-enqueueing
//! the same definition returns the existing child and the bookkeeping only
//! counts ids not already in the pool.
//!
//! A Failed child surfaces as a retriable error so the host re-leases the
//! orchestrator; a Cancelled child propagates cancellation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use stratum_core::{JobId, MessageQueue, TableStore};

use crate::config::{FilterScope, PipelineConfig};
use crate::error::{Error, Result};
use crate::host::{JobHandler, JobProgress};
use crate::job::JobInfo;
use crate::metadata::MetadataStore;
use crate::metrics::PipelineMetrics;
use crate::queue_client::JobQueue;
use crate::sink::ResultSink;
use crate::source::{PatientMember, PatientSource, SearchSource, TimeRange};
use crate::splitter::TimeRangeSplitter;

/// Discriminates the two definition shapes sharing one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// An orchestrator driving one trigger window.
    Orchestrator,
    /// A processing job extracting one sub-job slice.
    Processing,
}

/// Reads the job type tag out of a definition without parsing the rest.
///
/// # Errors
///
/// Returns [`Error::MalformedPayload`] when the definition carries no tag.
pub fn job_type_of(definition: &[u8]) -> Result<JobType> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Tagged {
        job_type: JobType,
    }
    let tagged: Tagged = serde_json::from_slice(definition).map_err(Error::malformed)?;
    Ok(tagged.job_type)
}

/// Definition of an orchestrator job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorJobInputData {
    /// Definition discriminator; always [`JobType::Orchestrator`].
    pub job_type: JobType,
    /// Sequence number of the trigger window.
    pub trigger_sequence_id: u64,
    /// Inclusive window start; `None` means the beginning of time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_start_time: Option<DateTime<Utc>>,
    /// Exclusive window end.
    pub data_end_time: DateTime<Utc>,
    /// Incremental floor passed through to processing jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    /// Definition format version.
    pub job_version: u32,
}

impl OrchestratorJobInputData {
    /// Returns the effective window start, flooring `None` at the epoch.
    #[must_use]
    pub fn window_start(&self) -> DateTime<Utc> {
        self.data_start_time.unwrap_or(DateTime::UNIX_EPOCH)
    }
}

/// Definition of a processing job created by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingJobInputData {
    /// Definition discriminator; always [`JobType::Processing`].
    pub job_type: JobType,
    /// Position of this job in the orchestrator's creation order.
    pub processing_job_sequence_id: u64,
    /// The trigger window this job belongs to.
    pub trigger_sequence_id: u64,
    /// Resource type to extract (system scope).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    /// Time slice to extract (system scope).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    /// Patient chunk to extract (group scope).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patients: Vec<PatientMember>,
    /// Incremental floor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    /// Definition format version.
    pub job_version: u32,
}

/// Result reported by a completed processing job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingJobResult {
    /// Resources landed, per type.
    #[serde(default)]
    pub processed_resource_counts: BTreeMap<String, u64>,
    /// Resources skipped (already current), per type.
    #[serde(default)]
    pub skipped_resource_counts: BTreeMap<String, u64>,
    /// Total resources landed.
    #[serde(default)]
    pub processed_count_in_total: u64,
    /// Total bytes landed.
    #[serde(default)]
    pub processed_data_size_in_total: u64,
    /// Patient versions observed while processing (group scope).
    #[serde(default)]
    pub processed_patient_versions: BTreeMap<String, u64>,
}

/// The orchestrator's aggregate result and progress record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorJobResult {
    /// Children created so far; also the next processing sequence id.
    #[serde(default)]
    pub created_job_count: u64,
    /// Children currently in flight.
    #[serde(default)]
    pub running_job_ids: BTreeSet<JobId>,
    /// Resume point for group scope: patients fully submitted.
    #[serde(default)]
    pub next_patient_index: usize,
    /// Upstream count observed per resource type when submitting.
    #[serde(default)]
    pub total_resource_counts: BTreeMap<String, u64>,
    /// Resources landed by completed children, per type.
    #[serde(default)]
    pub processed_resource_counts: BTreeMap<String, u64>,
    /// Resources skipped by completed children, per type.
    #[serde(default)]
    pub skipped_resource_counts: BTreeMap<String, u64>,
    /// Total resources landed.
    #[serde(default)]
    pub processed_count_in_total: u64,
    /// Total bytes landed.
    #[serde(default)]
    pub processed_data_size_in_total: u64,
    /// When the orchestrator finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complete_time: Option<DateTime<Utc>>,
    /// Resume point for system scope: the exclusive upper bound already
    /// enqueued, per resource type.
    #[serde(default)]
    pub submitted_resource_timestamps: BTreeMap<String, DateTime<Utc>>,
}

impl OrchestratorJobResult {
    /// Parses a stored progress snapshot, starting fresh when none exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedPayload`] for a corrupt snapshot.
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self> {
        if snapshot.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(snapshot).map_err(Error::malformed)
    }

    fn absorb(&mut self, child: &ProcessingJobResult) {
        for (resource_type, count) in &child.processed_resource_counts {
            *self
                .processed_resource_counts
                .entry(resource_type.clone())
                .or_default() += count;
        }
        for (resource_type, count) in &child.skipped_resource_counts {
            *self
                .skipped_resource_counts
                .entry(resource_type.clone())
                .or_default() += count;
        }
        self.processed_count_in_total += child.processed_count_in_total;
        self.processed_data_size_in_total += child.processed_data_size_in_total;
    }
}

/// The orchestrator handler.
///
/// All capabilities are injected; the orchestrator owns no global state and
/// its pool bookkeeping lives entirely in the progress record.
pub struct OrchestratorJob<T: TableStore + ?Sized + 'static, Q: MessageQueue + ?Sized + 'static> {
    queue: JobQueue<T, Q>,
    metadata: MetadataStore<T>,
    source: Arc<dyn SearchSource>,
    patients: Option<Arc<dyn PatientSource>>,
    sink: Arc<dyn ResultSink>,
    config: PipelineConfig,
    metrics: PipelineMetrics,
}

impl<T: TableStore + ?Sized + 'static, Q: MessageQueue + ?Sized + 'static> OrchestratorJob<T, Q> {
    /// Creates an orchestrator over the injected capabilities.
    pub fn new(
        queue: JobQueue<T, Q>,
        metadata: MetadataStore<T>,
        source: Arc<dyn SearchSource>,
        patients: Option<Arc<dyn PatientSource>>,
        sink: Arc<dyn ResultSink>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            queue,
            metadata,
            source,
            patients,
            sink,
            config,
            metrics: PipelineMetrics::new(),
        }
    }

    fn persist(state: &OrchestratorJobResult, progress: &JobProgress) -> Result<Bytes> {
        let snapshot = Bytes::from(serde_json::to_vec(state)?);
        progress.report(snapshot.clone());
        Ok(snapshot)
    }

    /// Polls every in-flight child once, folding terminal results into the
    /// aggregate.
    async fn poll_children(
        &self,
        state: &mut OrchestratorJobResult,
        progress: &JobProgress,
    ) -> Result<()> {
        let ids: Vec<JobId> = state.running_job_ids.iter().copied().collect();
        for id in ids {
            let Some(child) = self.queue.get_job_by_id(id).await? else {
                return Err(Error::retriable(format!("child job {id} has no record")));
            };
            match child.status {
                crate::job::JobStatus::Completed => {
                    let result = if child.result.is_empty() {
                        ProcessingJobResult::default()
                    } else {
                        serde_json::from_slice(&child.result).map_err(Error::malformed)?
                    };
                    state.absorb(&result);
                    self.sink.commit(id).await?;
                    if matches!(self.config.filter_scope, FilterScope::Group { .. })
                        && !result.processed_patient_versions.is_empty()
                    {
                        self.metadata
                            .upsert_patient_versions(&result.processed_patient_versions)
                            .await?;
                    }
                    state.running_job_ids.remove(&id);
                    self.metrics.set_children_in_flight(state.running_job_ids.len());
                    Self::persist(state, progress)?;
                    debug!(child_id = %id, "child completed and folded");
                }
                crate::job::JobStatus::Failed => {
                    return Err(Error::retriable(format!("processing job {id} failed")));
                }
                crate::job::JobStatus::Cancelled => {
                    return Err(Error::Cancelled);
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn wait_tick(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            () = tokio::time::sleep(self.config.check_frequency) => Ok(()),
        }
    }

    /// Blocks until the pool has a free slot.
    async fn ensure_capacity(
        &self,
        state: &mut OrchestratorJobResult,
        progress: &JobProgress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        while state.running_job_ids.len() >= self.config.max_in_flight {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.poll_children(state, progress).await?;
            if state.running_job_ids.len() < self.config.max_in_flight {
                break;
            }
            self.wait_tick(cancel).await?;
        }
        Ok(())
    }

    /// Enqueues one child and updates the pool bookkeeping.
    ///
    /// The queue may return an existing child for a replayed definition; the
    /// count only advances for ids new to the pool.
    async fn submit_child(
        &self,
        job: &JobInfo,
        state: &mut OrchestratorJobResult,
        definition: &ProcessingJobInputData,
    ) -> Result<JobId> {
        let payload = Bytes::from(serde_json::to_vec(definition)?);
        let children = self.queue.enqueue(&[payload], job.group_id).await?;
        let child_id = children[0].id;
        if state.running_job_ids.insert(child_id) {
            state.created_job_count += 1;
        }
        self.metrics.set_children_in_flight(state.running_job_ids.len());
        Ok(child_id)
    }

    async fn run_system(
        &self,
        job: &JobInfo,
        input: &OrchestratorJobInputData,
        state: &mut OrchestratorJobResult,
        progress: &JobProgress,
        cancel: &CancellationToken,
        resource_types: &[String],
    ) -> Result<()> {
        let bounds = self.config.split_bounds()?;
        let window_start = input.window_start();
        let window_end = input.data_end_time;
        let poll_watermark = self.config.max_in_flight.div_ceil(2);

        for resource_type in resource_types {
            let start = state
                .submitted_resource_timestamps
                .get(resource_type)
                .copied()
                .unwrap_or(window_start)
                .max(window_start);
            if start >= window_end {
                continue;
            }

            let range = TimeRange::new(start, window_end);
            let mut splitter =
                TimeRangeSplitter::new(self.source.as_ref(), resource_type.clone(), range, bounds);
            while let Some(sub_job) = splitter.next().await? {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                self.ensure_capacity(state, progress, cancel).await?;

                let definition = ProcessingJobInputData {
                    job_type: JobType::Processing,
                    processing_job_sequence_id: state.created_job_count,
                    trigger_sequence_id: input.trigger_sequence_id,
                    resource_type: Some(resource_type.clone()),
                    time_range: Some(sub_job.range),
                    patients: Vec::new(),
                    since: input.since,
                    job_version: input.job_version,
                };
                let child_id = self.submit_child(job, state, &definition).await?;
                *state
                    .total_resource_counts
                    .entry(resource_type.clone())
                    .or_default() += sub_job.expected_size;
                state
                    .submitted_resource_timestamps
                    .insert(resource_type.clone(), sub_job.range.end);
                Self::persist(state, progress)?;
                debug!(
                    child_id = %child_id,
                    resource_type = %resource_type,
                    range = %sub_job.range,
                    expected = sub_job.expected_size,
                    "processing job submitted"
                );

                if state.running_job_ids.len() >= poll_watermark {
                    self.poll_children(state, progress).await?;
                }
            }
        }
        Ok(())
    }

    async fn run_group(
        &self,
        job: &JobInfo,
        input: &OrchestratorJobInputData,
        state: &mut OrchestratorJobResult,
        progress: &JobProgress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(patient_source) = &self.patients else {
            return Err(Error::Configuration {
                message: "group scope requires a patient source".into(),
            });
        };
        let patient_ids = patient_source.group_patients().await?;
        let chunk_size = self.config.number_of_patients_per_processing_job;
        let poll_watermark = self.config.max_in_flight.div_ceil(2);

        let mut position = 0;
        for chunk in patient_ids.chunks(chunk_size) {
            let chunk_start = position;
            position += chunk.len();
            if chunk_start < state.next_patient_index {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.ensure_capacity(state, progress, cancel).await?;

            let known_versions = self.metadata.get_patient_versions(chunk).await?;
            let members: Vec<PatientMember> = chunk
                .iter()
                .map(|patient_id| PatientMember {
                    patient_id: patient_id.clone(),
                    version_id: known_versions.get(patient_id).copied(),
                })
                .collect();

            let definition = ProcessingJobInputData {
                job_type: JobType::Processing,
                processing_job_sequence_id: state.created_job_count,
                trigger_sequence_id: input.trigger_sequence_id,
                resource_type: None,
                time_range: None,
                patients: members,
                since: input.since,
                job_version: input.job_version,
            };
            let child_id = self.submit_child(job, state, &definition).await?;
            state.next_patient_index = position;
            Self::persist(state, progress)?;
            debug!(child_id = %child_id, patients = chunk.len(), "patient chunk submitted");

            if state.running_job_ids.len() >= poll_watermark {
                self.poll_children(state, progress).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<T: TableStore + ?Sized + 'static, Q: MessageQueue + ?Sized + 'static> JobHandler
    for OrchestratorJob<T, Q>
{
    async fn execute(
        &self,
        job: &JobInfo,
        progress: &JobProgress,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let input: OrchestratorJobInputData =
            serde_json::from_slice(&job.definition).map_err(Error::malformed)?;
        let mut state = OrchestratorJobResult::from_snapshot(&job.result)?;

        info!(
            job_id = %job.id,
            trigger_sequence = input.trigger_sequence_id,
            resumed_children = state.running_job_ids.len(),
            created_so_far = state.created_job_count,
            "orchestrator starting"
        );

        match self.config.filter_scope.clone() {
            FilterScope::System { resource_types } => {
                self.run_system(job, &input, &mut state, progress, cancel, &resource_types)
                    .await?;
            }
            FilterScope::Group { .. } => {
                self.run_group(job, &input, &mut state, progress, cancel)
                    .await?;
            }
        }

        // Drain the pool.
        loop {
            self.poll_children(&mut state, progress).await?;
            if state.running_job_ids.is_empty() {
                break;
            }
            self.wait_tick(cancel).await?;
        }

        state.complete_time = Some(Utc::now());
        let snapshot = Self::persist(&state, progress)?;
        info!(
            job_id = %job.id,
            trigger_sequence = input.trigger_sequence_id,
            created = state.created_job_count,
            processed = state.processed_count_in_total,
            "orchestrator finished"
        );
        Ok(snapshot)
    }
}
