//! # stratum-flow
//!
//! The job-management substrate of the Stratum extraction pipeline.
//!
//! This crate implements the durable machinery that lets many agent
//! instances extract clinical records concurrently without leaking or
//! duplicating a single time window:
//!
//! - **Job queue** ([`queue_client::JobQueue`]): enqueue / dequeue /
//!   keep-alive / complete / cancel over a table and a visibility-timeout
//!   queue, idempotent across multi-writer agents and arbitrary crash points
//! - **Job host** ([`host::JobHost`]): the generic worker loop with
//!   heartbeat leases and cooperative cancellation
//! - **Scheduler** ([`scheduler::SchedulerService`]): the single-leader
//!   sliding-window clock that creates orchestrator jobs
//! - **Splitter** ([`splitter::TimeRangeSplitter`]): counted binary search
//!   sizing sub-jobs between configurable bounds
//! - **Orchestrator** ([`orchestrator::OrchestratorJob`]): drives the
//!   splitter stream through a bounded pool of processing jobs and
//!   aggregates their results
//! - **Metadata store** ([`metadata::MetadataStore`]): trigger lease, window
//!   cursor, and per-patient versions
//!
//! ## Guarantees
//!
//! - **Exactly-once windows**: every trigger window is processed by exactly
//!   one orchestrator lineage; duplicate enqueue converges on one job
//! - **At-least-once children** with idempotent commit by job id
//! - **Crash-resumable**: all progress lives in the table; a re-leased job
//!   resumes from its persisted result
//!
//! The upstream API client, the columnar writer, and the processing job
//! body are external collaborators behind the [`source`], [`sink`], and
//! [`host`] seams.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod host;
pub mod job;
pub mod metadata;
pub mod metrics;
pub mod orchestrator;
pub mod queue_client;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod splitter;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{FilterScope, PipelineConfig};
    pub use crate::error::{Error, Result};
    pub use crate::host::{HostOptions, JobHandler, JobHandlerFactory, JobHost, JobProgress};
    pub use crate::job::{JobInfo, JobStatus};
    pub use crate::metadata::{CurrentTrigger, MetadataStore, TriggerStatus};
    pub use crate::metrics::PipelineMetrics;
    pub use crate::orchestrator::{
        JobType, OrchestratorJob, OrchestratorJobInputData, OrchestratorJobResult,
        ProcessingJobInputData, ProcessingJobResult,
    };
    pub use crate::queue_client::{DequeueOutcome, DiscardReason, JobQueue};
    pub use crate::scheduler::{SchedulerOptions, SchedulerService};
    pub use crate::sink::{MemorySink, ResultSink};
    pub use crate::source::{
        MemorySearchSource, PatientSource, ResourceCount, SearchSource, TimeRange,
    };
    pub use crate::splitter::{SplitBounds, SubJob, TimeRangeSplitter};
}
