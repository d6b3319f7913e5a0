//! Observability metrics for the job pipeline.
//!
//! Prometheus-compatible metrics exposed through the `metrics` crate facade.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `stratum_jobs_enqueued_total` | Counter | `outcome` | Enqueue calls by outcome |
//! | `stratum_dequeue_outcomes_total` | Counter | `outcome` | Dequeue attempts by outcome |
//! | `stratum_jobs_completed_total` | Counter | `status` | Terminal statuses written |
//! | `stratum_heartbeats_total` | Counter | `outcome` | Keep-alive calls by outcome |
//! | `stratum_split_queries_total` | Counter | `kind` | Upstream count/boundary probes |
//! | `stratum_children_in_flight` | Gauge | - | Orchestrator pool size |
//! | `stratum_scheduler_tick_duration_seconds` | Histogram | - | Scheduler tick time |

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: enqueue calls by outcome.
    pub const JOBS_ENQUEUED_TOTAL: &str = "stratum_jobs_enqueued_total";
    /// Counter: dequeue attempts by outcome.
    pub const DEQUEUE_OUTCOMES_TOTAL: &str = "stratum_dequeue_outcomes_total";
    /// Counter: terminal statuses written.
    pub const JOBS_COMPLETED_TOTAL: &str = "stratum_jobs_completed_total";
    /// Counter: keep-alive calls by outcome.
    pub const HEARTBEATS_TOTAL: &str = "stratum_heartbeats_total";
    /// Counter: upstream probes issued by the splitter.
    pub const SPLIT_QUERIES_TOTAL: &str = "stratum_split_queries_total";
    /// Gauge: orchestrator children in flight.
    pub const CHILDREN_IN_FLIGHT: &str = "stratum_children_in_flight";
    /// Histogram: scheduler tick processing time in seconds.
    pub const SCHEDULER_TICK_DURATION_SECONDS: &str = "stratum_scheduler_tick_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Operation outcome (leased, empty, discarded, ...).
    pub const OUTCOME: &str = "outcome";
    /// Terminal job status.
    pub const STATUS: &str = "status";
    /// Probe kind (count, boundary).
    pub const KIND: &str = "kind";
}

/// High-level interface for recording pipeline metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics;

impl PipelineMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records an enqueue outcome (`created` or `deduplicated`).
    pub fn record_enqueue(&self, outcome: &str) {
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Records a dequeue outcome.
    pub fn record_dequeue(&self, outcome: &str) {
        counter!(
            names::DEQUEUE_OUTCOMES_TOTAL,
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Records a terminal status write.
    pub fn record_completion(&self, status: &str) {
        counter!(
            names::JOBS_COMPLETED_TOTAL,
            labels::STATUS => status.to_string(),
        )
        .increment(1);
    }

    /// Records a keep-alive outcome (`renewed`, `cancel_requested`, `lost`).
    pub fn record_heartbeat(&self, outcome: &str) {
        counter!(
            names::HEARTBEATS_TOTAL,
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Records an upstream probe issued by the splitter.
    pub fn record_split_query(&self, kind: &str) {
        counter!(
            names::SPLIT_QUERIES_TOTAL,
            labels::KIND => kind.to_string(),
        )
        .increment(1);
    }

    /// Updates the orchestrator pool gauge.
    #[allow(clippy::cast_precision_loss)] // Pool sizes are small
    pub fn set_children_in_flight(&self, count: usize) {
        gauge!(names::CHILDREN_IN_FLIGHT).set(count as f64);
    }

    /// Records scheduler tick duration.
    pub fn observe_scheduler_tick(&self, duration: Duration) {
        histogram!(names::SCHEDULER_TICK_DURATION_SECONDS).record(duration.as_secs_f64());
    }
}

/// RAII guard for timing operations.
///
/// Automatically records duration when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a guard that calls `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard for scheduler tick metrics.
#[must_use]
pub fn time_scheduler_tick() -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(|duration| {
        histogram!(names::SCHEDULER_TICK_DURATION_SECONDS).record(duration.as_secs_f64());
    })
}
