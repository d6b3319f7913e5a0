//! The processing-job splitter.
//!
//! Given a resource type and a time window, the splitter yields a lazy,
//! finite sequence of sub-jobs whose expected sizes fall in `[low, high)`
//! whenever feasible. It keeps an **anchor map** of
//! `timestamp → cumulative count` points and sizes each sub-job by counted
//! binary search against the upstream:
//!
//! 1. One summary count over the whole window; small windows yield a single
//!    sub-job, empty windows yield nothing.
//! 2. The map is seeded with the window bounds and the first/last record
//!    timestamps (two one-record sorted probes).
//! 3. The walk skips anchors closer than `low` to the cursor, accepts
//!    anchors inside the band, and bisects oversized gaps down to
//!    millisecond resolution, inserting every probed midpoint back into the
//!    map.
//!
//! The yielded ranges are contiguous, non-overlapping half-open ranges whose
//! union equals the input window. Saturated upstream counts behave as +∞ and
//! are driven down by bisection.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{Error, Result};
use crate::metrics::PipelineMetrics;
use crate::source::{SearchSource, SortOrder, TimeRange};

/// Default lower bound on sub-job size.
pub const DEFAULT_LOW_BOUND: u64 = 20_000;

/// Default upper bound on sub-job size.
pub const DEFAULT_HIGH_BOUND: u64 = 40_000;

/// The `[low, high)` sizing band for sub-jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitBounds {
    /// Minimum desired resources per sub-job.
    pub low: u64,
    /// Exclusive maximum desired resources per sub-job.
    pub high: u64,
}

impl Default for SplitBounds {
    fn default() -> Self {
        Self {
            low: DEFAULT_LOW_BOUND,
            high: DEFAULT_HIGH_BOUND,
        }
    }
}

impl SplitBounds {
    /// Creates a band after validating `0 < low < high`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an inverted or zero band.
    pub fn new(low: u64, high: u64) -> Result<Self> {
        if low == 0 || low >= high {
            return Err(Error::Configuration {
                message: format!("split bounds must satisfy 0 < low < high, got [{low}, {high})"),
            });
        }
        Ok(Self { low, high })
    }

    /// Returns true if `size` falls inside the band.
    #[must_use]
    pub const fn accepts(&self, size: u64) -> bool {
        size >= self.low && size < self.high
    }
}

/// One slice of the extraction window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubJob {
    /// The half-open time range to process.
    pub range: TimeRange,
    /// The upstream count observed for the range (an estimate; the
    /// processing job re-reads the actual records).
    pub expected_size: u64,
}

enum SplitterState {
    Unprimed,
    Walking {
        anchors: BTreeMap<DateTime<Utc>, u64>,
        cursor_ts: DateTime<Utc>,
        cursor_count: u64,
    },
    Done,
}

/// Lazy sub-job stream over one resource type and window.
///
/// The splitter borrows the upstream capability; it owns no queue state.
/// Callers pull sub-jobs one at a time with [`Self::next`] and may suspend
/// arbitrarily long between pulls.
pub struct TimeRangeSplitter<'a, S: SearchSource + ?Sized> {
    source: &'a S,
    resource_type: String,
    range: TimeRange,
    bounds: SplitBounds,
    state: SplitterState,
    metrics: PipelineMetrics,
}

impl<'a, S: SearchSource + ?Sized> TimeRangeSplitter<'a, S> {
    /// Creates a splitter over `[range.start, range.end)`.
    pub fn new(
        source: &'a S,
        resource_type: impl Into<String>,
        range: TimeRange,
        bounds: SplitBounds,
    ) -> Self {
        Self {
            source,
            resource_type: resource_type.into(),
            range,
            bounds,
            state: SplitterState::Unprimed,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Pulls the next sub-job, or `None` when the window is exhausted.
    ///
    /// # Errors
    ///
    /// Surfaces upstream failures; the stream may be re-pulled after a
    /// transient error.
    pub async fn next(&mut self) -> Result<Option<SubJob>> {
        if matches!(self.state, SplitterState::Unprimed) {
            // Priming may yield the single-sub-job fast path directly.
            if let Some(sub_job) = self.prime().await? {
                return Ok(Some(sub_job));
            }
        }
        match self.state {
            SplitterState::Walking { .. } => self.walk().await,
            _ => Ok(None),
        }
    }

    /// Runs the initial whole-window count and seeds the anchor map.
    ///
    /// Returns the single sub-job directly for small windows.
    async fn prime(&mut self) -> Result<Option<SubJob>> {
        if self.range.is_empty() {
            self.state = SplitterState::Done;
            return Ok(None);
        }

        self.metrics.record_split_query("count");
        let total = self
            .source
            .count(&self.resource_type, self.range)
            .await?;
        debug!(
            resource_type = %self.resource_type,
            range = %self.range,
            total = total.value(),
            "primed splitter window"
        );

        if total.value() == 0 {
            self.state = SplitterState::Done;
            return Ok(None);
        }
        if !total.is_saturated() && total.value() < self.bounds.high {
            self.state = SplitterState::Done;
            return Ok(Some(SubJob {
                range: self.range,
                expected_size: total.value(),
            }));
        }

        self.metrics.record_split_query("boundary");
        let first = self
            .source
            .boundary_timestamp(&self.resource_type, self.range, SortOrder::Ascending)
            .await?;
        self.metrics.record_split_query("boundary");
        let last = self
            .source
            .boundary_timestamp(&self.resource_type, self.range, SortOrder::Descending)
            .await?;

        let mut anchors = BTreeMap::new();
        anchors.insert(self.range.start, 0);
        if let Some(first) = first {
            anchors.insert(first, 0);
        }
        if let Some(last) = last {
            anchors.insert(last, total.value());
        }
        anchors.insert(self.range.end, total.value());

        self.state = SplitterState::Walking {
            anchors,
            cursor_ts: self.range.start,
            cursor_count: 0,
        };
        Ok(None)
    }

    async fn walk(&mut self) -> Result<Option<SubJob>> {
        // Pull the walk state out so upstream calls can borrow `self.source`
        // while the anchor map is mutated.
        let SplitterState::Walking {
            mut anchors,
            cursor_ts,
            cursor_count,
        } = std::mem::replace(&mut self.state, SplitterState::Done)
        else {
            return Ok(None);
        };

        // First anchor past the cursor whose delta clears the low bound, or
        // the window end.
        let candidate = anchors
            .range((Excluded(cursor_ts), Unbounded))
            .map(|(&ts, &cum)| (ts, cum))
            .find(|&(ts, cum)| {
                ts == self.range.end || cum.saturating_sub(cursor_count) >= self.bounds.low
            });
        let Some((anchor_ts, anchor_cum)) = candidate else {
            return Ok(None);
        };
        let delta = anchor_cum.saturating_sub(cursor_count);

        if delta < self.bounds.high {
            let sub_job = SubJob {
                range: TimeRange::new(cursor_ts, anchor_ts),
                expected_size: delta,
            };
            if anchor_ts < self.range.end {
                self.state = SplitterState::Walking {
                    anchors,
                    cursor_ts: anchor_ts,
                    cursor_count: anchor_cum,
                };
            }
            return Ok(Some(sub_job));
        }

        let sub_job = self
            .bisect(&mut anchors, cursor_ts, cursor_count, anchor_ts)
            .await?;
        if sub_job.range.end < self.range.end {
            let end_cum = anchors.get(&sub_job.range.end).copied().unwrap_or(
                cursor_count.saturating_add(sub_job.expected_size),
            );
            self.state = SplitterState::Walking {
                anchors,
                cursor_ts: sub_job.range.end,
                cursor_count: end_cum,
            };
        }
        Ok(Some(sub_job))
    }

    /// Binary-searches a sub-job end between the cursor and an oversized
    /// anchor, inserting every probed midpoint into the anchor map.
    async fn bisect(
        &self,
        anchors: &mut BTreeMap<DateTime<Utc>, u64>,
        cursor_ts: DateTime<Utc>,
        cursor_count: u64,
        hi_ts: DateTime<Utc>,
    ) -> Result<SubJob> {
        let mut lo_ts = cursor_ts;
        let mut lo_delta: u64 = 0;
        let mut hi_ts = hi_ts;

        loop {
            let gap = TimeRange::new(lo_ts, hi_ts);
            if gap.width_millis() <= 1 {
                // Millisecond resolution reached without landing in the
                // band: prefer the smaller boundary when it advances the
                // cursor. Otherwise the range is unavoidably oversized; it
                // is recounted so the anchor map never carries a saturated
                // cumulative value forward.
                if lo_ts > cursor_ts {
                    return Ok(SubJob {
                        range: TimeRange::new(cursor_ts, lo_ts),
                        expected_size: lo_delta,
                    });
                }
                self.metrics.record_split_query("count");
                let counted = self
                    .source
                    .count(&self.resource_type, TimeRange::new(cursor_ts, hi_ts))
                    .await?;
                anchors.insert(hi_ts, cursor_count.saturating_add(counted.value()));
                return Ok(SubJob {
                    range: TimeRange::new(cursor_ts, hi_ts),
                    expected_size: counted.value(),
                });
            }

            let mid = gap.midpoint_millis();
            self.metrics.record_split_query("count");
            let counted = self
                .source
                .count(&self.resource_type, TimeRange::new(cursor_ts, mid))
                .await?;
            let mid_delta = counted.value();
            anchors.insert(mid, cursor_count.saturating_add(mid_delta));
            debug!(
                resource_type = %self.resource_type,
                mid = %mid,
                delta = mid_delta,
                "bisect probe"
            );

            if self.bounds.accepts(mid_delta) {
                return Ok(SubJob {
                    range: TimeRange::new(cursor_ts, mid),
                    expected_size: mid_delta,
                });
            }
            if mid_delta < self.bounds.low {
                lo_ts = mid;
                lo_delta = mid_delta;
            } else {
                hi_ts = mid;
            }
        }
    }
}
