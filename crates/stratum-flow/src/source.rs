//! The upstream search seam.
//!
//! The splitter and the orchestrator never speak HTTP; they consume the
//! [`SearchSource`] capability, which exposes exactly the two query shapes
//! the pipeline needs: a summary count over a half-open `lastUpdated` range
//! and a single-record boundary-timestamp probe. [`SearchQuery`] renders the
//! wire parameters for clients that do speak HTTP.
//!
//! Group-scope extraction additionally consumes [`PatientSource`] to list
//! the members of a patient compartment group.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A half-open UTC time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    /// Inclusive lower bound.
    pub start: DateTime<Utc>,
    /// Exclusive upper bound.
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Creates a range; `start` must not exceed `end`.
    #[must_use]
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        debug_assert!(start <= end, "time range start after end");
        Self { start, end }
    }

    /// Returns true if the range contains no instant.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Returns true if `instant` falls inside the range.
    #[must_use]
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Returns the midpoint rounded to millisecond resolution, preferring
    /// the later millisecond on a rounding tie.
    #[must_use]
    pub fn midpoint_millis(&self) -> DateTime<Utc> {
        let span = self.end - self.start;
        let half = chrono::Duration::milliseconds((span.num_milliseconds() + 1) / 2);
        self.start + half
    }

    /// Returns the width of the range in whole milliseconds.
    #[must_use]
    pub fn width_millis(&self) -> i64 {
        (self.end - self.start).num_milliseconds()
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.end.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }
}

/// Sort direction for boundary-timestamp probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Oldest `lastUpdated` first.
    Ascending,
    /// Newest `lastUpdated` first.
    Descending,
}

/// A resource count returned by the upstream summary query.
///
/// Some servers refuse to count beyond a cap; such responses saturate and
/// bisection naturally drives them back into the countable range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceCount {
    /// An exact count.
    Exact(u64),
    /// The upstream refused to count ("too many results").
    Saturated,
}

impl ResourceCount {
    /// Returns the count, with saturation mapped to `u64::MAX`.
    #[must_use]
    pub const fn value(&self) -> u64 {
        match self {
            Self::Exact(count) => *count,
            Self::Saturated => u64::MAX,
        }
    }

    /// Returns true if the upstream refused to count.
    #[must_use]
    pub const fn is_saturated(&self) -> bool {
        matches!(self, Self::Saturated)
    }
}

/// The upstream search capability consumed by the splitter.
///
/// Implementations wrap the clinical API client; request retries and circuit
/// breaking live inside the implementation, so callers treat every method as
/// a black-box fallible operation.
#[async_trait]
pub trait SearchSource: Send + Sync {
    /// Counts resources of `resource_type` whose `lastUpdated` falls in
    /// `range`, using the upstream summary mode.
    async fn count(&self, resource_type: &str, range: TimeRange) -> Result<ResourceCount>;

    /// Returns the `lastUpdated` of the first record in `range` under the
    /// given sort order, or `None` when the range is empty upstream.
    async fn boundary_timestamp(
        &self,
        resource_type: &str,
        range: TimeRange,
        order: SortOrder,
    ) -> Result<Option<DateTime<Utc>>>;
}

/// A member of a patient compartment group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientMember {
    /// The patient's logical id.
    pub patient_id: String,
    /// The version the pipeline last processed, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<u64>,
}

/// Supplies the patient list for group-scope extraction.
#[async_trait]
pub trait PatientSource: Send + Sync {
    /// Lists the patients of the configured group, in a stable order.
    async fn group_patients(&self) -> Result<Vec<String>>;
}

/// Renders the upstream query parameters for one search.
///
/// ```rust
/// use chrono::{TimeZone, Utc};
/// use stratum_flow::source::{SearchQuery, TimeRange};
///
/// let range = TimeRange::new(
///     Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
///     Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap(),
/// );
/// let params = SearchQuery::count("Patient", range).into_params();
/// assert!(params.contains(&("_summary".into(), "count".into())));
/// ```
#[derive(Debug, Clone)]
pub struct SearchQuery {
    resource_type: String,
    range: TimeRange,
    mode: QueryMode,
}

#[derive(Debug, Clone, Copy)]
enum QueryMode {
    Count,
    Boundary(SortOrder),
}

impl SearchQuery {
    /// A summary count over the range.
    #[must_use]
    pub fn count(resource_type: impl Into<String>, range: TimeRange) -> Self {
        Self {
            resource_type: resource_type.into(),
            range,
            mode: QueryMode::Count,
        }
    }

    /// A single-record boundary probe over the range.
    #[must_use]
    pub fn boundary(
        resource_type: impl Into<String>,
        range: TimeRange,
        order: SortOrder,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            range,
            mode: QueryMode::Boundary(order),
        }
    }

    /// Renders the query parameters in wire order.
    #[must_use]
    pub fn into_params(self) -> Vec<(String, String)> {
        let format_bound = |bound: DateTime<Utc>| bound.to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut params = vec![
            ("_type".to_string(), self.resource_type),
            (
                "_lastUpdated".to_string(),
                format!("ge{}", format_bound(self.range.start)),
            ),
            (
                "_lastUpdated".to_string(),
                format!("lt{}", format_bound(self.range.end)),
            ),
        ];
        match self.mode {
            QueryMode::Count => {
                params.push(("_summary".to_string(), "count".to_string()));
            }
            QueryMode::Boundary(order) => {
                params.push(("_count".to_string(), "1".to_string()));
                let sort = match order {
                    SortOrder::Ascending => "_lastUpdated",
                    SortOrder::Descending => "-_lastUpdated",
                };
                params.push(("_sort".to_string(), sort.to_string()));
            }
        }
        params
    }
}

/// In-memory search source over a fixed record timeline.
///
/// Backs the splitter and orchestrator test suites: records are
/// `(resource_type, lastUpdated)` pairs, counts are computed over the stored
/// timeline, and an optional saturation cap mimics servers that refuse large
/// counts.
#[derive(Debug, Default)]
pub struct MemorySearchSource {
    records: Vec<(String, DateTime<Utc>)>,
    saturation_cap: Option<u64>,
}

impl MemorySearchSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `timestamps` as records of `resource_type`.
    #[must_use]
    pub fn with_records(
        mut self,
        resource_type: &str,
        timestamps: impl IntoIterator<Item = DateTime<Utc>>,
    ) -> Self {
        self.records
            .extend(timestamps.into_iter().map(|t| (resource_type.to_string(), t)));
        self.records.sort_by_key(|(_, t)| *t);
        self
    }

    /// Makes counts above `cap` come back saturated.
    #[must_use]
    pub const fn with_saturation_cap(mut self, cap: u64) -> Self {
        self.saturation_cap = Some(cap);
        self
    }

    fn matching(&self, resource_type: &str, range: TimeRange) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        let resource_type = resource_type.to_string();
        self.records
            .iter()
            .filter(move |(rt, t)| *rt == resource_type && range.contains(*t))
            .map(|(_, t)| *t)
    }
}

#[async_trait]
impl SearchSource for MemorySearchSource {
    async fn count(&self, resource_type: &str, range: TimeRange) -> Result<ResourceCount> {
        let count = self.matching(resource_type, range).count() as u64;
        match self.saturation_cap {
            Some(cap) if count > cap => Ok(ResourceCount::Saturated),
            _ => Ok(ResourceCount::Exact(count)),
        }
    }

    async fn boundary_timestamp(
        &self,
        resource_type: &str,
        range: TimeRange,
        order: SortOrder,
    ) -> Result<Option<DateTime<Utc>>> {
        let boundary = match order {
            SortOrder::Ascending => self.matching(resource_type, range).min(),
            SortOrder::Descending => self.matching(resource_type, range).max(),
        };
        Ok(boundary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, secs).unwrap()
    }

    #[test]
    fn count_query_renders_summary_parameters() {
        let range = TimeRange::new(ts(0), ts(30));
        let params = SearchQuery::count("Observation", range).into_params();

        assert_eq!(params[0], ("_type".into(), "Observation".into()));
        assert!(params[1].1.starts_with("ge2024-01-01T00:00:00"));
        assert!(params[2].1.starts_with("lt2024-01-01T00:00:30"));
        assert!(params.contains(&("_summary".into(), "count".into())));
    }

    #[test]
    fn boundary_query_renders_sort_parameters() {
        let range = TimeRange::new(ts(0), ts(30));
        let asc = SearchQuery::boundary("Patient", range, SortOrder::Ascending).into_params();
        assert!(asc.contains(&("_count".into(), "1".into())));
        assert!(asc.contains(&("_sort".into(), "_lastUpdated".into())));

        let desc = SearchQuery::boundary("Patient", range, SortOrder::Descending).into_params();
        assert!(desc.contains(&("_sort".into(), "-_lastUpdated".into())));
    }

    #[test]
    fn midpoint_prefers_later_millisecond() {
        let range = TimeRange::new(ts(0), ts(0) + chrono::Duration::milliseconds(3));
        assert_eq!(
            range.midpoint_millis(),
            ts(0) + chrono::Duration::milliseconds(2)
        );
    }

    #[tokio::test]
    async fn memory_source_counts_within_range() -> Result<()> {
        let source = MemorySearchSource::new().with_records("Patient", (0..10).map(ts));

        let count = source.count("Patient", TimeRange::new(ts(2), ts(5))).await?;
        assert_eq!(count, ResourceCount::Exact(3));

        let none = source.count("Observation", TimeRange::new(ts(0), ts(10))).await?;
        assert_eq!(none, ResourceCount::Exact(0));
        Ok(())
    }

    #[tokio::test]
    async fn memory_source_saturates_above_cap() -> Result<()> {
        let source = MemorySearchSource::new()
            .with_records("Patient", (0..10).map(ts))
            .with_saturation_cap(5);

        let saturated = source.count("Patient", TimeRange::new(ts(0), ts(10))).await?;
        assert!(saturated.is_saturated());
        assert_eq!(saturated.value(), u64::MAX);

        let exact = source.count("Patient", TimeRange::new(ts(0), ts(4))).await?;
        assert_eq!(exact, ResourceCount::Exact(4));
        Ok(())
    }

    #[tokio::test]
    async fn memory_source_boundaries() -> Result<()> {
        let source = MemorySearchSource::new().with_records("Patient", [ts(3), ts(7), ts(5)]);
        let range = TimeRange::new(ts(0), ts(10));

        let first = source
            .boundary_timestamp("Patient", range, SortOrder::Ascending)
            .await?;
        let last = source
            .boundary_timestamp("Patient", range, SortOrder::Descending)
            .await?;
        assert_eq!(first, Some(ts(3)));
        assert_eq!(last, Some(ts(7)));

        let empty = source
            .boundary_timestamp("Patient", TimeRange::new(ts(8), ts(8)), SortOrder::Ascending)
            .await?;
        assert_eq!(empty, None);
        Ok(())
    }
}
