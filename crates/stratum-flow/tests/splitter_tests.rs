//! Integration tests for the time-range splitter at production bounds.

use chrono::{DateTime, Duration, TimeZone, Utc};

use stratum_flow::source::{MemorySearchSource, TimeRange};
use stratum_flow::splitter::{SplitBounds, SubJob, TimeRangeSplitter};

fn window_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn window_end() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap()
}

async fn collect(splitter: &mut TimeRangeSplitter<'_, MemorySearchSource>) -> Vec<SubJob> {
    let mut sub_jobs = Vec::new();
    while let Some(sub_job) = splitter.next().await.unwrap() {
        sub_jobs.push(sub_job);
    }
    sub_jobs
}

fn assert_exact_partition(sub_jobs: &[SubJob], range: TimeRange) {
    assert!(!sub_jobs.is_empty());
    assert_eq!(sub_jobs.first().unwrap().range.start, range.start);
    assert_eq!(sub_jobs.last().unwrap().range.end, range.end);
    for pair in sub_jobs.windows(2) {
        assert_eq!(
            pair[0].range.end, pair[1].range.start,
            "sub-jobs must be contiguous"
        );
    }
}

#[tokio::test]
async fn small_window_yields_one_sub_job_at_production_bounds() {
    // 500 Patient records in a one-week window, HIGH = 40000.
    let source = MemorySearchSource::new().with_records(
        "Patient",
        (0..500).map(|i| window_start() + Duration::minutes(i)),
    );
    let range = TimeRange::new(window_start(), window_end());
    let mut splitter = TimeRangeSplitter::new(&source, "Patient", range, SplitBounds::default());

    let sub_jobs = collect(&mut splitter).await;
    assert_eq!(sub_jobs.len(), 1);
    assert_eq!(sub_jobs[0].range, range);
    assert_eq!(sub_jobs[0].expected_size, 500);
}

#[tokio::test]
async fn oversized_week_bisects_into_the_default_band() {
    // 120000 records spread over the week; LOW = 20000, HIGH = 40000.
    let source = MemorySearchSource::new().with_records(
        "Patient",
        (0..120_000).map(|i| window_start() + Duration::seconds(i * 5)),
    );
    let range = TimeRange::new(window_start(), window_end());
    let bounds = SplitBounds::default();
    let mut splitter = TimeRangeSplitter::new(&source, "Patient", range, bounds);

    let sub_jobs = collect(&mut splitter).await;
    assert_exact_partition(&sub_jobs, range);
    assert!(
        (4..=6).contains(&sub_jobs.len()),
        "expected 4-6 sub-jobs, got {}",
        sub_jobs.len()
    );
    for sub_job in &sub_jobs[..sub_jobs.len() - 1] {
        assert!(
            bounds.accepts(sub_job.expected_size),
            "sub-job {sub_job:?} out of band"
        );
    }

    // End timestamps strictly increase and the expectations cover the total.
    for pair in sub_jobs.windows(2) {
        assert!(pair[0].range.end < pair[1].range.end);
    }
    let total: u64 = sub_jobs.iter().map(|s| s.expected_size).sum();
    assert_eq!(total, 120_000);
}

#[tokio::test]
async fn empty_window_yields_zero_sub_jobs() {
    let source = MemorySearchSource::new().with_records(
        "Observation",
        (0..100).map(|i| window_start() + Duration::minutes(i)),
    );
    // Records exist, but for a different resource type.
    let range = TimeRange::new(window_start(), window_end());
    let mut splitter = TimeRangeSplitter::new(&source, "Patient", range, SplitBounds::default());
    assert!(collect(&mut splitter).await.is_empty());
}

#[tokio::test]
async fn zero_width_window_yields_zero_sub_jobs() {
    let source = MemorySearchSource::new()
        .with_records("Patient", (0..100).map(|i| window_start() + Duration::minutes(i)));
    let range = TimeRange::new(window_start(), window_start());
    let mut splitter = TimeRangeSplitter::new(&source, "Patient", range, SplitBounds::default());
    assert!(collect(&mut splitter).await.is_empty());
}

#[tokio::test]
async fn millisecond_cluster_bisects_to_the_resolution_floor() {
    // 30 records inside two milliseconds force bisection to the floor; the
    // cluster cannot be split below the band, so an oversized endpoint is
    // yielded rather than losing coverage.
    let cluster = window_start() + Duration::hours(1);
    let source = MemorySearchSource::new().with_records(
        "Patient",
        (0..30).map(|i| cluster + Duration::milliseconds(i % 2)),
    );
    let range = TimeRange::new(window_start(), window_start() + Duration::hours(2));
    let bounds = SplitBounds::new(4, 8).unwrap();
    let mut splitter = TimeRangeSplitter::new(&source, "Patient", range, bounds);

    let sub_jobs = collect(&mut splitter).await;
    assert_exact_partition(&sub_jobs, range);
    let total: u64 = sub_jobs.iter().map(|s| s.expected_size).sum();
    assert_eq!(total, 30);
}

#[tokio::test]
async fn saturating_upstream_still_partitions_exactly() {
    let source = MemorySearchSource::new()
        .with_records(
            "Patient",
            (0..2000).map(|i| window_start() + Duration::seconds(i * 60)),
        )
        .with_saturation_cap(500);
    let range = TimeRange::new(window_start(), window_start() + Duration::seconds(2000 * 60));
    let bounds = SplitBounds::new(100, 400).unwrap();
    let mut splitter = TimeRangeSplitter::new(&source, "Patient", range, bounds);

    let sub_jobs = collect(&mut splitter).await;
    assert_exact_partition(&sub_jobs, range);
    let total: u64 = sub_jobs.iter().map(|s| s.expected_size).sum();
    assert_eq!(total, 2000);
    for sub_job in &sub_jobs[..sub_jobs.len() - 1] {
        assert!(sub_job.expected_size < 400);
    }
}
