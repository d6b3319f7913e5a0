//! Integration tests for the scheduler: leader election, window creation,
//! cursor advancement, and abnormal-termination parking.

use std::sync::Arc;
use std::time::Duration;

use stratum_core::prelude::{MemoryQueue, MemoryTable};
use stratum_core::QueueType;
use stratum_flow::config::{FilterScope, PipelineConfig};
use stratum_flow::job::JobStatus;
use stratum_flow::metadata::{MetadataStore, TriggerStatus};
use stratum_flow::orchestrator::{JobType, OrchestratorJobInputData};
use stratum_flow::queue_client::{DequeueOutcome, JobQueue};
use stratum_flow::scheduler::{SchedulerOptions, SchedulerService};

type TestQueue = JobQueue<MemoryTable, MemoryQueue>;

fn harness(
    config: PipelineConfig,
    options: SchedulerOptions,
) -> (
    TestQueue,
    MetadataStore<MemoryTable>,
    SchedulerService<MemoryTable, MemoryQueue>,
) {
    let table = Arc::new(MemoryTable::new());
    let queue = JobQueue::new(
        Arc::clone(&table),
        Arc::new(MemoryQueue::new()),
        config.queue_type,
    );
    let metadata = MetadataStore::new(table, config.queue_type);
    let scheduler = SchedulerService::new(queue.clone(), metadata.clone(), config, options);
    (queue, metadata, scheduler)
}

fn eager_config() -> PipelineConfig {
    PipelineConfig {
        queue_type: QueueType::new(4),
        filter_scope: FilterScope::System {
            resource_types: vec!["Patient".to_string()],
        },
        window_lag: Duration::from_secs(0),
        initial_orchestration_interval: Duration::from_secs(0),
        incremental_orchestration_interval: Duration::from_secs(0),
        ..PipelineConfig::default()
    }
}

#[tokio::test]
async fn first_tick_creates_the_initial_trigger_and_job() {
    let (queue, metadata, scheduler) = harness(eager_config(), SchedulerOptions::default());

    assert!(scheduler.tick().await.unwrap());

    let trigger = metadata.get_current_trigger().await.unwrap().unwrap();
    assert_eq!(trigger.sequence_id, 0);
    assert_eq!(trigger.status, TriggerStatus::Running);
    assert!(trigger.data_start_time.is_none());
    let job_id = trigger.orchestrator_job_id.unwrap();

    let job = queue.get_job_by_id(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Created);
    let input: OrchestratorJobInputData = serde_json::from_slice(&job.definition).unwrap();
    assert_eq!(input.job_type, JobType::Orchestrator);
    assert_eq!(input.trigger_sequence_id, 0);
    assert_eq!(input.data_end_time, trigger.data_end_time);
}

#[tokio::test]
async fn only_the_lease_holder_schedules() {
    let config = eager_config();
    let table = Arc::new(MemoryTable::new());
    let queue: TestQueue = JobQueue::new(
        Arc::clone(&table),
        Arc::new(MemoryQueue::new()),
        config.queue_type,
    );
    let metadata = MetadataStore::new(table, config.queue_type);
    let leader = SchedulerService::new(
        queue.clone(),
        metadata.clone(),
        config.clone(),
        SchedulerOptions::default(),
    );
    let follower = SchedulerService::new(
        queue.clone(),
        metadata.clone(),
        config,
        SchedulerOptions::default(),
    );

    assert!(leader.tick().await.unwrap());
    assert!(!follower.tick().await.unwrap());

    // Exactly one orchestrator job exists.
    assert_eq!(queue.approximate_depth().await.unwrap(), 1);
}

#[tokio::test]
async fn follower_takes_over_an_expired_lease() {
    let config = eager_config();
    let table = Arc::new(MemoryTable::new());
    let queue: TestQueue = JobQueue::new(
        Arc::clone(&table),
        Arc::new(MemoryQueue::new()),
        config.queue_type,
    );
    let metadata = MetadataStore::new(table, config.queue_type);
    let short_lease = SchedulerOptions {
        lease_ttl: Duration::from_millis(10),
        ..SchedulerOptions::default()
    };
    let leader = SchedulerService::new(
        queue.clone(),
        metadata.clone(),
        config.clone(),
        short_lease,
    );
    let follower = SchedulerService::new(
        queue.clone(),
        metadata.clone(),
        config,
        SchedulerOptions::default(),
    );

    assert!(leader.tick().await.unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(follower.tick().await.unwrap());

    let lease = metadata.get_trigger_lease().await.unwrap().unwrap();
    assert_eq!(lease.holder, follower.instance_id());
}

#[tokio::test]
async fn completed_orchestrator_advances_the_cursor() {
    let (queue, metadata, scheduler) = harness(eager_config(), SchedulerOptions::default());

    assert!(scheduler.tick().await.unwrap());
    let first = metadata.get_current_trigger().await.unwrap().unwrap();

    // Run the orchestrator job to completion by hand.
    let DequeueOutcome::Leased(job) = queue.dequeue("w", 30).await.unwrap() else {
        panic!("expected orchestrator lease");
    };
    queue.complete(&job, false).await.unwrap();

    // The next tick closes the window and opens the successor.
    assert!(scheduler.tick().await.unwrap());
    let next = metadata.get_current_trigger().await.unwrap().unwrap();
    assert_eq!(next.sequence_id, 1);
    assert_eq!(next.status, TriggerStatus::Running);
    assert_eq!(next.data_start_time, Some(first.data_end_time));
    assert!(next.data_end_time > first.data_end_time);
}

#[tokio::test]
async fn failed_orchestrator_parks_the_trigger() {
    let (queue, metadata, scheduler) = harness(eager_config(), SchedulerOptions::default());

    assert!(scheduler.tick().await.unwrap());

    let DequeueOutcome::Leased(mut job) = queue.dequeue("w", 30).await.unwrap() else {
        panic!("expected orchestrator lease");
    };
    job.status = JobStatus::Failed;
    queue.complete(&job, false).await.unwrap();

    assert!(scheduler.tick().await.unwrap());
    let parked = metadata.get_current_trigger().await.unwrap().unwrap();
    assert_eq!(parked.status, TriggerStatus::Failed);

    // Scheduling stays parked on subsequent ticks.
    assert!(scheduler.tick().await.unwrap());
    let still_parked = metadata.get_current_trigger().await.unwrap().unwrap();
    assert_eq!(still_parked.sequence_id, parked.sequence_id);
    assert_eq!(still_parked.status, TriggerStatus::Failed);
}

#[tokio::test]
async fn running_trigger_is_left_alone_until_terminal() {
    let (queue, metadata, scheduler) = harness(eager_config(), SchedulerOptions::default());

    assert!(scheduler.tick().await.unwrap());
    let first = metadata.get_current_trigger().await.unwrap().unwrap();

    // The orchestrator has not finished; further ticks change nothing.
    assert!(scheduler.tick().await.unwrap());
    assert!(scheduler.tick().await.unwrap());
    let unchanged = metadata.get_current_trigger().await.unwrap().unwrap();
    assert_eq!(unchanged.sequence_id, first.sequence_id);
    assert_eq!(unchanged.status, TriggerStatus::Running);
    assert_eq!(queue.approximate_depth().await.unwrap(), 1);
}

#[tokio::test]
async fn max_window_caps_the_second_trigger() {
    let config = PipelineConfig {
        max_window: Some(Duration::from_secs(1)),
        ..eager_config()
    };
    let (queue, metadata, scheduler) = harness(config, SchedulerOptions::default());

    assert!(scheduler.tick().await.unwrap());
    let DequeueOutcome::Leased(job) = queue.dequeue("w", 30).await.unwrap() else {
        panic!("expected orchestrator lease");
    };
    queue.complete(&job, false).await.unwrap();

    // Let the wall clock move past the cap, then open the next window.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(scheduler.tick().await.unwrap());

    let next = metadata.get_current_trigger().await.unwrap().unwrap();
    assert_eq!(next.sequence_id, 1);
    let width = next.data_end_time - next.data_start_time.unwrap();
    assert!(width <= chrono::Duration::seconds(1));
}
