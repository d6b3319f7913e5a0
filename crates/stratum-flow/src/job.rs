//! Job entities and table key encoding.
//!
//! The job table holds four row shapes, distinguished by key prefix and
//! always read through a typed lookup path:
//!
//! - [`JobInfo`] — the canonical record of a job
//! - [`JobLock`] — the enqueue-deduplication sibling, keyed by the hash of
//!   the definition
//! - [`JobReverseIndex`] — id → job-info pointer for O(1) lookup by id
//! - [`JobIdCounter`] — the per-queue-type id allocator
//!
//! The queue message ([`JobMessage`]) is a pointer to these rows; all
//! authoritative state lives in the table.
//!
//! Ownership between the sibling rows is asymmetric: the lock stores the
//! job-info row key, the job info never stores a lock pointer.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use stratum_core::{GroupId, JobId, MessageId, PopReceipt, QueueType};

use crate::error::{Error, Result};

/// Serde adapter storing opaque byte fields as base64 strings.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Lifecycle status of a job.
///
/// Transitions follow a directed graph:
///
/// ```text
/// ┌─────────┐  dequeue  ┌─────────┐ complete  ┌───────────┐
/// │ CREATED │──────────►│ RUNNING │──────────►│ COMPLETED │
/// └─────────┘           └─────────┘           └───────────┘
///      │                     │
///      │ cancel              ├──────────────► FAILED
///      ▼                     │
/// ┌───────────┐              │
/// │ CANCELLED │◄─────────────┘
/// └───────────┘
/// ```
///
/// No terminal status ever reverts. Running → Running is allowed: a re-lease
/// after a lost heartbeat is a new dequeue of the same Running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Enqueued, not yet leased by any worker.
    Created,
    /// Leased by a worker holding the current version.
    Running,
    /// Finished successfully; `result` holds the output.
    Completed,
    /// Finished with a fatal error.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl JobStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the transition `self` → `target` is allowed.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Created, Self::Running)
                | (Self::Created, Self::Cancelled)
                | (Self::Running, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }

    /// Returns the status name used in errors and metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The canonical record of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    /// Unique id within the queue type; never reused.
    pub id: JobId,
    /// The namespace this job belongs to.
    pub queue_type: QueueType,
    /// Group for bulk cancellation.
    pub group_id: GroupId,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Opaque job input.
    #[serde(with = "base64_bytes")]
    pub definition: Bytes,
    /// Opaque job output or progress snapshot.
    #[serde(with = "base64_bytes")]
    pub result: Bytes,
    /// Cooperative cancellation flag, observed via keep-alive.
    pub cancel_requested: bool,
    /// When the job was enqueued.
    pub create_date: DateTime<Utc>,
    /// Last heartbeat instant.
    pub heartbeat_date_time: DateTime<Utc>,
    /// Lease duration granted on dequeue, in seconds.
    pub heartbeat_timeout_sec: u32,
    /// Lease fence: the dequeue instant in microseconds since epoch.
    /// Strictly increases across dequeues of the same id.
    pub version: i64,
}

impl JobInfo {
    /// Creates a freshly-enqueued job record.
    #[must_use]
    pub fn new(queue_type: QueueType, group_id: GroupId, id: JobId, definition: Bytes) -> Self {
        let now = Utc::now();
        Self {
            id,
            queue_type,
            group_id,
            status: JobStatus::Created,
            definition,
            result: Bytes::new(),
            cancel_requested: false,
            create_date: now,
            heartbeat_date_time: now,
            heartbeat_timeout_sec: 0,
            version: 0,
        }
    }

    /// Returns the partition key of this job's rows.
    #[must_use]
    pub fn partition_key(&self) -> String {
        job_partition_key(self.queue_type, self.group_id)
    }

    /// Returns this job's row key.
    #[must_use]
    pub fn row_key(&self) -> String {
        job_info_row_key(self.group_id, self.id)
    }

    /// Returns true if the job reached a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if the lease granted at `heartbeat_date_time` is still
    /// live at `now`.
    #[must_use]
    pub fn lease_is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running
            && now
                < self.heartbeat_date_time
                    + chrono::Duration::seconds(i64::from(self.heartbeat_timeout_sec))
    }

    /// Serializes the record for storage.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_payload(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Deserializes a stored record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedPayload`] if the document does not parse.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(Error::malformed)
    }
}

/// The enqueue-deduplication sibling of a [`JobInfo`].
///
/// Shares the job's partition; keyed by the hash of the definition. At most
/// one lock exists per `(queue_type, group_id, definition-hash)`, which makes
/// duplicate enqueue idempotent. `message_id`/`pop_receipt` record the
/// in-flight queue message for the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLock {
    /// Row key of the job this lock belongs to.
    pub job_info_row_key: String,
    /// Queue message currently pointing at the job, if dispatched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    /// Receipt of the latest delivery of that message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pop_receipt: Option<PopReceipt>,
}

impl JobLock {
    /// Creates a lock pointing at the given job-info row, with no message
    /// dispatched yet.
    #[must_use]
    pub fn new(job_info_row_key: impl Into<String>) -> Self {
        Self {
            job_info_row_key: job_info_row_key.into(),
            message_id: None,
            pop_receipt: None,
        }
    }

    /// Serializes the record for storage.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_payload(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Deserializes a stored record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedPayload`] if the document does not parse.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(Error::malformed)
    }
}

/// Reverse index entry: job id → job-info location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReverseIndex {
    /// Partition key of the job-info row.
    pub job_info_partition_key: String,
    /// Row key of the job-info row.
    pub job_info_row_key: String,
}

impl JobReverseIndex {
    /// Serializes the record for storage.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_payload(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Deserializes a stored record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedPayload`] if the document does not parse.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(Error::malformed)
    }
}

/// Singleton id allocator per queue type, advanced under optimistic
/// concurrency.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobIdCounter {
    /// The highest id handed out so far.
    pub next_job_id: u64,
}

impl JobIdCounter {
    /// Serializes the record for storage.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_payload(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Deserializes a stored record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedPayload`] if the document does not parse.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(Error::malformed)
    }
}

/// The queue message body: a pointer to the job's table rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    /// Partition key of the job rows.
    pub pk: String,
    /// Row key of the job-info row.
    pub rk: String,
    /// Row key of the job-lock row.
    pub lockrk: String,
}

impl JobMessage {
    /// Builds the pointer message for a job and its lock.
    #[must_use]
    pub fn new(
        partition_key: impl Into<String>,
        job_info_row_key: impl Into<String>,
        lock_row_key: impl Into<String>,
    ) -> Self {
        Self {
            pk: partition_key.into(),
            rk: job_info_row_key.into(),
            lockrk: lock_row_key.into(),
        }
    }

    /// Serializes the message body (UTF-8 JSON).
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_body(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parses a message body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedPayload`] if the body does not parse.
    pub fn from_body(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(Error::malformed)
    }
}

/// Returns the partition key shared by a job's info and lock rows.
#[must_use]
pub fn job_partition_key(queue_type: QueueType, group_id: GroupId) -> String {
    format!("{}:{}", queue_type.key_encoded(), group_id.key_encoded())
}

/// Returns the row key of a job-info row.
#[must_use]
pub fn job_info_row_key(group_id: GroupId, id: JobId) -> String {
    format!("{}:{}", group_id.key_encoded(), id.key_encoded())
}

/// Row-key prefix selecting the job-info rows of a partition.
#[must_use]
pub fn job_info_row_prefix(group_id: GroupId) -> String {
    format!("{}:", group_id.key_encoded())
}

/// Returns the lock row key for a definition: `lock:` + hex SHA-256.
#[must_use]
pub fn job_lock_row_key(definition: &[u8]) -> String {
    let digest = Sha256::digest(definition);
    format!("lock:{digest:x}")
}

/// Returns the partition key of the reverse index for a queue type.
#[must_use]
pub fn reverse_index_partition_key(queue_type: QueueType) -> String {
    format!("{}:idx", queue_type.key_encoded())
}

/// Returns the partition key of the id counter for a queue type.
#[must_use]
pub fn counter_partition_key(queue_type: QueueType) -> String {
    format!("{}:counter", queue_type.key_encoded())
}

/// Row key of the id-counter singleton.
pub const COUNTER_ROW_KEY: &str = "counter";

/// Returns the current instant as a lease version, in microseconds since
/// epoch.
#[must_use]
pub fn lease_version_now() -> i64 {
    Utc::now().timestamp_micros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_dag_allows_expected_transitions() {
        use JobStatus::{Cancelled, Completed, Created, Failed, Running};

        assert!(Created.can_transition_to(Running));
        assert!(Created.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Running));

        assert!(!Created.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Cancelled.can_transition_to(Running));
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Created.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn job_info_serde_roundtrip() {
        let job = JobInfo::new(
            QueueType::new(3),
            GroupId::new(7),
            JobId::new(42),
            Bytes::from_static(b"{\"window\":1}"),
        );
        let payload = job.to_payload().unwrap();
        let parsed = JobInfo::from_payload(&payload).unwrap();
        assert_eq!(parsed.id, job.id);
        assert_eq!(parsed.definition, job.definition);
        assert_eq!(parsed.status, JobStatus::Created);
    }

    #[test]
    fn key_encoding_matches_wire_format() {
        let qt = QueueType::new(3);
        let group = GroupId::new(7);
        let id = JobId::new(42);

        assert_eq!(job_partition_key(qt, group), "003:00000000000000000007");
        assert_eq!(
            job_info_row_key(group, id),
            "00000000000000000007:00000000000000000042"
        );
        assert_eq!(reverse_index_partition_key(qt), "003:idx");
        assert_eq!(counter_partition_key(qt), "003:counter");
    }

    #[test]
    fn lock_row_key_is_hash_of_definition() {
        let a = job_lock_row_key(b"def-a");
        let b = job_lock_row_key(b"def-b");
        assert!(a.starts_with("lock:"));
        assert_eq!(a.len(), 5 + 64);
        assert_ne!(a, b);
        assert_eq!(a, job_lock_row_key(b"def-a"));
    }

    #[test]
    fn job_message_wire_format() {
        let message = JobMessage::new("003:00000000000000000007", "rk", "lock:abc");
        let body = message.to_body().unwrap();
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.contains("\"pk\""));
        assert!(text.contains("\"rk\""));
        assert!(text.contains("\"lockrk\""));
        assert_eq!(JobMessage::from_body(&body).unwrap(), message);
    }

    #[test]
    fn malformed_message_body_is_rejected() {
        let err = JobMessage::from_body(b"not json").unwrap_err();
        assert!(matches!(err, Error::MalformedPayload { .. }));
    }

    #[test]
    fn lease_liveness_window() {
        let mut job = JobInfo::new(
            QueueType::new(0),
            GroupId::new(0),
            JobId::new(1),
            Bytes::new(),
        );
        job.status = JobStatus::Running;
        job.heartbeat_timeout_sec = 30;
        job.heartbeat_date_time = Utc::now();
        assert!(job.lease_is_live(Utc::now()));
        assert!(!job.lease_is_live(Utc::now() + chrono::Duration::seconds(31)));

        job.status = JobStatus::Created;
        assert!(!job.lease_is_live(Utc::now()));
    }
}
