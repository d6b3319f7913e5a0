//! The key-value table abstraction.
//!
//! The table is the serialisation point of the whole pipeline. Every row is
//! addressed by `(partition_key, row_key)` and carries an opaque JSON
//! document plus an [`Etag`] that changes on every write.
//!
//! ## Design Principles
//!
//! - **ETag optimistic concurrency**: single-row updates must present the
//!   row's current ETag and fail with `PreconditionFailed` if it moved
//! - **Transactional batches**: multi-row mutations that must be consistent
//!   (job info + lock pairs, bulk inserts) are submitted as one atomic batch
//!   scoped to a single partition
//! - **Opaque payloads**: the table never inspects documents; row shapes are
//!   known from the lookup path, not inferred from contents

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Maximum serialized size of one entity payload (1 MiB).
pub const MAX_ENTITY_SIZE: usize = 1024 * 1024;

/// Maximum number of operations in one transactional batch.
pub const MAX_BATCH_SIZE: usize = 100;

/// An opaque write fence for a stored row.
///
/// A fresh ETag is assigned on every successful write; updates presenting a
/// stale ETag are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Etag(String);

impl Etag {
    /// Wraps a backend-issued ETag value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw ETag value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Etag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored row: the common header plus the opaque document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntity {
    /// Partition the row lives in.
    pub partition_key: String,
    /// Row key within the partition.
    pub row_key: String,
    /// The row's JSON document.
    pub payload: Bytes,
    /// Current write fence.
    pub etag: Etag,
    /// Last-modified instant assigned by the backend.
    pub timestamp: DateTime<Utc>,
}

/// One operation inside a transactional batch.
#[derive(Debug, Clone)]
pub enum BatchOperation {
    /// Insert a new row; fails the batch if the row exists.
    Insert {
        /// Row key to insert.
        row_key: String,
        /// Document to store.
        payload: Bytes,
    },
    /// Replace an existing row guarded by its ETag.
    Update {
        /// Row key to update.
        row_key: String,
        /// Replacement document.
        payload: Bytes,
        /// Expected current ETag.
        etag: Etag,
    },
}

impl BatchOperation {
    /// Returns the row key this operation targets.
    #[must_use]
    pub fn row_key(&self) -> &str {
        match self {
            Self::Insert { row_key, .. } | Self::Update { row_key, .. } => row_key,
        }
    }

    /// Returns the payload this operation writes.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        match self {
            Self::Insert { payload, .. } | Self::Update { payload, .. } => payload,
        }
    }
}

/// An atomic multi-row mutation scoped to one partition.
///
/// Either every operation applies or none does. Backends reject batches that
/// are empty, exceed [`MAX_BATCH_SIZE`], or target more than one row key
/// twice.
#[derive(Debug, Clone)]
pub struct TransactionBatch {
    /// The partition every operation targets.
    pub partition_key: String,
    /// The operations, applied in order.
    pub operations: Vec<BatchOperation>,
}

impl TransactionBatch {
    /// Creates an empty batch for the given partition.
    #[must_use]
    pub fn new(partition_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            operations: Vec::new(),
        }
    }

    /// Appends an insert operation.
    #[must_use]
    pub fn insert(mut self, row_key: impl Into<String>, payload: Bytes) -> Self {
        self.operations.push(BatchOperation::Insert {
            row_key: row_key.into(),
            payload,
        });
        self
    }

    /// Appends an ETag-guarded update operation.
    #[must_use]
    pub fn update(mut self, row_key: impl Into<String>, payload: Bytes, etag: Etag) -> Self {
        self.operations.push(BatchOperation::Update {
            row_key: row_key.into(),
            payload,
            etag,
        });
        self
    }

    /// Returns the number of operations in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns true if the batch holds no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Storage abstraction for the pipeline's key-value table.
///
/// Implementations must provide:
/// - Atomic application of [`TransactionBatch`]es within one partition
/// - ETag fencing for updates
/// - Prefix scans within a partition, ordered by row key
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from multiple
/// worker tasks.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Gets a row by partition and row key.
    ///
    /// Returns `None` if the row does not exist.
    async fn get(&self, partition_key: &str, row_key: &str) -> Result<Option<TableEntity>>;

    /// Inserts a new row, failing with `EntityExists` on collision.
    async fn insert(&self, partition_key: &str, row_key: &str, payload: Bytes) -> Result<Etag>;

    /// Replaces a row guarded by its current ETag.
    ///
    /// Fails with `PreconditionFailed` if the stored ETag differs and with
    /// `EntityNotFound` if the row is gone.
    async fn update(
        &self,
        partition_key: &str,
        row_key: &str,
        payload: Bytes,
        etag: &Etag,
    ) -> Result<Etag>;

    /// Applies a transactional batch atomically.
    ///
    /// Returns the new ETags in operation order. Any failing operation
    /// (duplicate insert, stale update) fails the whole batch with the
    /// offending operation's error and leaves the table unchanged.
    async fn submit(&self, batch: TransactionBatch) -> Result<Vec<Etag>>;

    /// Scans a partition for rows whose key starts with `row_key_prefix`,
    /// ordered by row key.
    ///
    /// An empty prefix returns the whole partition.
    async fn query_prefix(
        &self,
        partition_key: &str,
        row_key_prefix: &str,
    ) -> Result<Vec<TableEntity>>;
}
