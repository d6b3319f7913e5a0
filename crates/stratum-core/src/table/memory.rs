//! In-memory table implementation for testing and development.
//!
//! [`MemoryTable`] upholds the full [`TableStore`] contract — atomic batches,
//! ETag fencing, duplicate detection, the entity size limit — so the queue
//! and orchestration test suites exercise the same failure surface they meet
//! against a real backend.
//!
//! ## Limitations
//!
//! - **Single-process only**: no durability, no cross-process coordination

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;

use super::{
    BatchOperation, Etag, TableEntity, TableStore, TransactionBatch, MAX_BATCH_SIZE,
    MAX_ENTITY_SIZE,
};
use crate::error::{Error, Result};

/// Converts a lock poison error to a transient storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::transient("lock poisoned")
}

/// In-memory table for testing.
///
/// Rows are kept in a `BTreeMap` keyed by `(partition, row)` so prefix scans
/// come back in row-key order, matching backend semantics.
#[derive(Debug, Default)]
pub struct MemoryTable {
    rows: RwLock<BTreeMap<(String, String), StoredRow>>,
    etag_seq: AtomicU64,
}

#[derive(Debug, Clone)]
struct StoredRow {
    payload: Bytes,
    etag: Etag,
    timestamp: chrono::DateTime<Utc>,
}

impl MemoryTable {
    /// Creates an empty in-memory table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of rows currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn row_count(&self) -> Result<usize> {
        let count = {
            let rows = self.rows.read().map_err(poison_err)?;
            rows.len()
        };
        Ok(count)
    }

    fn next_etag(&self) -> Etag {
        let seq = self.etag_seq.fetch_add(1, Ordering::SeqCst);
        Etag::new(format!("W/\"{seq}\""))
    }

    fn check_size(payload: &Bytes) -> Result<()> {
        if payload.len() > MAX_ENTITY_SIZE {
            return Err(Error::EntityTooLarge {
                size: payload.len(),
                limit: MAX_ENTITY_SIZE,
            });
        }
        Ok(())
    }

    fn validate_batch(batch: &TransactionBatch) -> Result<()> {
        if batch.is_empty() {
            return Err(Error::InvalidBatch {
                message: "batch holds no operations".into(),
            });
        }
        if batch.len() > MAX_BATCH_SIZE {
            return Err(Error::InvalidBatch {
                message: format!("batch holds {} operations (limit {MAX_BATCH_SIZE})", batch.len()),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for op in &batch.operations {
            if !seen.insert(op.row_key()) {
                return Err(Error::InvalidBatch {
                    message: format!("row key '{}' appears twice in batch", op.row_key()),
                });
            }
            Self::check_size(op.payload())?;
        }
        Ok(())
    }

    fn entity(partition_key: &str, row_key: &str, row: &StoredRow) -> TableEntity {
        TableEntity {
            partition_key: partition_key.to_string(),
            row_key: row_key.to_string(),
            payload: row.payload.clone(),
            etag: row.etag.clone(),
            timestamp: row.timestamp,
        }
    }
}

#[async_trait]
impl TableStore for MemoryTable {
    async fn get(&self, partition_key: &str, row_key: &str) -> Result<Option<TableEntity>> {
        let result = {
            let rows = self.rows.read().map_err(poison_err)?;
            rows.get(&(partition_key.to_string(), row_key.to_string()))
                .map(|row| Self::entity(partition_key, row_key, row))
        };
        Ok(result)
    }

    async fn insert(&self, partition_key: &str, row_key: &str, payload: Bytes) -> Result<Etag> {
        Self::check_size(&payload)?;
        let etag = self.next_etag();
        {
            let mut rows = self.rows.write().map_err(poison_err)?;
            let key = (partition_key.to_string(), row_key.to_string());
            if rows.contains_key(&key) {
                return Err(Error::EntityExists {
                    partition_key: partition_key.to_string(),
                    row_key: row_key.to_string(),
                });
            }
            rows.insert(
                key,
                StoredRow {
                    payload,
                    etag: etag.clone(),
                    timestamp: Utc::now(),
                },
            );
        }
        Ok(etag)
    }

    async fn update(
        &self,
        partition_key: &str,
        row_key: &str,
        payload: Bytes,
        etag: &Etag,
    ) -> Result<Etag> {
        Self::check_size(&payload)?;
        let new_etag = self.next_etag();
        {
            let mut rows = self.rows.write().map_err(poison_err)?;
            let key = (partition_key.to_string(), row_key.to_string());
            let Some(row) = rows.get_mut(&key) else {
                return Err(Error::EntityNotFound {
                    partition_key: partition_key.to_string(),
                    row_key: row_key.to_string(),
                });
            };
            if row.etag != *etag {
                return Err(Error::PreconditionFailed {
                    partition_key: partition_key.to_string(),
                    row_key: row_key.to_string(),
                });
            }
            row.payload = payload;
            row.etag = new_etag.clone();
            row.timestamp = Utc::now();
        }
        Ok(new_etag)
    }

    async fn submit(&self, batch: TransactionBatch) -> Result<Vec<Etag>> {
        Self::validate_batch(&batch)?;

        let mut rows = self.rows.write().map_err(poison_err)?;

        // Validate every operation before touching state so a late failure
        // cannot leave a partial batch behind.
        for op in &batch.operations {
            let key = (batch.partition_key.clone(), op.row_key().to_string());
            match op {
                BatchOperation::Insert { row_key, .. } => {
                    if rows.contains_key(&key) {
                        return Err(Error::EntityExists {
                            partition_key: batch.partition_key.clone(),
                            row_key: row_key.clone(),
                        });
                    }
                }
                BatchOperation::Update { row_key, etag, .. } => match rows.get(&key) {
                    None => {
                        return Err(Error::EntityNotFound {
                            partition_key: batch.partition_key.clone(),
                            row_key: row_key.clone(),
                        });
                    }
                    Some(row) if row.etag != *etag => {
                        return Err(Error::PreconditionFailed {
                            partition_key: batch.partition_key.clone(),
                            row_key: row_key.clone(),
                        });
                    }
                    Some(_) => {}
                },
            }
        }

        let now = Utc::now();
        let mut etags = Vec::with_capacity(batch.len());
        for op in &batch.operations {
            let key = (batch.partition_key.clone(), op.row_key().to_string());
            let etag = self.next_etag();
            rows.insert(
                key,
                StoredRow {
                    payload: op.payload().clone(),
                    etag: etag.clone(),
                    timestamp: now,
                },
            );
            etags.push(etag);
        }
        Ok(etags)
    }

    async fn query_prefix(
        &self,
        partition_key: &str,
        row_key_prefix: &str,
    ) -> Result<Vec<TableEntity>> {
        let result = {
            let rows = self.rows.read().map_err(poison_err)?;
            rows.range((partition_key.to_string(), String::new())..)
                .take_while(|((pk, _), _)| pk == partition_key)
                .filter(|((_, rk), _)| rk.starts_with(row_key_prefix))
                .map(|((_, rk), row)| Self::entity(partition_key, rk, row))
                .collect()
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(text: &str) -> Bytes {
        Bytes::from(text.to_string())
    }

    #[tokio::test]
    async fn insert_and_get_roundtrip() -> Result<()> {
        let table = MemoryTable::new();
        let etag = table.insert("p", "r", payload("{\"a\":1}")).await?;

        let entity = table.get("p", "r").await?.unwrap();
        assert_eq!(entity.payload, payload("{\"a\":1}"));
        assert_eq!(entity.etag, etag);
        Ok(())
    }

    #[tokio::test]
    async fn insert_detects_duplicates() -> Result<()> {
        let table = MemoryTable::new();
        table.insert("p", "r", payload("{}")).await?;

        let err = table.insert("p", "r", payload("{}")).await.unwrap_err();
        assert!(err.is_entity_exists());
        Ok(())
    }

    #[tokio::test]
    async fn update_requires_matching_etag() -> Result<()> {
        let table = MemoryTable::new();
        let etag = table.insert("p", "r", payload("{}")).await?;

        let new_etag = table.update("p", "r", payload("{\"b\":2}"), &etag).await?;
        assert_ne!(etag, new_etag);

        // The original ETag is now stale.
        let err = table
            .update("p", "r", payload("{}"), &etag)
            .await
            .unwrap_err();
        assert!(err.is_precondition_failed());
        Ok(())
    }

    #[tokio::test]
    async fn update_missing_row_is_not_found() {
        let table = MemoryTable::new();
        let err = table
            .update("p", "missing", payload("{}"), &Etag::new("W/\"0\""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EntityNotFound { .. }));
    }

    #[tokio::test]
    async fn batch_applies_atomically() -> Result<()> {
        let table = MemoryTable::new();
        table.insert("p", "existing", payload("{}")).await?;

        // Second operation collides, so the first must not apply either.
        let batch = TransactionBatch::new("p")
            .insert("fresh", payload("{}"))
            .insert("existing", payload("{}"));
        let err = table.submit(batch).await.unwrap_err();
        assert!(err.is_entity_exists());
        assert!(table.get("p", "fresh").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn batch_mixing_insert_and_update() -> Result<()> {
        let table = MemoryTable::new();
        let etag = table.insert("p", "a", payload("{\"v\":1}")).await?;

        let batch = TransactionBatch::new("p")
            .update("a", payload("{\"v\":2}"), etag)
            .insert("b", payload("{\"v\":0}"));
        let etags = table.submit(batch).await?;
        assert_eq!(etags.len(), 2);

        let a = table.get("p", "a").await?.unwrap();
        assert_eq!(a.payload, payload("{\"v\":2}"));
        assert!(table.get("p", "b").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn batch_rejects_duplicate_row_keys() {
        let table = MemoryTable::new();
        let batch = TransactionBatch::new("p")
            .insert("r", payload("{}"))
            .insert("r", payload("{}"));
        let err = table.submit(batch).await.unwrap_err();
        assert!(matches!(err, Error::InvalidBatch { .. }));
    }

    #[tokio::test]
    async fn batch_rejects_empty_and_oversized() {
        let table = MemoryTable::new();
        let err = table.submit(TransactionBatch::new("p")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidBatch { .. }));

        let mut batch = TransactionBatch::new("p");
        for i in 0..=MAX_BATCH_SIZE {
            batch = batch.insert(format!("r{i}"), payload("{}"));
        }
        let err = table.submit(batch).await.unwrap_err();
        assert!(matches!(err, Error::InvalidBatch { .. }));
    }

    #[tokio::test]
    async fn oversized_entity_is_rejected() {
        let table = MemoryTable::new();
        let big = Bytes::from(vec![b'x'; MAX_ENTITY_SIZE + 1]);
        let err = table.insert("p", "r", big).await.unwrap_err();
        assert!(matches!(err, Error::EntityTooLarge { .. }));
    }

    #[tokio::test]
    async fn query_prefix_returns_ordered_matches() -> Result<()> {
        let table = MemoryTable::new();
        table.insert("p", "lock:b", payload("{}")).await?;
        table.insert("p", "lock:a", payload("{}")).await?;
        table.insert("p", "job:1", payload("{}")).await?;
        table.insert("other", "lock:c", payload("{}")).await?;

        let locks = table.query_prefix("p", "lock:").await?;
        let keys: Vec<&str> = locks.iter().map(|e| e.row_key.as_str()).collect();
        assert_eq!(keys, vec!["lock:a", "lock:b"]);

        let all = table.query_prefix("p", "").await?;
        assert_eq!(all.len(), 3);
        Ok(())
    }
}
