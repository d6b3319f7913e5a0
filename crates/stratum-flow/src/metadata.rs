//! The pipeline metadata store.
//!
//! Typed accessors over the table for the records the scheduler and the
//! orchestrator own:
//!
//! - [`TriggerLease`] — the scheduler leader's identity and expiry
//! - [`CurrentTrigger`] — the sliding-window cursor
//! - compartment versions — the per-patient `versionId` used by group-scope
//!   incremental extraction
//!
//! The scheduler owns the lease and the trigger; the orchestrator only
//! touches compartment versions. No other component mutates these rows.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stratum_core::{Etag, JobId, QueueType, TableStore};

use crate::error::{Error, Result};

const LEASE_ROW_KEY: &str = "triggerLease";
const TRIGGER_ROW_KEY: &str = "currentTrigger";
const WRITE_RETRY_LIMIT: usize = 5;

/// Lifecycle of one trigger window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    /// Window created; orchestrator job enqueued.
    Running,
    /// Orchestrator finished; the cursor may advance.
    Completed,
    /// Orchestrator ended Failed or Cancelled; scheduling is parked until an
    /// operator intervenes.
    Failed,
}

/// The scheduler leader's lease record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerLease {
    /// Identity of the holder.
    pub holder: String,
    /// When the lease lapses unless renewed.
    pub expires_at: DateTime<Utc>,
}

impl TriggerLease {
    /// Returns true if the lease has lapsed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// The sliding-window cursor advanced by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentTrigger {
    /// Sequence number of this trigger window; also the group id of the
    /// orchestrator job and its children.
    pub sequence_id: u64,
    /// Current lifecycle status.
    pub status: TriggerStatus,
    /// Inclusive window start; `None` for the initial full-history window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_start_time: Option<DateTime<Utc>>,
    /// Exclusive window end; the cursor once the trigger completes.
    pub data_end_time: DateTime<Utc>,
    /// The orchestrator job driving this window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orchestrator_job_id: Option<JobId>,
}

/// Per-patient compartment version record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompartmentInfo {
    /// The patient's logical id.
    pub patient_id: String,
    /// The version last landed by the pipeline.
    pub version_id: u64,
}

/// Typed metadata accessors for one pipeline.
pub struct MetadataStore<T: TableStore + ?Sized> {
    table: Arc<T>,
    queue_type: QueueType,
}

impl<T: TableStore + ?Sized> Clone for MetadataStore<T> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            queue_type: self.queue_type,
        }
    }
}

impl<T: TableStore + ?Sized> MetadataStore<T> {
    /// Creates a metadata store for one queue type.
    pub fn new(table: Arc<T>, queue_type: QueueType) -> Self {
        Self { table, queue_type }
    }

    fn meta_partition(&self) -> String {
        format!("{}:meta", self.queue_type.key_encoded())
    }

    fn compartment_partition(&self) -> String {
        format!("{}:compartment", self.queue_type.key_encoded())
    }

    // --- trigger lease ---

    /// Attempts to acquire or take over the scheduler lease.
    ///
    /// Succeeds when no lease exists, the stored lease expired, or the
    /// caller already holds it. Returns false when another live holder owns
    /// the lease or a concurrent writer won the race.
    pub async fn try_acquire_trigger_lease(&self, holder: &str, ttl: Duration) -> Result<bool> {
        let partition = self.meta_partition();
        let lease = TriggerLease {
            holder: holder.to_string(),
            expires_at: Utc::now() + to_chrono(ttl)?,
        };
        let payload = bytes::Bytes::from(serde_json::to_vec(&lease)?);

        match self.table.get(&partition, LEASE_ROW_KEY).await? {
            None => match self.table.insert(&partition, LEASE_ROW_KEY, payload).await {
                Ok(_) => Ok(true),
                Err(err) if err.is_entity_exists() => Ok(false),
                Err(err) => Err(err.into()),
            },
            Some(entity) => {
                let stored: TriggerLease = serde_json::from_slice(&entity.payload)?;
                if stored.holder != holder && !stored.is_expired(Utc::now()) {
                    return Ok(false);
                }
                match self
                    .table
                    .update(&partition, LEASE_ROW_KEY, payload, &entity.etag)
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(err) if err.is_precondition_failed() => Ok(false),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }

    /// Renews the lease if `holder` still owns it.
    pub async fn renew_trigger_lease(&self, holder: &str, ttl: Duration) -> Result<bool> {
        let partition = self.meta_partition();
        let Some(entity) = self.table.get(&partition, LEASE_ROW_KEY).await? else {
            return Ok(false);
        };
        let stored: TriggerLease = serde_json::from_slice(&entity.payload)?;
        if stored.holder != holder || stored.is_expired(Utc::now()) {
            return Ok(false);
        }

        let renewed = TriggerLease {
            holder: holder.to_string(),
            expires_at: Utc::now() + to_chrono(ttl)?,
        };
        let payload = bytes::Bytes::from(serde_json::to_vec(&renewed)?);
        match self
            .table
            .update(&partition, LEASE_ROW_KEY, payload, &entity.etag)
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.is_precondition_failed() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Voluntarily expires the lease for fast failover on shutdown.
    pub async fn release_trigger_lease(&self, holder: &str) -> Result<bool> {
        let partition = self.meta_partition();
        let Some(entity) = self.table.get(&partition, LEASE_ROW_KEY).await? else {
            return Ok(false);
        };
        let stored: TriggerLease = serde_json::from_slice(&entity.payload)?;
        if stored.holder != holder {
            return Ok(false);
        }

        let released = TriggerLease {
            holder: holder.to_string(),
            expires_at: Utc::now(),
        };
        let payload = bytes::Bytes::from(serde_json::to_vec(&released)?);
        match self
            .table
            .update(&partition, LEASE_ROW_KEY, payload, &entity.etag)
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.is_precondition_failed() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Reads the current lease, if one exists.
    pub async fn get_trigger_lease(&self) -> Result<Option<TriggerLease>> {
        let partition = self.meta_partition();
        let Some(entity) = self.table.get(&partition, LEASE_ROW_KEY).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&entity.payload)?))
    }

    // --- current trigger ---

    /// Reads the sliding-window cursor, if one exists.
    pub async fn get_current_trigger(&self) -> Result<Option<CurrentTrigger>> {
        let partition = self.meta_partition();
        let Some(entity) = self.table.get(&partition, TRIGGER_ROW_KEY).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&entity.payload)?))
    }

    /// Writes the sliding-window cursor (insert or replace).
    ///
    /// Only the lease holder may call this; a bounded retry absorbs the
    /// narrow insert/update race during takeover.
    pub async fn save_current_trigger(&self, trigger: &CurrentTrigger) -> Result<()> {
        let partition = self.meta_partition();
        let payload = bytes::Bytes::from(serde_json::to_vec(trigger)?);

        for _ in 0..WRITE_RETRY_LIMIT {
            let etag: Option<Etag> = self
                .table
                .get(&partition, TRIGGER_ROW_KEY)
                .await?
                .map(|entity| entity.etag);
            let outcome = match etag {
                None => {
                    self.table
                        .insert(&partition, TRIGGER_ROW_KEY, payload.clone())
                        .await
                }
                Some(etag) => {
                    self.table
                        .update(&partition, TRIGGER_ROW_KEY, payload.clone(), &etag)
                        .await
                }
            };
            match outcome {
                Ok(_) => return Ok(()),
                Err(err) if err.is_entity_exists() || err.is_precondition_failed() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Err(Error::retriable("current trigger row contended"))
    }

    // --- compartment versions ---

    /// Reads the stored versions of the given patients.
    ///
    /// Patients never seen before are absent from the result.
    pub async fn get_patient_versions(
        &self,
        patient_ids: &[String],
    ) -> Result<BTreeMap<String, u64>> {
        let partition = self.compartment_partition();
        let mut versions = BTreeMap::new();
        for patient_id in patient_ids {
            if let Some(entity) = self.table.get(&partition, patient_id).await? {
                let info: CompartmentInfo = serde_json::from_slice(&entity.payload)?;
                versions.insert(info.patient_id, info.version_id);
            }
        }
        Ok(versions)
    }

    /// Upserts patient versions after a group-scope child completes.
    ///
    /// Idempotent: replaying the same versions is harmless.
    pub async fn upsert_patient_versions(&self, versions: &BTreeMap<String, u64>) -> Result<()> {
        let partition = self.compartment_partition();
        for (patient_id, &version_id) in versions {
            let info = CompartmentInfo {
                patient_id: patient_id.clone(),
                version_id,
            };
            let payload = bytes::Bytes::from(serde_json::to_vec(&info)?);

            let mut written = false;
            for _ in 0..WRITE_RETRY_LIMIT {
                let etag = self
                    .table
                    .get(&partition, patient_id)
                    .await?
                    .map(|entity| entity.etag);
                let outcome = match etag {
                    None => self.table.insert(&partition, patient_id, payload.clone()).await,
                    Some(etag) => {
                        self.table
                            .update(&partition, patient_id, payload.clone(), &etag)
                            .await
                    }
                };
                match outcome {
                    Ok(_) => {
                        written = true;
                        break;
                    }
                    Err(err) if err.is_entity_exists() || err.is_precondition_failed() => {}
                    Err(err) => return Err(err.into()),
                }
            }
            if !written {
                return Err(Error::retriable(format!(
                    "compartment row for patient {patient_id} contended"
                )));
            }
        }
        Ok(())
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| Error::Configuration {
            message: format!("duration out of range: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::prelude::MemoryTable;

    const TTL: Duration = Duration::from_secs(60);

    fn store() -> MetadataStore<MemoryTable> {
        MetadataStore::new(Arc::new(MemoryTable::new()), QueueType::new(1))
    }

    #[tokio::test]
    async fn lease_acquisition_is_exclusive() -> Result<()> {
        let store = store();
        assert!(store.try_acquire_trigger_lease("a", TTL).await?);
        assert!(!store.try_acquire_trigger_lease("b", TTL).await?);
        // The holder may re-acquire its own lease.
        assert!(store.try_acquire_trigger_lease("a", TTL).await?);
        Ok(())
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() -> Result<()> {
        let store = store();
        assert!(
            store
                .try_acquire_trigger_lease("a", Duration::from_secs(0))
                .await?
        );
        assert!(store.try_acquire_trigger_lease("b", TTL).await?);

        let lease = store.get_trigger_lease().await?.unwrap();
        assert_eq!(lease.holder, "b");
        Ok(())
    }

    #[tokio::test]
    async fn renewal_requires_live_ownership() -> Result<()> {
        let store = store();
        assert!(store.try_acquire_trigger_lease("a", TTL).await?);
        assert!(store.renew_trigger_lease("a", TTL).await?);
        assert!(!store.renew_trigger_lease("b", TTL).await?);
        Ok(())
    }

    #[tokio::test]
    async fn release_expires_the_lease() -> Result<()> {
        let store = store();
        assert!(store.try_acquire_trigger_lease("a", TTL).await?);
        assert!(store.release_trigger_lease("a").await?);
        assert!(store.try_acquire_trigger_lease("b", TTL).await?);
        Ok(())
    }

    #[tokio::test]
    async fn current_trigger_roundtrip() -> Result<()> {
        let store = store();
        assert!(store.get_current_trigger().await?.is_none());

        let trigger = CurrentTrigger {
            sequence_id: 3,
            status: TriggerStatus::Running,
            data_start_time: None,
            data_end_time: Utc::now(),
            orchestrator_job_id: Some(JobId::new(9)),
        };
        store.save_current_trigger(&trigger).await?;

        let stored = store.get_current_trigger().await?.unwrap();
        assert_eq!(stored.sequence_id, 3);
        assert_eq!(stored.status, TriggerStatus::Running);
        assert_eq!(stored.orchestrator_job_id, Some(JobId::new(9)));

        // Replace works too.
        let advanced = CurrentTrigger {
            sequence_id: 4,
            status: TriggerStatus::Completed,
            ..stored
        };
        store.save_current_trigger(&advanced).await?;
        assert_eq!(store.get_current_trigger().await?.unwrap().sequence_id, 4);
        Ok(())
    }

    #[tokio::test]
    async fn patient_versions_upsert_and_read() -> Result<()> {
        let store = store();
        let mut versions = BTreeMap::new();
        versions.insert("p1".to_string(), 2u64);
        versions.insert("p2".to_string(), 5u64);
        store.upsert_patient_versions(&versions).await?;

        let read = store
            .get_patient_versions(&["p1".into(), "p2".into(), "p3".into()])
            .await?;
        assert_eq!(read.len(), 2);
        assert_eq!(read["p1"], 2);
        assert_eq!(read["p2"], 5);

        versions.insert("p1".to_string(), 3u64);
        store.upsert_patient_versions(&versions).await?;
        let read = store.get_patient_versions(&["p1".into()]).await?;
        assert_eq!(read["p1"], 3);
        Ok(())
    }
}
