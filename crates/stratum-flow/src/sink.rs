//! The columnar-writer seam.
//!
//! Processing jobs stage their output under their job id; the orchestrator
//! commits staged output exactly when it observes the child Completed. The
//! writer itself is an external collaborator; the pipeline only depends on
//! this commit capability, which must be idempotent by job id.

use async_trait::async_trait;

use stratum_core::JobId;

use crate::error::Result;

/// Commits staged columnar output for completed jobs.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Promotes the staged output of `job_id` to its final location.
    ///
    /// Must be idempotent: committing an already-committed or empty job id
    /// succeeds without effect, so orchestrator replay is safe.
    async fn commit(&self, job_id: JobId) -> Result<()>;
}

/// In-memory sink recording committed job ids, for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    committed: std::sync::Mutex<Vec<JobId>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the ids committed so far, in commit order.
    #[must_use]
    pub fn committed(&self) -> Vec<JobId> {
        self.committed
            .lock()
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn commit(&self, job_id: JobId) -> Result<()> {
        if let Ok(mut ids) = self.committed.lock() {
            ids.push(job_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_sink_records_commit_order() -> Result<()> {
        let sink = MemorySink::new();
        sink.commit(JobId::new(2)).await?;
        sink.commit(JobId::new(1)).await?;
        assert_eq!(sink.committed(), vec![JobId::new(2), JobId::new(1)]);
        Ok(())
    }
}
