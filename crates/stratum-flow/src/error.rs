//! Error types for the job-management domain.
//!
//! The host and the orchestrator branch on error *kind*, not message: a
//! [`Error::JobNotExist`] means the caller's lease is gone and it must
//! abandon the job silently; anything for which [`Error::is_retriable`]
//! holds leaves the job Running so the next dequeue re-leases it; the
//! remaining kinds are fatal to the job.

use stratum_core::JobId;

/// The result type used throughout stratum-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in job-queue and orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The job is gone, or the caller's version no longer matches the stored
    /// version. The caller holds no lease and must abandon the job.
    #[error("job does not exist or lease was lost: {job_id}")]
    JobNotExist {
        /// The job whose lease was lost.
        job_id: JobId,
    },

    /// A transient fault; the host re-leases and the work is retried.
    #[error("retriable: {message}")]
    Retriable {
        /// Description of the fault.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The cooperative cancellation flag was observed; the job completes
    /// with Cancelled status.
    #[error("job cancelled")]
    Cancelled,

    /// An enqueue would overlap an existing definition in a forbidden way.
    #[error("duplicate job definition in group {group_id}")]
    DuplicateDefinition {
        /// The group holding the existing definition.
        group_id: u64,
    },

    /// A job definition or result exceeded the per-property size limit.
    /// The caller must shrink the payload; retrying cannot succeed.
    #[error("payload too large: {property} is {size} bytes (limit {limit})")]
    PropertyTooLarge {
        /// Name of the offending field.
        property: &'static str,
        /// Size of the rejected payload in bytes.
        size: usize,
        /// The enforced limit in bytes.
        limit: usize,
    },

    /// An invalid status transition was attempted.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        /// The current status.
        from: &'static str,
        /// The attempted target status.
        to: &'static str,
    },

    /// A job definition or result failed to deserialize.
    #[error("malformed job payload: {message}")]
    MalformedPayload {
        /// Description of the failure.
        message: String,
    },

    /// The upstream search API rejected the request with a caller-visible
    /// diagnostic (bad filter, unsupported resource type).
    #[error("upstream rejected request: {message}")]
    UpstreamRejected {
        /// The diagnostic returned by the upstream.
        message: String,
    },

    /// Pipeline configuration failed validation.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Description of the violation.
        message: String,
    },

    /// An error from the storage primitives.
    #[error("storage error: {0}")]
    Storage(#[from] stratum_core::Error),
}

impl Error {
    /// Creates a retriable error with the given message.
    #[must_use]
    pub fn retriable(message: impl Into<String>) -> Self {
        Self::Retriable {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a retriable error with a source cause.
    #[must_use]
    pub fn retriable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Retriable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a malformed-payload error from a display-able cause.
    #[must_use]
    pub fn malformed(message: impl std::fmt::Display) -> Self {
        Self::MalformedPayload {
            message: message.to_string(),
        }
    }

    /// Returns true if the host should leave the job Running for re-lease
    /// instead of failing it.
    ///
    /// Transient storage faults, upstream diagnostics, and cancellation are
    /// retriable; payload-size and lease-loss errors are not.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Retriable { .. } | Self::UpstreamRejected { .. } => true,
            Self::Storage(inner) => inner.is_transient(),
            _ => false,
        }
    }

    /// Returns true if this error reports a lost lease.
    #[must_use]
    pub const fn is_job_not_exist(&self) -> bool {
        matches!(self, Self::JobNotExist { .. })
    }

    /// Returns true if this error is the cooperative cancellation signal.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::malformed(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_predicate_matches_taxonomy() {
        assert!(Error::retriable("table throttled").is_retriable());
        assert!(Error::UpstreamRejected {
            message: "bad filter".into()
        }
        .is_retriable());
        assert!(Error::Storage(stratum_core::Error::transient("throttled")).is_retriable());

        assert!(!Error::JobNotExist {
            job_id: JobId::new(1)
        }
        .is_retriable());
        assert!(!Error::Cancelled.is_retriable());
        assert!(!Error::PropertyTooLarge {
            property: "definition",
            size: 70_000,
            limit: 65_536,
        }
        .is_retriable());
        assert!(
            !Error::Storage(stratum_core::Error::EntityTooLarge {
                size: 2_000_000,
                limit: 1_048_576,
            })
            .is_retriable()
        );
    }

    #[test]
    fn job_not_exist_display() {
        let err = Error::JobNotExist {
            job_id: JobId::new(42),
        };
        assert!(err.to_string().contains("42"));
        assert!(err.is_job_not_exist());
    }

    #[test]
    fn retriable_with_source_preserves_cause() {
        let source = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err = Error::retriable_with_source("upstream unreachable", source);
        assert!(std::error::Error::source(&err).is_some());
    }
}
