//! Error types and result aliases for the storage primitives.
//!
//! The variants mirror the failure surface of a cloud table + queue pair:
//! precondition failures and duplicates are first-class (the higher layers
//! branch on them to implement idempotent protocols), and transient faults
//! carry their source for logging.

use std::fmt;

/// The result type used throughout stratum-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in table and queue operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the identifier invalid.
        message: String,
    },

    /// An insert collided with an existing row.
    #[error("entity already exists: {partition_key}/{row_key}")]
    EntityExists {
        /// Partition key of the conflicting row.
        partition_key: String,
        /// Row key of the conflicting row.
        row_key: String,
    },

    /// An ETag precondition did not match the stored row.
    #[error("precondition failed: {partition_key}/{row_key}")]
    PreconditionFailed {
        /// Partition key of the row.
        partition_key: String,
        /// Row key of the row.
        row_key: String,
    },

    /// The requested row does not exist.
    #[error("entity not found: {partition_key}/{row_key}")]
    EntityNotFound {
        /// Partition key that was looked up.
        partition_key: String,
        /// Row key that was looked up.
        row_key: String,
    },

    /// An entity payload exceeded the per-row size limit.
    #[error("entity too large: {size} bytes (limit {limit})")]
    EntityTooLarge {
        /// Size of the rejected payload in bytes.
        size: usize,
        /// The enforced limit in bytes.
        limit: usize,
    },

    /// A single property exceeded the per-property size limit.
    #[error("property too large: {property} is {size} bytes (limit {limit})")]
    PropertyTooLarge {
        /// Name of the offending property.
        property: &'static str,
        /// Size of the rejected property in bytes.
        size: usize,
        /// The enforced limit in bytes.
        limit: usize,
    },

    /// A transactional batch was malformed (empty, oversized, or
    /// multi-partition).
    #[error("invalid batch: {message}")]
    InvalidBatch {
        /// Description of the violation.
        message: String,
    },

    /// The referenced queue message no longer exists.
    #[error("message not found: {message_id}")]
    MessageNotFound {
        /// Identifier of the missing message.
        message_id: String,
    },

    /// The supplied pop receipt is stale; the message was re-leased.
    #[error("pop receipt mismatch for message {message_id}")]
    ReceiptMismatch {
        /// Identifier of the message.
        message_id: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A transient backend fault; the caller may retry.
    #[error("transient storage error: {message}")]
    Transient {
        /// Description of the fault.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Creates a transient storage error with the given message.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a transient storage error with a source cause.
    #[must_use]
    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transient {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a serialization error from a display-able cause.
    #[must_use]
    pub fn serialization(message: impl fmt::Display) -> Self {
        Self::Serialization {
            message: message.to_string(),
        }
    }

    /// Returns true if the fault is transient and worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns true if this is an insert collision.
    #[must_use]
    pub const fn is_entity_exists(&self) -> bool {
        matches!(self, Self::EntityExists { .. })
    }

    /// Returns true if this is an ETag precondition failure.
    #[must_use]
    pub const fn is_precondition_failed(&self) -> bool {
        matches!(self, Self::PreconditionFailed { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_exists_display() {
        let err = Error::EntityExists {
            partition_key: "007:00000000000000000042".into(),
            row_key: "lock:abc".into(),
        };
        assert!(err.to_string().contains("already exists"));
        assert!(err.is_entity_exists());
        assert!(!err.is_transient());
    }

    #[test]
    fn transient_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::TimedOut, "socket timed out");
        let err = Error::transient_with_source("table throttled", source);
        assert!(err.is_transient());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn entity_too_large_display() {
        let err = Error::EntityTooLarge {
            size: 2_000_000,
            limit: 1_048_576,
        };
        let msg = err.to_string();
        assert!(msg.contains("2000000"));
        assert!(msg.contains("1048576"));
    }
}
