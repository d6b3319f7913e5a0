//! Strongly-typed identifiers for pipeline entities.
//!
//! All identifiers are:
//! - **Strongly typed**: a [`JobId`] cannot be passed where a [`GroupId`] is
//!   expected
//! - **Key-encodable**: each type renders the fixed-width, zero-padded form
//!   used in table keys, so lexicographic row order matches numeric order
//!
//! Unlike random identifiers, job ids are allocated from a monotone counter
//! (see the job queue crate); they are never reused within a queue type.
//!
//! # Example
//!
//! ```rust
//! use stratum_core::id::{JobId, QueueType};
//!
//! let id = JobId::new(42);
//! assert_eq!(id.key_encoded(), "00000000000000000042");
//! assert_eq!(QueueType::new(7).key_encoded(), "007");
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A unique identifier for a job within a queue type.
///
/// Job ids are monotone 64-bit integers allocated under optimistic
/// concurrency; an id is never reused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    /// Creates a job id from its numeric value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the numeric value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the 20-digit zero-padded form used in row keys.
    #[must_use]
    pub fn key_encoded(&self) -> String {
        format!("{:020}", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u64>().map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid job id '{s}': {e}"),
        })
    }
}

/// A group of related jobs that may be bulk-cancelled together.
///
/// Typically all children of one orchestrator share its group.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct GroupId(u64);

impl GroupId {
    /// Creates a group id from its numeric value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the numeric value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the 20-digit zero-padded form used in partition and row keys.
    #[must_use]
    pub fn key_encoded(&self) -> String {
        format!("{:020}", self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GroupId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u64>().map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid group id '{s}': {e}"),
        })
    }
}

/// A byte namespace separating unrelated pipelines that share one table and
/// queue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct QueueType(u8);

impl QueueType {
    /// Creates a queue type from its byte value.
    #[must_use]
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    /// Returns the byte value.
    #[must_use]
    pub const fn value(&self) -> u8 {
        self.0
    }

    /// Returns the 3-digit zero-padded form used as a key prefix.
    #[must_use]
    pub fn key_encoded(&self) -> String {
        format!("{:03}", self.0)
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u8>().map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid queue type '{s}': {e}"),
        })
    }
}
