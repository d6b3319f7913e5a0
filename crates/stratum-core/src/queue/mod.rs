//! The visibility-timeout message queue abstraction.
//!
//! Queue messages are pointers into the table, never authoritative state.
//! A received message becomes invisible for its visibility timeout; the
//! holder extends the timeout from its heartbeat and deletes the message once
//! the referenced job reaches a terminal status. Every receive and extend
//! rotates the message's [`PopReceipt`], fencing out stale holders.

pub mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A queue-assigned message identifier, stable across re-deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps a backend-issued message id.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw id value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The fencing token for one delivery of a message.
///
/// Rotated on every receive and extend; operations presenting a stale
/// receipt fail with `ReceiptMismatch`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PopReceipt(String);

impl PopReceipt {
    /// Wraps a backend-issued pop receipt.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw receipt value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Handle returned by [`MessageQueue::send`].
#[derive(Debug, Clone)]
pub struct SentMessage {
    /// Identifier of the new message.
    pub message_id: MessageId,
    /// Receipt for the initial (invisible-to-none) delivery.
    pub pop_receipt: PopReceipt,
}

/// A message delivered by [`MessageQueue::receive`].
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Identifier of the message.
    pub message_id: MessageId,
    /// Receipt fencing this delivery.
    pub pop_receipt: PopReceipt,
    /// The message body.
    pub body: Bytes,
    /// How many times the message has been delivered, this one included.
    pub dequeue_count: u32,
}

/// Visibility-timeout message queue abstraction.
///
/// Implementations must provide:
/// - At-least-once delivery with per-delivery visibility timeouts
/// - Pop-receipt rotation on receive and extend
/// - Receipt-checked delete and extend
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent workers.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Appends a message, immediately visible to consumers.
    async fn send(&self, body: Bytes) -> Result<SentMessage>;

    /// Receives the next visible message, hiding it for `visibility_timeout`.
    ///
    /// Returns `None` when no message is visible.
    async fn receive(&self, visibility_timeout: Duration) -> Result<Option<QueueMessage>>;

    /// Extends the visibility timeout of a held message.
    ///
    /// Returns the rotated pop receipt. Fails with `MessageNotFound` if the
    /// message was deleted and `ReceiptMismatch` if another holder re-leased
    /// it.
    async fn extend(
        &self,
        message_id: &MessageId,
        pop_receipt: &PopReceipt,
        visibility_timeout: Duration,
    ) -> Result<PopReceipt>;

    /// Deletes a held message.
    ///
    /// Fails with `MessageNotFound` / `ReceiptMismatch` like [`Self::extend`].
    async fn delete(&self, message_id: &MessageId, pop_receipt: &PopReceipt) -> Result<()>;

    /// Returns the approximate number of messages, visible or not.
    async fn approximate_depth(&self) -> Result<usize>;
}
