//! In-memory message queue for testing and development.
//!
//! [`MemoryQueue`] implements real visibility timeouts against the wall
//! clock and rotates pop receipts exactly like a cloud queue, so lease-loss
//! and stale-receipt paths are testable without a backend.

use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use ulid::Ulid;

use super::{MessageId, MessageQueue, PopReceipt, QueueMessage, SentMessage};
use crate::error::{Error, Result};

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::transient("lock poisoned")
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: MessageId,
    pop_receipt: PopReceipt,
    body: Bytes,
    visible_at: DateTime<Utc>,
    dequeue_count: u32,
}

/// In-memory queue with wall-clock visibility timeouts.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    messages: RwLock<VecDeque<StoredMessage>>,
}

impl MemoryQueue {
    /// Creates an empty in-memory queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_receipt() -> PopReceipt {
        PopReceipt::new(Ulid::new().to_string())
    }

    /// Makes every message visible immediately.
    ///
    /// Test helper for simulating an expired lease without waiting out the
    /// visibility timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn expire_visibility(&self) -> Result<()> {
        let mut messages = self.messages.write().map_err(poison_err)?;
        let now = Utc::now();
        for message in messages.iter_mut() {
            message.visible_at = now;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn send(&self, body: Bytes) -> Result<SentMessage> {
        let message_id = MessageId::new(Ulid::new().to_string());
        let pop_receipt = Self::fresh_receipt();
        {
            let mut messages = self.messages.write().map_err(poison_err)?;
            messages.push_back(StoredMessage {
                message_id: message_id.clone(),
                pop_receipt: pop_receipt.clone(),
                body,
                visible_at: Utc::now(),
                dequeue_count: 0,
            });
        }
        Ok(SentMessage {
            message_id,
            pop_receipt,
        })
    }

    async fn receive(&self, visibility_timeout: Duration) -> Result<Option<QueueMessage>> {
        let now = Utc::now();
        let hidden_until = now
            + chrono::Duration::from_std(visibility_timeout)
                .map_err(|e| Error::transient(format!("visibility timeout out of range: {e}")))?;

        let mut messages = self.messages.write().map_err(poison_err)?;
        let Some(message) = messages.iter_mut().find(|m| m.visible_at <= now) else {
            return Ok(None);
        };

        message.visible_at = hidden_until;
        message.dequeue_count += 1;
        message.pop_receipt = Self::fresh_receipt();

        Ok(Some(QueueMessage {
            message_id: message.message_id.clone(),
            pop_receipt: message.pop_receipt.clone(),
            body: message.body.clone(),
            dequeue_count: message.dequeue_count,
        }))
    }

    async fn extend(
        &self,
        message_id: &MessageId,
        pop_receipt: &PopReceipt,
        visibility_timeout: Duration,
    ) -> Result<PopReceipt> {
        let hidden_until = Utc::now()
            + chrono::Duration::from_std(visibility_timeout)
                .map_err(|e| Error::transient(format!("visibility timeout out of range: {e}")))?;

        let mut messages = self.messages.write().map_err(poison_err)?;
        let Some(message) = messages.iter_mut().find(|m| m.message_id == *message_id) else {
            return Err(Error::MessageNotFound {
                message_id: message_id.to_string(),
            });
        };
        if message.pop_receipt != *pop_receipt {
            return Err(Error::ReceiptMismatch {
                message_id: message_id.to_string(),
            });
        }

        message.visible_at = hidden_until;
        message.pop_receipt = Self::fresh_receipt();
        Ok(message.pop_receipt.clone())
    }

    async fn delete(&self, message_id: &MessageId, pop_receipt: &PopReceipt) -> Result<()> {
        let mut messages = self.messages.write().map_err(poison_err)?;
        let Some(index) = messages.iter().position(|m| m.message_id == *message_id) else {
            return Err(Error::MessageNotFound {
                message_id: message_id.to_string(),
            });
        };
        if messages[index].pop_receipt != *pop_receipt {
            return Err(Error::ReceiptMismatch {
                message_id: message_id.to_string(),
            });
        }
        messages.remove(index);
        Ok(())
    }

    async fn approximate_depth(&self) -> Result<usize> {
        let depth = {
            let messages = self.messages.read().map_err(poison_err)?;
            messages.len()
        };
        Ok(depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VISIBILITY: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn send_receive_roundtrip() -> Result<()> {
        let queue = MemoryQueue::new();
        let sent = queue.send(Bytes::from_static(b"hello")).await?;

        let received = queue.receive(VISIBILITY).await?.unwrap();
        assert_eq!(received.message_id, sent.message_id);
        assert_eq!(received.body, Bytes::from_static(b"hello"));
        assert_eq!(received.dequeue_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn received_message_is_invisible() -> Result<()> {
        let queue = MemoryQueue::new();
        queue.send(Bytes::from_static(b"m")).await?;

        let first = queue.receive(VISIBILITY).await?;
        assert!(first.is_some());
        let second = queue.receive(VISIBILITY).await?;
        assert!(second.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn expired_visibility_redelivers_with_new_receipt() -> Result<()> {
        let queue = MemoryQueue::new();
        queue.send(Bytes::from_static(b"m")).await?;

        let first = queue.receive(VISIBILITY).await?.unwrap();
        queue.expire_visibility()?;
        let second = queue.receive(VISIBILITY).await?.unwrap();

        assert_eq!(first.message_id, second.message_id);
        assert_ne!(first.pop_receipt, second.pop_receipt);
        assert_eq!(second.dequeue_count, 2);
        Ok(())
    }

    #[tokio::test]
    async fn stale_receipt_cannot_delete() -> Result<()> {
        let queue = MemoryQueue::new();
        queue.send(Bytes::from_static(b"m")).await?;

        let first = queue.receive(VISIBILITY).await?.unwrap();
        queue.expire_visibility()?;
        let _second = queue.receive(VISIBILITY).await?.unwrap();

        let err = queue
            .delete(&first.message_id, &first.pop_receipt)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReceiptMismatch { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn extend_rotates_receipt() -> Result<()> {
        let queue = MemoryQueue::new();
        queue.send(Bytes::from_static(b"m")).await?;
        let message = queue.receive(VISIBILITY).await?.unwrap();

        let rotated = queue
            .extend(&message.message_id, &message.pop_receipt, VISIBILITY)
            .await?;
        assert_ne!(rotated, message.pop_receipt);

        // The old receipt is dead; the rotated one works.
        let err = queue
            .extend(&message.message_id, &message.pop_receipt, VISIBILITY)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReceiptMismatch { .. }));
        queue.delete(&message.message_id, &rotated).await?;
        Ok(())
    }

    #[tokio::test]
    async fn delete_missing_message_is_not_found() {
        let queue = MemoryQueue::new();
        let err = queue
            .delete(&MessageId::new("gone"), &PopReceipt::new("r"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MessageNotFound { .. }));
    }

    #[tokio::test]
    async fn approximate_depth_counts_invisible_messages() -> Result<()> {
        let queue = MemoryQueue::new();
        queue.send(Bytes::from_static(b"a")).await?;
        queue.send(Bytes::from_static(b"b")).await?;
        let _held = queue.receive(VISIBILITY).await?;

        assert_eq!(queue.approximate_depth().await?, 2);
        Ok(())
    }
}
