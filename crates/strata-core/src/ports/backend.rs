//! QueueBackend port - the managed message queue service.
//!
//! Everything the core needs from the store: durable insert, leased receive,
//! delete, lease extension, approximate depth and queue administration.
//! Implementations own credentials and transport.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{DeliveryHandle, MessageId, QueueUrl};

/// Failures reported by a backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The delivery handle expired or was already acknowledged.
    #[error("stale delivery handle: {0}")]
    StaleHandle(DeliveryHandle),

    #[error("queue not found: {0}")]
    QueueNotFound(QueueUrl),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    OperationFailed(String),
}

impl QueueError {
    /// Soft condition: the message may already have been redelivered.
    pub fn is_stale(&self) -> bool {
        matches!(self, QueueError::StaleHandle(_))
    }
}

/// Per-queue policy applied right after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueAttributes {
    /// How long an unconsumed message is kept.
    pub retention: Duration,

    /// Lease applied when a receive does not ask for one.
    pub default_visibility: Duration,
}

impl Default for QueueAttributes {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(1_209_600),
            default_visibility: Duration::from_secs(180),
        }
    }
}

/// One leased message.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub body: String,
    pub handle: DeliveryHandle,
    pub sent_at: DateTime<Utc>,
    /// 1 on first delivery; grows with every redelivery.
    pub receive_count: u32,
}

/// QueueBackend is the narrow contract of the backing store.
///
/// # Delivery semantics
/// - at-least-once: a message may be received again after its lease expires
/// - `receive_message` returning `None` means "nothing this time", not
///   "the queue is empty"
/// - `approximate_depth` is eventually consistent
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Create the queue or return the existing one under that name.
    async fn create_queue(&self, name: &str) -> Result<QueueUrl, QueueError>;

    async fn set_queue_attributes(
        &self,
        url: &QueueUrl,
        attributes: QueueAttributes,
    ) -> Result<(), QueueError>;

    async fn send_message(&self, url: &QueueUrl, body: &str) -> Result<MessageId, QueueError>;

    /// Lease at most one message for `lease`. Waits up to `wait` for one to
    /// arrive; a zero wait returns immediately.
    async fn receive_message(
        &self,
        url: &QueueUrl,
        lease: Duration,
        wait: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError>;

    async fn delete_message(&self, url: &QueueUrl, handle: &DeliveryHandle)
    -> Result<(), QueueError>;

    /// Reset the lease so the message stays invisible for `lease` from now.
    async fn change_visibility(
        &self,
        url: &QueueUrl,
        handle: &DeliveryHandle,
        lease: Duration,
    ) -> Result<(), QueueError>;

    async fn approximate_depth(&self, url: &QueueUrl) -> Result<u64, QueueError>;

    async fn delete_queue(&self, url: &QueueUrl) -> Result<(), QueueError>;

    /// URLs of all queues whose name starts with `prefix`.
    async fn list_queues(&self, prefix: &str) -> Result<Vec<QueueUrl>, QueueError>;
}
