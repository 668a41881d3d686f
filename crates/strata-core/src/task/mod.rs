//! Task: a unit of work with string attributes and a lease lifecycle.
//!
//! A task is `Unbound` until it is enqueued, `Leased` while a consumer holds
//! it, and ends `Completed` or `Cancelled`. Completing or cancelling anything
//! other than a leased task is a contract violation.

mod keeper;

pub use keeper::{KeepAlivePolicy, LeaseKeeper};

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::{
    DeliveryHandle, MessageId, Result, StrataError, TaskAttributes, TaskState,
};
use crate::ports::ReceivedMessage;
use crate::queue::QueueCore;

/// Everything a leased task knows about where it came from.
#[derive(Debug)]
struct Lease {
    handle: DeliveryHandle,
    timeout: Duration,
    level: usize,
    sent_at: DateTime<Utc>,
    receive_count: u32,
    queue: Weak<QueueCore>,
}

#[derive(Debug)]
pub struct Task {
    attributes: TaskAttributes,
    state: TaskState,
    message_id: Option<MessageId>,
    lease: Option<Lease>,
    keeper: Option<LeaseKeeper>,
}

impl Task {
    pub fn new(attributes: TaskAttributes) -> Self {
        Self {
            attributes,
            state: TaskState::Unbound,
            message_id: None,
            lease: None,
            keeper: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self::new(TaskAttributes::from_json(json)?))
    }

    pub(crate) fn leased(
        attributes: TaskAttributes,
        message: ReceivedMessage,
        timeout: Duration,
        queue: Weak<QueueCore>,
    ) -> Self {
        Self {
            attributes,
            state: TaskState::Leased,
            message_id: Some(message.message_id),
            lease: Some(Lease {
                handle: message.handle,
                timeout,
                level: 0,
                sent_at: message.sent_at,
                receive_count: message.receive_count,
                queue,
            }),
            keeper: None,
        }
    }

    pub(crate) fn mark_enqueued(&mut self, message_id: MessageId) {
        self.state = TaskState::Enqueued;
        self.message_id = Some(message_id);
    }

    pub(crate) fn set_level(&mut self, level: usize) {
        if let Some(lease) = self.lease.as_mut() {
            lease.level = level;
        }
    }

    pub(crate) fn start_keep_alive(&mut self, policy: KeepAlivePolicy) {
        let Some(lease) = self.lease.as_ref() else {
            return;
        };
        if lease.timeout.is_zero() {
            // nothing left to renew; the message is already visible again
            debug!(handle = %lease.handle, "zero lease, keep-alive skipped");
            return;
        }
        self.keeper = Some(LeaseKeeper::spawn(
            lease.queue.clone(),
            lease.handle.clone(),
            lease.timeout,
            policy,
        ));
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key)
    }

    pub fn attr_keys(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys()
    }

    pub fn attributes(&self) -> &TaskAttributes {
        &self.attributes
    }

    pub fn to_json(&self) -> Result<String> {
        self.attributes.to_json()
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn message_id(&self) -> Option<&MessageId> {
        self.message_id.as_ref()
    }

    pub fn delivery_handle(&self) -> Option<&DeliveryHandle> {
        self.lease.as_ref().map(|l| &l.handle)
    }

    pub fn lease_timeout(&self) -> Option<Duration> {
        self.lease.as_ref().map(|l| l.timeout)
    }

    /// Priority level the task was read from; 0 for single-level queues.
    pub fn level(&self) -> Option<usize> {
        self.lease.as_ref().map(|l| l.level)
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.lease.as_ref().map(|l| l.sent_at)
    }

    /// How many times the backend has handed this message out, this time included.
    pub fn receive_count(&self) -> Option<u32> {
        self.lease.as_ref().map(|l| l.receive_count)
    }

    pub fn is_kept_alive(&self) -> bool {
        self.keeper.as_ref().is_some_and(LeaseKeeper::is_running)
    }

    /// Remove the task from its queue for good.
    pub async fn complete(&mut self) -> Result<()> {
        let (queue, handle) = self.finish(TaskState::Completed).await?;
        queue.delete_task(&handle).await
    }

    /// Hand the task back: delete this delivery and enqueue the same
    /// attributes again on the level it was read from. Returns the id of
    /// the new message.
    pub async fn cancel(&mut self) -> Result<MessageId> {
        let (queue, handle) = self.finish(TaskState::Cancelled).await?;
        queue.delete_task(&handle).await?;
        let message_id = queue.send_attributes(&self.attributes).await?;
        debug!(queue = %queue.name(), message_id = %message_id, "task handed back");
        Ok(message_id)
    }

    /// Move to a terminal state and stop renewal. The state changes before
    /// any backend call, so a failed delete still cannot be retried through
    /// this task.
    async fn finish(&mut self, next: TaskState) -> Result<(Arc<QueueCore>, DeliveryHandle)> {
        if !self.state.is_leased() {
            return Err(StrataError::ContractViolation(format!(
                "cannot move a {} task to {next}",
                self.state
            )));
        }
        let lease = self.lease.as_ref().ok_or_else(|| {
            StrataError::ContractViolation("leased task has no delivery handle".into())
        })?;
        let queue = lease.queue.upgrade().ok_or_else(|| {
            StrataError::ContractViolation("owning queue has been dropped".into())
        })?;
        let handle = lease.handle.clone();
        self.state = next;
        if let Some(keeper) = self.keeper.take() {
            keeper.stop().await;
        }
        Ok((queue, handle))
    }
}
