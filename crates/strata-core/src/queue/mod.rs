//! Queue module: the uniform task-source contract and its two variants.
//!
//! - `BasicQueue`: one backing queue (the degenerate single-level case)
//! - `PriorityQueue`: N backing queues probed in priority order
//! - `QueueRegistry`: creates and caches backing queues by name

mod basic;
mod monitor;
mod priority;
mod registry;

pub use basic::BasicQueue;
pub use priority::PriorityQueue;
pub use registry::QueueRegistry;

pub(crate) use basic::QueueCore;

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{MessageId, QueueUrl, Result, TaskAttributes};
use crate::task::Task;

/// How a task is leased on retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrieveOptions {
    /// Lease length. The task reappears in the queue if it is neither
    /// completed nor renewed within this time.
    pub timeout: Duration,

    /// Renew the lease in the background while the task is held.
    pub keep_alive: bool,

    /// Long-poll wait per probed backing queue. `None` uses the configured
    /// `receive_wait_secs`.
    pub wait: Option<Duration>,
}

impl RetrieveOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            keep_alive: false,
            wait: None,
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }
}

/// A task source. Consumers written against this trait do not care whether
/// priority levels are in play.
///
/// Retrieval never fails: transient backend errors and empty queues both
/// come back as `None`.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Lease used by `get_task`.
    fn default_task_timeout(&self) -> Duration;

    fn set_default_task_timeout(&self, timeout: Duration);

    /// URLs of the backing queues owned by this queue.
    fn list_queue_urls(&self) -> Vec<QueueUrl>;

    /// Delete every backing queue from the store.
    async fn delete_queues(&self) -> Result<()>;

    /// Approximate number of visible tasks.
    async fn num_in_queue(&self) -> Result<u64>;

    /// Add at the highest priority.
    async fn add_task(&self, attributes: TaskAttributes) -> Result<MessageId>;

    /// Add at `level`; out-of-range levels saturate to the nearest valid one.
    async fn add_task_with_priority(
        &self,
        attributes: TaskAttributes,
        level: i64,
    ) -> Result<MessageId>;

    async fn get_task(&self) -> Option<Task> {
        self.get_task_with(RetrieveOptions::new(self.default_task_timeout()))
            .await
    }

    async fn get_task_with(&self, options: RetrieveOptions) -> Option<Task>;

    /// Stop background work owned by this queue. Idempotent.
    async fn shutdown(&self);
}
