//! BasicQueue - one backing queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{RetrieveOptions, TaskQueue};
use crate::config::MAX_LEASE_SECS;
use crate::domain::{
    DeliveryHandle, MessageId, QueueUrl, Result, StrataError, TaskAttributes, TaskState,
};
use crate::ports::{QueueBackend, QueueError};
use crate::task::{KeepAlivePolicy, Task};

/// Shared state behind a `BasicQueue`. Leased tasks hold a weak reference to
/// it so they can delete, renew or re-enqueue themselves.
pub(crate) struct QueueCore {
    name: String,
    url: QueueUrl,
    backend: Arc<dyn QueueBackend>,
    default_timeout_ms: AtomicU64,
    receive_wait: Duration,
    keep_alive: KeepAlivePolicy,
}

impl std::fmt::Debug for QueueCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueCore")
            .field("name", &self.name)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl QueueCore {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) async fn send_attributes(&self, attributes: &TaskAttributes) -> Result<MessageId> {
        let body = attributes.to_json()?;
        Ok(self.backend.send_message(&self.url, &body).await?)
    }

    /// Delete one delivery. A stale handle means the lease already lapsed;
    /// the message will be redelivered and there is nothing to undo here.
    pub(crate) async fn delete_task(&self, handle: &DeliveryHandle) -> Result<()> {
        match self.backend.delete_message(&self.url, handle).await {
            Ok(()) => {
                debug!(queue = %self.name, handle = %handle, "task deleted");
                Ok(())
            }
            Err(err) if err.is_stale() => {
                warn!(queue = %self.name, handle = %handle, "delete with stale handle ignored");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) async fn request_more_time(
        &self,
        handle: &DeliveryHandle,
        lease: Duration,
    ) -> Result<(), QueueError> {
        self.backend.change_visibility(&self.url, handle, lease).await
    }
}

/// A task queue over a single backing queue.
///
/// Cheap to clone; clones share the backing queue and default timeout.
#[derive(Debug, Clone)]
pub struct BasicQueue {
    core: Arc<QueueCore>,
}

impl BasicQueue {
    pub(crate) fn new(
        name: &str,
        url: QueueUrl,
        backend: Arc<dyn QueueBackend>,
        default_timeout: Duration,
        receive_wait: Duration,
        keep_alive: KeepAlivePolicy,
    ) -> Self {
        Self {
            core: Arc::new(QueueCore {
                name: name.to_string(),
                url,
                backend,
                default_timeout_ms: AtomicU64::new(duration_to_ms(default_timeout)),
                receive_wait,
                keep_alive,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn url(&self) -> &QueueUrl {
        &self.core.url
    }

    /// Put an unbound task on the queue and bind it.
    pub async fn enqueue(&self, task: &mut Task) -> Result<MessageId> {
        if task.state() != TaskState::Unbound {
            return Err(StrataError::ContractViolation(format!(
                "only unbound tasks can be enqueued, task is {}",
                task.state()
            )));
        }
        let message_id = self.core.send_attributes(task.attributes()).await?;
        task.mark_enqueued(message_id.clone());
        Ok(message_id)
    }

    /// One receive attempt. Failures and undecodable bodies read as a miss.
    ///
    /// Leases longer than `MAX_LEASE_SECS` are capped.
    pub(crate) async fn receive(&self, options: &RetrieveOptions) -> Option<Task> {
        let core = &self.core;
        let lease = options.timeout.min(Duration::from_secs(MAX_LEASE_SECS));
        if lease < options.timeout {
            debug!(
                queue = %core.name,
                requested_secs = options.timeout.as_secs(),
                lease_secs = lease.as_secs(),
                "lease capped"
            );
        }
        let message = match core
            .backend
            .receive_message(&core.url, lease, options.wait.unwrap_or(core.receive_wait))
            .await
        {
            Ok(Some(message)) => message,
            Ok(None) => return None,
            Err(err) => {
                warn!(queue = %core.name, error = %err, "receive failed, treating as empty");
                return None;
            }
        };

        let attributes = match TaskAttributes::from_json(&message.body) {
            Ok(attributes) => attributes,
            Err(err) => {
                warn!(
                    queue = %core.name,
                    message_id = %message.message_id,
                    error = %err,
                    "undecodable task body, leaving it to reappear"
                );
                return None;
            }
        };

        debug!(queue = %core.name, message_id = %message.message_id, "task leased");
        let mut task = Task::leased(attributes, message, lease, Arc::downgrade(core));
        if options.keep_alive {
            task.start_keep_alive(core.keep_alive);
        }
        Some(task)
    }
}

#[async_trait]
impl TaskQueue for BasicQueue {
    fn default_task_timeout(&self) -> Duration {
        Duration::from_millis(self.core.default_timeout_ms.load(Ordering::Relaxed))
    }

    fn set_default_task_timeout(&self, timeout: Duration) {
        self.core
            .default_timeout_ms
            .store(duration_to_ms(timeout), Ordering::Relaxed);
    }

    fn list_queue_urls(&self) -> Vec<QueueUrl> {
        vec![self.core.url.clone()]
    }

    async fn delete_queues(&self) -> Result<()> {
        self.core.backend.delete_queue(&self.core.url).await?;
        debug!(queue = %self.core.name, "backing queue deleted");
        Ok(())
    }

    async fn num_in_queue(&self) -> Result<u64> {
        Ok(self.core.backend.approximate_depth(&self.core.url).await?)
    }

    async fn add_task(&self, attributes: TaskAttributes) -> Result<MessageId> {
        self.enqueue(&mut Task::new(attributes)).await
    }

    /// A single backing queue has one level; every priority lands on it.
    async fn add_task_with_priority(
        &self,
        attributes: TaskAttributes,
        _level: i64,
    ) -> Result<MessageId> {
        self.add_task(attributes).await
    }

    async fn get_task_with(&self, options: RetrieveOptions) -> Option<Task> {
        self.receive(&options).await
    }

    async fn shutdown(&self) {
        debug!(queue = %self.core.name, "shutdown: no background work");
    }
}

fn duration_to_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
