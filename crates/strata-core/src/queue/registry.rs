//! QueueRegistry - creates backing queues once and hands out shared handles.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{BasicQueue, PriorityQueue};
use crate::config::StrataConfig;
use crate::domain::{QueueUrl, Result, StrataError};
use crate::ports::QueueBackend;

/// Process-wide cache of backing queues keyed by name.
///
/// Asking twice for the same name yields handles over the same queue, and
/// the create-and-configure round trip happens once. Cheap to clone.
#[derive(Clone)]
pub struct QueueRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    backend: Arc<dyn QueueBackend>,
    config: StrataConfig,
    queues: Mutex<HashMap<String, BasicQueue>>,
}

impl QueueRegistry {
    pub fn new(backend: Arc<dyn QueueBackend>, config: StrataConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RegistryInner {
                backend,
                config,
                queues: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &StrataConfig {
        &self.inner.config
    }

    /// Get or create the backing queue `name`.
    ///
    /// The lock is held across creation so concurrent callers never both
    /// create. A failure leaves nothing cached.
    pub async fn basic_queue(&self, name: &str) -> Result<BasicQueue> {
        let mut queues = self.inner.queues.lock().await;
        if let Some(queue) = queues.get(name) {
            return Ok(queue.clone());
        }

        let config = &self.inner.config;
        let url = self.inner.backend.create_queue(name).await.map_err(|e| {
            StrataError::Configuration(format!("cannot create queue {name}: {e}"))
        })?;
        self.inner
            .backend
            .set_queue_attributes(&url, config.queue_attributes())
            .await
            .map_err(|e| {
                StrataError::Configuration(format!("cannot configure queue {name}: {e}"))
            })?;
        info!(queue = %name, url = %url, "backing queue ready");

        let queue = BasicQueue::new(
            name,
            url,
            Arc::clone(&self.inner.backend),
            config.default_lease(),
            config.receive_wait(),
            config.keep_alive,
        );
        queues.insert(name.to_string(), queue.clone());
        Ok(queue)
    }

    /// Build a priority queue named `name` with `levels` levels.
    pub async fn priority_queue(&self, name: &str, levels: usize) -> Result<PriorityQueue> {
        PriorityQueue::open(self, name, levels).await
    }

    /// Names of every queue this registry has set up, sorted.
    pub async fn cached_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.queues.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Ask the store for every queue whose name starts with `prefix`,
    /// including ones this process never opened.
    pub async fn list_backend_queues(&self, prefix: &str) -> Result<Vec<QueueUrl>> {
        let urls = self.inner.backend.list_queues(prefix).await?;
        debug!(prefix = %prefix, count = urls.len(), "listed backend queues");
        Ok(urls)
    }
}
