use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::StrataError;
use crate::queue::{RetrieveOptions, TaskQueue};
use crate::task::Task;

/// Work done for one task. `Ok` completes the task, `Err` hands it back.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<(), StrataError>;
}

/// Worker group handle.
/// - `request_shutdown` stops every worker after its current task
/// - dropping the group stops workers the next time they find the queue empty
/// - `shutdown_and_join` waits for every worker to finish its current task
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers pulling from `queue`.
    ///
    /// `options` picks the lease for each retrieval; `None` uses the
    /// queue's default timeout without keep-alive. Workers that find the
    /// queue empty sleep `idle_backoff` before probing again.
    pub fn spawn(
        n: usize,
        queue: Arc<dyn TaskQueue>,
        handler: Arc<dyn TaskHandler>,
        options: Option<RetrieveOptions>,
        idle_backoff: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let q = Arc::clone(&queue);
            let h = Arc::clone(&handler);
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                worker_loop(worker_id, q, h, options, idle_backoff, &mut rx).await;
            });
            joins.push(join);
        }
        info!(workers = n, "worker group started");

        Self { shutdown_tx, joins }
    }

    /// Stop taking new leases. Tasks already being handled run to the end.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            let _ = j.await;
        }
        info!("worker group stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<dyn TaskQueue>,
    handler: Arc<dyn TaskHandler>,
    options: Option<RetrieveOptions>,
    idle_backoff: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // not raced against shutdown: dropping a receive mid-flight would
        // strand its lease until expiry
        let task = match options {
            Some(options) => queue.get_task_with(options).await,
            None => queue.get_task().await,
        };

        let Some(mut task) = task else {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(idle_backoff) => {}
            }
            continue;
        };

        match handler.handle(&task).await {
            Ok(()) => {
                if let Err(e) = task.complete().await {
                    warn!(worker_id, error = %e, "complete failed");
                }
            }
            Err(err) => {
                warn!(
                    worker_id,
                    error = %err,
                    level = ?task.level(),
                    "handler failed, handing task back"
                );
                match task.cancel().await {
                    Ok(message_id) => {
                        debug!(worker_id, message_id = %message_id, "task re-enqueued")
                    }
                    Err(e) => warn!(worker_id, error = %e, "hand-back failed"),
                }
            }
        }
    }
    debug!(worker_id, "worker exiting");
}
