//! InMemoryBackend - in-process stand-in for the managed queue service.
//!
//! Models the parts of the service the core relies on:
//! - visibility timeouts (leases) with redelivery after expiry
//! - stale delivery handles
//! - message retention
//! - long polling via `Notify`
//! - optional sampled misses (a receive that returns nothing although
//!   messages exist, like a short poll that hit the wrong servers)

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::config::MAX_LEASE_SECS;
use crate::domain::{DeliveryHandle, MessageId, QueueUrl};
use crate::ports::{QueueAttributes, QueueBackend, QueueError, ReceivedMessage};

const URL_SCHEME: &str = "memory://";

/// Behavior knobs for the in-memory store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryConfig {
    /// Probability in `[0, 1]` that a receive misses even though messages
    /// are visible.
    pub miss_rate: f64,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: MessageId,
    body: String,
    sent_at: DateTime<Utc>,
    enqueued_at: Instant,
    receive_count: u32,
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    expires_at: Instant,
}

#[derive(Debug)]
struct MemQueue {
    attributes: QueueAttributes,
    visible: VecDeque<StoredMessage>,
    in_flight: HashMap<DeliveryHandle, InFlight>,
}

impl MemQueue {
    fn new() -> Self {
        Self {
            attributes: QueueAttributes::default(),
            visible: VecDeque::new(),
            in_flight: HashMap::new(),
        }
    }

    /// Return expired leases to the visible set and drop messages past
    /// retention.
    fn reclaim(&mut self, now: Instant) {
        let expired: Vec<DeliveryHandle> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.expires_at <= now)
            .map(|(h, _)| h.clone())
            .collect();
        for handle in expired {
            if let Some(flight) = self.in_flight.remove(&handle) {
                self.visible.push_back(flight.message);
            }
        }

        let retention = self.attributes.retention;
        self.visible
            .retain(|m| now.saturating_duration_since(m.enqueued_at) < retention);
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.in_flight.values().map(|f| f.expires_at).min()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    queues: HashMap<QueueUrl, MemQueue>,
}

impl MemoryState {
    fn queue_mut(&mut self, url: &QueueUrl) -> Result<&mut MemQueue, QueueError> {
        self.queues
            .get_mut(url)
            .ok_or_else(|| QueueError::QueueNotFound(url.clone()))
    }
}

/// InMemoryBackend keeps every queue in one map behind an async mutex.
///
/// Cloning is cheap and clones share the same store.
#[derive(Clone)]
pub struct InMemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    notify: Arc<Notify>,
    config: InMemoryConfig,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_config(InMemoryConfig::default())
    }

    pub fn with_config(config: InMemoryConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            notify: Arc::new(Notify::new()),
            config,
        }
    }

    fn url_for(name: &str) -> QueueUrl {
        QueueUrl::new(format!("{URL_SCHEME}{name}"))
    }

    fn sampled_miss(&self) -> bool {
        self.config.miss_rate > 0.0 && rand::random::<f64>() < self.config.miss_rate
    }

    /// Messages currently leased out (for diagnostics).
    pub async fn in_flight_count(&self, url: &QueueUrl) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let queue = state.queue_mut(url)?;
        queue.reclaim(Instant::now());
        Ok(queue.in_flight.len())
    }

    /// Attributes applied to a queue.
    pub async fn queue_attributes(&self, url: &QueueUrl) -> Result<QueueAttributes, QueueError> {
        let mut state = self.state.lock().await;
        Ok(state.queue_mut(url)?.attributes)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// The service refuses visibility timeouts above twelve hours.
fn lease_expiry(now: Instant, lease: Duration) -> Result<Instant, QueueError> {
    if lease > Duration::from_secs(MAX_LEASE_SECS) {
        return Err(QueueError::OperationFailed(format!(
            "visibility timeout {}s exceeds {MAX_LEASE_SECS}s",
            lease.as_secs()
        )));
    }
    now.checked_add(lease)
        .ok_or_else(|| QueueError::OperationFailed("visibility timeout out of range".into()))
}

#[async_trait]
impl QueueBackend for InMemoryBackend {
    async fn create_queue(&self, name: &str) -> Result<QueueUrl, QueueError> {
        if name.is_empty() {
            return Err(QueueError::OperationFailed("queue name must not be empty".into()));
        }
        let url = Self::url_for(name);
        let mut state = self.state.lock().await;
        state.queues.entry(url.clone()).or_insert_with(MemQueue::new);
        Ok(url)
    }

    async fn set_queue_attributes(
        &self,
        url: &QueueUrl,
        attributes: QueueAttributes,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.queue_mut(url)?.attributes = attributes;
        Ok(())
    }

    async fn send_message(&self, url: &QueueUrl, body: &str) -> Result<MessageId, QueueError> {
        let message_id = MessageId::generate();
        {
            let mut state = self.state.lock().await;
            let queue = state.queue_mut(url)?;
            queue.visible.push_back(StoredMessage {
                message_id: message_id.clone(),
                body: body.to_string(),
                sent_at: Utc::now(),
                enqueued_at: Instant::now(),
                receive_count: 0,
            });
        }
        // Wake long-polling receivers outside the lock.
        self.notify.notify_waiters();
        Ok(message_id)
    }

    async fn receive_message(
        &self,
        url: &QueueUrl,
        lease: Duration,
        wait: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        let deadline = Instant::now()
            .checked_add(wait)
            .ok_or_else(|| QueueError::OperationFailed("receive wait out of range".into()))?;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before looking so a send between the check and the
            // await is not lost.
            notified.as_mut().enable();

            let next_expiry = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let queue = state.queue_mut(url)?;
                queue.reclaim(now);

                if self.sampled_miss() {
                    return Ok(None);
                }

                let expires_at = lease_expiry(now, lease)?;
                if let Some(mut message) = queue.visible.pop_front() {
                    message.receive_count += 1;
                    let handle = DeliveryHandle::generate();
                    let received = ReceivedMessage {
                        message_id: message.message_id.clone(),
                        body: message.body.clone(),
                        handle: handle.clone(),
                        sent_at: message.sent_at,
                        receive_count: message.receive_count,
                    };
                    queue.in_flight.insert(
                        handle,
                        InFlight {
                            message,
                            expires_at,
                        },
                    );
                    return Ok(Some(received));
                }

                if now >= deadline {
                    return Ok(None);
                }
                queue.next_expiry()
            };

            let wake_at = next_expiry.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = &mut notified => {},
                _ = tokio::time::sleep_until(wake_at) => {},
            }
        }
    }

    async fn delete_message(
        &self,
        url: &QueueUrl,
        handle: &DeliveryHandle,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let queue = state.queue_mut(url)?;
        queue.reclaim(Instant::now());
        match queue.in_flight.remove(handle) {
            Some(_) => Ok(()),
            None => Err(QueueError::StaleHandle(handle.clone())),
        }
    }

    async fn change_visibility(
        &self,
        url: &QueueUrl,
        handle: &DeliveryHandle,
        lease: Duration,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let expires_at = lease_expiry(now, lease)?;
        let queue = state.queue_mut(url)?;
        queue.reclaim(now);
        match queue.in_flight.get_mut(handle) {
            Some(flight) => {
                flight.expires_at = expires_at;
                Ok(())
            }
            None => Err(QueueError::StaleHandle(handle.clone())),
        }
    }

    async fn approximate_depth(&self, url: &QueueUrl) -> Result<u64, QueueError> {
        let mut state = self.state.lock().await;
        let queue = state.queue_mut(url)?;
        queue.reclaim(Instant::now());
        Ok(queue.visible.len() as u64)
    }

    async fn delete_queue(&self, url: &QueueUrl) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state
            .queues
            .remove(url)
            .map(|_| ())
            .ok_or_else(|| QueueError::QueueNotFound(url.clone()))
    }

    async fn list_queues(&self, prefix: &str) -> Result<Vec<QueueUrl>, QueueError> {
        let state = self.state.lock().await;
        let mut urls: Vec<QueueUrl> = state
            .queues
            .keys()
            .filter(|url| {
                url.as_str()
                    .strip_prefix(URL_SCHEME)
                    .is_some_and(|name| name.starts_with(prefix))
            })
            .cloned()
            .collect();
        urls.sort();
        Ok(urls)
    }
}
