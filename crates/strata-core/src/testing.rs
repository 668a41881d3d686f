//! Test support: an instrumented backend.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{DeliveryHandle, MessageId, QueueUrl};
use crate::impls::InMemoryBackend;
use crate::ports::{QueueAttributes, QueueBackend, QueueError, ReceivedMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    CreateQueue(String),
    SetAttributes(QueueUrl),
    Send { url: QueueUrl, body: String },
    Receive(QueueUrl),
    Delete { url: QueueUrl, handle: DeliveryHandle },
    ChangeVisibility { url: QueueUrl, handle: DeliveryHandle, lease: Duration },
    Depth(QueueUrl),
    DeleteQueue(QueueUrl),
    ListQueues(String),
}

/// Wraps `InMemoryBackend`, records every call in order and lets tests pin
/// depths or inject failures.
#[derive(Default)]
pub(crate) struct RecordingBackend {
    inner: InMemoryBackend,
    calls: Mutex<Vec<Call>>,
    pinned_depths: Mutex<HashMap<QueueUrl, u64>>,
    failing_receives: Mutex<HashSet<QueueUrl>>,
    fail_attributes: Mutex<bool>,
}

impl RecordingBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inner(&self) -> &InMemoryBackend {
        &self.inner
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Queues probed by `receive_message`, in call order.
    pub(crate) fn receives(&self) -> Vec<QueueUrl> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Receive(url) => Some(url),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn sends(&self) -> Vec<(QueueUrl, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Send { url, body } => Some((url, body)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn deletes(&self) -> Vec<(QueueUrl, DeliveryHandle)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Delete { url, handle } => Some((url, handle)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn extensions(&self) -> Vec<(DeliveryHandle, Duration)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::ChangeVisibility { handle, lease, .. } => Some((handle, lease)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn created(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::CreateQueue(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Report `depth` for `url` regardless of its contents.
    pub(crate) fn pin_depth(&self, url: &QueueUrl, depth: u64) {
        self.pinned_depths.lock().unwrap().insert(url.clone(), depth);
    }

    pub(crate) fn fail_receives_on(&self, url: &QueueUrl) {
        self.failing_receives.lock().unwrap().insert(url.clone());
    }

    pub(crate) fn fail_attribute_updates(&self) {
        *self.fail_attributes.lock().unwrap() = true;
    }
}

#[async_trait]
impl QueueBackend for RecordingBackend {
    async fn create_queue(&self, name: &str) -> Result<QueueUrl, QueueError> {
        self.record(Call::CreateQueue(name.to_string()));
        self.inner.create_queue(name).await
    }

    async fn set_queue_attributes(
        &self,
        url: &QueueUrl,
        attributes: QueueAttributes,
    ) -> Result<(), QueueError> {
        self.record(Call::SetAttributes(url.clone()));
        if *self.fail_attributes.lock().unwrap() {
            return Err(QueueError::Unavailable("attributes rejected".into()));
        }
        self.inner.set_queue_attributes(url, attributes).await
    }

    async fn send_message(&self, url: &QueueUrl, body: &str) -> Result<MessageId, QueueError> {
        self.record(Call::Send {
            url: url.clone(),
            body: body.to_string(),
        });
        self.inner.send_message(url, body).await
    }

    async fn receive_message(
        &self,
        url: &QueueUrl,
        lease: Duration,
        wait: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        self.record(Call::Receive(url.clone()));
        if self.failing_receives.lock().unwrap().contains(url) {
            return Err(QueueError::Unavailable("receive failed".into()));
        }
        self.inner.receive_message(url, lease, wait).await
    }

    async fn delete_message(
        &self,
        url: &QueueUrl,
        handle: &DeliveryHandle,
    ) -> Result<(), QueueError> {
        self.record(Call::Delete {
            url: url.clone(),
            handle: handle.clone(),
        });
        self.inner.delete_message(url, handle).await
    }

    async fn change_visibility(
        &self,
        url: &QueueUrl,
        handle: &DeliveryHandle,
        lease: Duration,
    ) -> Result<(), QueueError> {
        self.record(Call::ChangeVisibility {
            url: url.clone(),
            handle: handle.clone(),
            lease,
        });
        self.inner.change_visibility(url, handle, lease).await
    }

    async fn approximate_depth(&self, url: &QueueUrl) -> Result<u64, QueueError> {
        self.record(Call::Depth(url.clone()));
        let pinned = self.pinned_depths.lock().unwrap().get(url).copied();
        match pinned {
            Some(depth) => Ok(depth),
            None => self.inner.approximate_depth(url).await,
        }
    }

    async fn delete_queue(&self, url: &QueueUrl) -> Result<(), QueueError> {
        self.record(Call::DeleteQueue(url.clone()));
        self.inner.delete_queue(url).await
    }

    async fn list_queues(&self, prefix: &str) -> Result<Vec<QueueUrl>, QueueError> {
        self.record(Call::ListQueues(prefix.to_string()));
        self.inner.list_queues(prefix).await
    }
}
