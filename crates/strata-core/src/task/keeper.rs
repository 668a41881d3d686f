//! Background lease renewal for a held task.

use std::sync::Weak;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::domain::{DeliveryHandle, Result, StrataError};
use crate::queue::QueueCore;

/// When and how often a keeper checks its lease, as fractions of the lease.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAlivePolicy {
    /// Delay before the first check.
    pub first_check: f64,
    /// Interval between later checks.
    pub period: f64,
    /// Renew once the remaining lease at the next check would drop under this.
    pub renew_below: f64,
}

impl Default for KeepAlivePolicy {
    fn default() -> Self {
        Self {
            first_check: 0.9,
            period: 0.5,
            renew_below: 0.1,
        }
    }
}

impl KeepAlivePolicy {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("first_check", self.first_check),
            ("period", self.period),
            ("renew_below", self.renew_below),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(StrataError::Configuration(format!(
                    "keep_alive.{name} must be in (0, 1], got {value}"
                )));
            }
        }
        if self.renew_below >= self.first_check {
            return Err(StrataError::Configuration(
                "keep_alive.renew_below must be smaller than first_check".into(),
            ));
        }
        Ok(())
    }

    pub fn first_check_after(&self, lease: Duration) -> Duration {
        lease.mul_f64(self.first_check)
    }

    pub fn check_period(&self, lease: Duration) -> Duration {
        lease.mul_f64(self.period)
    }

    /// `elapsed` is measured from the last grant or renewal.
    pub fn should_renew(&self, lease: Duration, elapsed: Duration) -> bool {
        let remaining = lease.saturating_sub(elapsed);
        remaining.saturating_sub(self.check_period(lease)) < lease.mul_f64(self.renew_below)
    }
}

/// Renews one lease until stopped.
///
/// Holds only a weak reference to the owning queue; the keeper ends on its
/// own if the queue goes away or the backend reports the handle stale.
/// Dropping the keeper aborts the background task.
#[derive(Debug)]
pub struct LeaseKeeper {
    shutdown_tx: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl LeaseKeeper {
    pub(crate) fn spawn(
        queue: Weak<QueueCore>,
        handle: DeliveryHandle,
        lease: Duration,
        policy: KeepAlivePolicy,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(keep_alive_loop(queue, handle, lease, policy, shutdown_rx));
        Self {
            shutdown_tx,
            join: Some(join),
        }
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    /// Stop renewing and wait for an in-flight renewal to settle.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

async fn keep_alive_loop(
    queue: Weak<QueueCore>,
    handle: DeliveryHandle,
    lease: Duration,
    policy: KeepAlivePolicy,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // interval panics on a zero period
    let period = policy.check_period(lease).max(Duration::from_millis(1));
    let first_check = Instant::now() + policy.first_check_after(lease);
    let mut ticker = tokio::time::interval_at(first_check, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut granted_at = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {}
        }
        if *shutdown_rx.borrow() {
            break;
        }
        if !policy.should_renew(lease, granted_at.elapsed()) {
            continue;
        }
        let Some(queue) = queue.upgrade() else {
            debug!(handle = %handle, "owning queue dropped, keeper exiting");
            break;
        };
        match queue.request_more_time(&handle, lease).await {
            Ok(()) => {
                granted_at = Instant::now();
                debug!(
                    queue = %queue.name(),
                    handle = %handle,
                    lease_secs = lease.as_secs(),
                    "lease renewed"
                );
            }
            Err(err) if err.is_stale() => {
                warn!(
                    queue = %queue.name(),
                    handle = %handle,
                    "lease handle is stale, keeper exiting"
                );
                break;
            }
            Err(err) => {
                warn!(
                    queue = %queue.name(),
                    handle = %handle,
                    error = %err,
                    "lease renewal failed"
                );
            }
        }
    }
}
