//! FloorMonitor - periodically lowers the scheduler floor to the highest
//! non-empty priority level.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::priority::SchedulerState;
use super::{BasicQueue, TaskQueue};
use crate::domain::Result;

/// Handle to the running monitor task. Dropping it aborts the task.
#[derive(Debug)]
pub(crate) struct FloorMonitor {
    join: JoinHandle<()>,
}

impl FloorMonitor {
    pub(crate) fn start(
        name: String,
        state: Weak<Mutex<SchedulerState>>,
        levels: Vec<BasicQueue>,
        period: Duration,
    ) -> Self {
        debug!(queue = %name, period_secs = period.as_secs(), "floor monitor started");
        let join = tokio::spawn(monitor_loop(name, state, levels, period));
        Self { join }
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.join.is_finished()
    }
}

impl Drop for FloorMonitor {
    fn drop(&mut self) {
        self.join.abort();
    }
}

async fn monitor_loop(
    name: String,
    state: Weak<Mutex<SchedulerState>>,
    levels: Vec<BasicQueue>,
    period: Duration,
) {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let floor = match lowest_non_empty(&levels).await {
            Ok(floor) => floor,
            Err(err) => {
                warn!(queue = %name, error = %err, "depth read failed, floor unchanged");
                continue;
            }
        };
        let Some(state) = state.upgrade() else {
            break;
        };
        let mut state = state.lock().await;
        if state.current_floor != floor {
            debug!(queue = %name, from = state.current_floor, floor, "floor moved by monitor");
        }
        state.current_floor = floor;
    }
}

/// Index of the first level with visible tasks, or 0 when all are empty.
pub(crate) async fn lowest_non_empty(levels: &[BasicQueue]) -> Result<usize> {
    for (level, queue) in levels.iter().enumerate() {
        if queue.num_in_queue().await? > 0 {
            return Ok(level);
        }
    }
    Ok(0)
}
