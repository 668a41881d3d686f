//! PriorityQueue - N backing queues probed in priority order.
//!
//! Level 0 is the highest priority. Retrieval starts at a remembered
//! `current_floor` instead of level 0 so consumers do not keep probing
//! levels they just found empty. While the floor sits above 0 a
//! `FloorMonitor` re-reads queue depths and lowers it when higher levels
//! refill.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::monitor::FloorMonitor;
use super::{BasicQueue, QueueRegistry, RetrieveOptions, TaskQueue};
use crate::config::MAX_PRIORITY_LEVELS;
use crate::domain::{MessageId, QueueUrl, Result, StrataError, TaskAttributes};
use crate::task::Task;

/// Scheduler state shared with the monitor. Every retrieval and every
/// monitor update runs under its lock.
#[derive(Debug, Default)]
pub(crate) struct SchedulerState {
    pub(crate) current_floor: usize,
    monitor: Option<FloorMonitor>,
}

#[derive(Debug)]
pub struct PriorityQueue {
    name: String,
    levels: Vec<BasicQueue>,
    state: Arc<Mutex<SchedulerState>>,
    default_timeout_ms: AtomicU64,
    poll_period_ms: AtomicU64,
}

impl PriorityQueue {
    /// Validate `levels`, then obtain `name0..name{levels-1}` from the registry.
    pub(crate) async fn open(registry: &QueueRegistry, name: &str, levels: usize) -> Result<Self> {
        if levels == 0 || levels > MAX_PRIORITY_LEVELS {
            return Err(StrataError::Configuration(format!(
                "priority levels must be in 1..={MAX_PRIORITY_LEVELS}, got {levels}"
            )));
        }

        let mut queues = Vec::with_capacity(levels);
        for level in 0..levels {
            queues.push(registry.basic_queue(&format!("{name}{level}")).await?);
        }
        info!(queue = %name, levels, "priority queue ready");

        let config = registry.config();
        Ok(Self {
            name: name.to_string(),
            levels: queues,
            state: Arc::new(Mutex::new(SchedulerState::default())),
            default_timeout_ms: AtomicU64::new(to_ms(config.default_lease())),
            poll_period_ms: AtomicU64::new(to_ms(config.monitor_poll_period())),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// The backing queue for one level.
    pub fn level(&self, level: usize) -> Option<&BasicQueue> {
        self.levels.get(level)
    }

    pub async fn current_floor(&self) -> usize {
        self.state.lock().await.current_floor
    }

    pub async fn is_monitor_running(&self) -> bool {
        self.state
            .lock()
            .await
            .monitor
            .as_ref()
            .is_some_and(FloorMonitor::is_running)
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms.load(Ordering::Relaxed))
    }

    /// Takes effect the next time the monitor starts.
    pub fn set_poll_period(&self, period: Duration) {
        self.poll_period_ms.store(to_ms(period), Ordering::Relaxed);
    }

    /// Approximate depth of one level.
    pub async fn num_in_priority(&self, level: i64) -> Result<u64> {
        let queue = usize::try_from(level)
            .ok()
            .and_then(|l| self.levels.get(l))
            .ok_or(StrataError::LevelOutOfRange {
                level,
                levels: self.levels.len(),
            })?;
        queue.num_in_queue().await
    }

    fn clamp_level(&self, level: i64) -> usize {
        let top = self.levels.len() - 1;
        usize::try_from(level.max(0)).map_or(top, |l| l.min(top))
    }

    fn start_monitor(&self, state: &mut SchedulerState) {
        if state.monitor.as_ref().is_some_and(FloorMonitor::is_running) {
            return;
        }
        state.monitor = Some(FloorMonitor::start(
            self.name.clone(),
            Arc::downgrade(&self.state),
            self.levels.clone(),
            self.poll_period(),
        ));
    }

    fn stop_monitor(&self, state: &mut SchedulerState) {
        if state.monitor.take().is_some() {
            debug!(queue = %self.name, "floor monitor stopped");
        }
    }
}

#[async_trait]
impl TaskQueue for PriorityQueue {
    fn default_task_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms.load(Ordering::Relaxed))
    }

    fn set_default_task_timeout(&self, timeout: Duration) {
        self.default_timeout_ms.store(to_ms(timeout), Ordering::Relaxed);
    }

    fn list_queue_urls(&self) -> Vec<QueueUrl> {
        self.levels.iter().map(|q| q.url().clone()).collect()
    }

    async fn delete_queues(&self) -> Result<()> {
        for queue in &self.levels {
            queue.delete_queues().await?;
        }
        Ok(())
    }

    async fn num_in_queue(&self) -> Result<u64> {
        let mut total = 0;
        for queue in &self.levels {
            total += queue.num_in_queue().await?;
        }
        Ok(total)
    }

    async fn add_task(&self, attributes: TaskAttributes) -> Result<MessageId> {
        self.levels[0].add_task(attributes).await
    }

    async fn add_task_with_priority(
        &self,
        attributes: TaskAttributes,
        level: i64,
    ) -> Result<MessageId> {
        let level = self.clamp_level(level);
        self.levels[level].add_task(attributes).await
    }

    async fn get_task_with(&self, options: RetrieveOptions) -> Option<Task> {
        let mut state = self.state.lock().await;
        let floor = state.current_floor;

        let mut hit = None;
        for level in (floor..self.levels.len()).chain(0..floor) {
            if let Some(mut task) = self.levels[level].receive(&options).await {
                task.set_level(level);
                hit = Some((level, task));
                break;
            }
        }

        match hit {
            None => {
                debug!(queue = %self.name, floor, "all levels empty");
                state.current_floor = 0;
                self.stop_monitor(&mut state);
                None
            }
            Some((0, task)) => {
                state.current_floor = 0;
                self.stop_monitor(&mut state);
                Some(task)
            }
            Some((level, task)) => {
                debug!(queue = %self.name, level, "floor raised");
                state.current_floor = level;
                self.start_monitor(&mut state);
                Some(task)
            }
        }
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        self.stop_monitor(&mut state);
        for queue in &self.levels {
            queue.shutdown().await;
        }
    }
}

fn to_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrataConfig;
    use crate::ports::QueueBackend;
    use crate::testing::RecordingBackend;
    use rstest::rstest;

    async fn open(backend: &Arc<RecordingBackend>, levels: usize) -> PriorityQueue {
        QueueRegistry::new(backend.clone(), StrataConfig::default())
            .unwrap()
            .priority_queue("jobs", levels)
            .await
            .unwrap()
    }

    fn attrs(id: &str) -> TaskAttributes {
        TaskAttributes::new().with("id", id)
    }

    fn url(level: usize) -> QueueUrl {
        QueueUrl::new(format!("memory://jobs{level}"))
    }

    #[tokio::test]
    async fn creates_one_backing_queue_per_level() {
        let backend = Arc::new(RecordingBackend::new());
        let queue = open(&backend, 3).await;
        assert_eq!(queue.num_levels(), 3);
        assert_eq!(backend.created(), vec!["jobs0", "jobs1", "jobs2"]);
        assert_eq!(queue.list_queue_urls(), vec![url(0), url(1), url(2)]);
        assert_eq!(queue.level(1).map(|q| q.name()), Some("jobs1"));
    }

    #[rstest]
    #[case(0)]
    #[case(101)]
    #[tokio::test]
    async fn invalid_level_counts_touch_nothing(#[case] levels: usize) {
        let backend = Arc::new(RecordingBackend::new());
        let registry = QueueRegistry::new(backend.clone(), StrataConfig::default()).unwrap();
        let err = registry.priority_queue("jobs", levels).await.unwrap_err();
        assert!(matches!(err, StrataError::Configuration(_)));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn hundred_levels_are_allowed() {
        let backend = Arc::new(RecordingBackend::new());
        let queue = open(&backend, 100).await;
        assert_eq!(queue.list_queue_urls().last(), Some(&url(99)));
    }

    #[rstest]
    #[case(-5, 0)]
    #[case(0, 0)]
    #[case(2, 2)]
    #[case(3, 3)]
    #[case(10, 3)]
    #[case(i64::MAX, 3)]
    #[tokio::test]
    async fn add_clamps_level(#[case] requested: i64, #[case] stored: usize) {
        let backend = Arc::new(RecordingBackend::new());
        let queue = open(&backend, 4).await;
        queue.add_task_with_priority(attrs("1"), requested).await.unwrap();
        assert_eq!(backend.sends()[0].0, url(stored));
    }

    #[tokio::test]
    async fn add_task_goes_to_level_zero() {
        let backend = Arc::new(RecordingBackend::new());
        let queue = open(&backend, 3).await;
        queue.add_task(attrs("1")).await.unwrap();
        assert_eq!(queue.num_in_priority(0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn higher_priority_comes_first() {
        let backend = Arc::new(RecordingBackend::new());
        let queue = open(&backend, 3).await;
        queue.add_task_with_priority(attrs("low"), 2).await.unwrap();
        queue.add_task_with_priority(attrs("high"), 0).await.unwrap();
        queue.add_task_with_priority(attrs("mid"), 1).await.unwrap();

        let mut order = Vec::new();
        while let Some(mut task) = queue.get_task().await {
            order.push((task.attr("id").unwrap().to_string(), task.level().unwrap()));
            task.complete().await.unwrap();
        }
        assert_eq!(
            order,
            vec![
                ("high".to_string(), 0),
                ("mid".to_string(), 1),
                ("low".to_string(), 2)
            ]
        );
    }

    #[tokio::test]
    async fn hit_above_zero_raises_floor_and_starts_monitor() {
        let backend = Arc::new(RecordingBackend::new());
        let queue = open(&backend, 5).await;
        queue.add_task_with_priority(attrs("a"), 2).await.unwrap();
        queue.add_task_with_priority(attrs("b"), 2).await.unwrap();

        queue.get_task().await.unwrap();
        assert_eq!(queue.current_floor().await, 2);
        assert!(queue.is_monitor_running().await);

        // next probe starts at the floor
        backend.clear_calls();
        let task = queue.get_task().await.unwrap();
        assert_eq!(task.level(), Some(2));
        assert_eq!(backend.receives(), vec![url(2)]);
    }

    #[tokio::test]
    async fn probe_wraps_below_floor() {
        let backend = Arc::new(RecordingBackend::new());
        let queue = open(&backend, 4).await;
        queue.add_task_with_priority(attrs("a"), 2).await.unwrap();
        queue.get_task().await.unwrap();
        assert_eq!(queue.current_floor().await, 2);

        queue.add_task_with_priority(attrs("b"), 1).await.unwrap();
        backend.clear_calls();
        let task = queue.get_task().await.unwrap();
        assert_eq!(task.level(), Some(1));
        assert_eq!(backend.receives(), vec![url(2), url(3), url(0), url(1)]);
        assert_eq!(queue.current_floor().await, 1);
    }

    #[tokio::test]
    async fn hit_at_zero_resets_floor_and_stops_monitor() {
        let backend = Arc::new(RecordingBackend::new());
        let queue = open(&backend, 3).await;
        queue.add_task_with_priority(attrs("a"), 1).await.unwrap();
        queue.get_task().await.unwrap();
        assert!(queue.is_monitor_running().await);

        queue.add_task(attrs("b")).await.unwrap();
        let task = queue.get_task().await.unwrap();
        assert_eq!(task.level(), Some(0));
        assert_eq!(queue.current_floor().await, 0);
        assert!(!queue.is_monitor_running().await);
    }

    #[tokio::test]
    async fn empty_probe_resets_floor_and_stops_monitor() {
        let backend = Arc::new(RecordingBackend::new());
        let queue = open(&backend, 3).await;
        queue.add_task_with_priority(attrs("a"), 2).await.unwrap();
        queue.get_task().await.unwrap();
        assert_eq!(queue.current_floor().await, 2);

        backend.clear_calls();
        assert!(queue.get_task().await.is_none());
        assert_eq!(backend.receives(), vec![url(2), url(0), url(1)]);
        assert_eq!(queue.current_floor().await, 0);
        assert!(!queue.is_monitor_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_lowers_floor_after_one_period() {
        let backend = Arc::new(RecordingBackend::new());
        let queue = open(&backend, 4).await;
        queue.add_task_with_priority(attrs("a"), 3).await.unwrap();
        queue.add_task_with_priority(attrs("b"), 3).await.unwrap();
        queue.get_task().await.unwrap();
        assert_eq!(queue.current_floor().await, 3);

        backend.pin_depth(&url(1), 4);
        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(queue.current_floor().await, 3);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.current_floor().await, 1);
        assert!(queue.is_monitor_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_uses_configured_period() {
        let backend = Arc::new(RecordingBackend::new());
        let queue = open(&backend, 3).await;
        queue.set_poll_period(Duration::from_secs(10));
        assert_eq!(queue.poll_period(), Duration::from_secs(10));
        queue.add_task_with_priority(attrs("a"), 2).await.unwrap();
        queue.add_task_with_priority(attrs("b"), 2).await.unwrap();
        queue.get_task().await.unwrap();

        queue.add_task(attrs("c")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(queue.current_floor().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_resets_floor_when_everything_reads_empty() {
        let backend = Arc::new(RecordingBackend::new());
        let queue = open(&backend, 3).await;
        queue.add_task_with_priority(attrs("a"), 2).await.unwrap();
        let mut task = queue.get_task().await.unwrap();
        task.complete().await.unwrap();
        assert_eq!(queue.current_floor().await, 2);

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(queue.current_floor().await, 0);
    }

    #[tokio::test]
    async fn counts_sum_levels() {
        let backend = Arc::new(RecordingBackend::new());
        let queue = open(&backend, 3).await;
        backend.pin_depth(&url(0), 3);
        backend.pin_depth(&url(1), 0);
        backend.pin_depth(&url(2), 5);
        assert_eq!(queue.num_in_queue().await.unwrap(), 8);
        assert_eq!(queue.num_in_priority(2).await.unwrap(), 5);
    }

    #[rstest]
    #[case(-1)]
    #[case(3)]
    #[tokio::test]
    async fn depth_outside_levels_is_out_of_range(#[case] level: i64) {
        let backend = Arc::new(RecordingBackend::new());
        let queue = open(&backend, 3).await;
        let err = queue.num_in_priority(level).await.unwrap_err();
        assert!(matches!(
            err,
            StrataError::LevelOutOfRange { levels: 3, .. }
        ));
    }

    #[tokio::test]
    async fn receive_failure_on_one_level_is_skipped() {
        let backend = Arc::new(RecordingBackend::new());
        let queue = open(&backend, 3).await;
        queue.add_task(attrs("stuck")).await.unwrap();
        queue.add_task_with_priority(attrs("ok"), 1).await.unwrap();
        backend.fail_receives_on(&url(0));

        let task = queue.get_task().await.unwrap();
        assert_eq!(task.attr("id"), Some("ok"));
        assert_eq!(task.level(), Some(1));
    }

    #[tokio::test]
    async fn cancel_returns_task_to_its_level() {
        let backend = Arc::new(RecordingBackend::new());
        let queue = open(&backend, 3).await;
        queue.add_task_with_priority(attrs("a"), 2).await.unwrap();

        let mut task = queue.get_task().await.unwrap();
        task.cancel().await.unwrap();
        assert_eq!(queue.num_in_priority(2).await.unwrap(), 1);
        assert_eq!(queue.num_in_priority(0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_monitor_and_is_idempotent() {
        let backend = Arc::new(RecordingBackend::new());
        let queue = open(&backend, 3).await;
        queue.add_task_with_priority(attrs("a"), 1).await.unwrap();
        queue.get_task().await.unwrap();
        assert!(queue.is_monitor_running().await);

        queue.shutdown().await;
        assert!(!queue.is_monitor_running().await);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn delete_queues_removes_every_level() {
        let backend = Arc::new(RecordingBackend::new());
        let queue = open(&backend, 3).await;
        queue.delete_queues().await.unwrap();
        assert!(backend.inner().list_queues("jobs").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn default_timeout_applies_to_every_level() {
        let backend = Arc::new(RecordingBackend::new());
        let queue = open(&backend, 2).await;
        queue.set_default_task_timeout(Duration::from_secs(15));
        queue.add_task_with_priority(attrs("a"), 1).await.unwrap();
        let task = queue.get_task().await.unwrap();
        assert_eq!(task.lease_timeout(), Some(Duration::from_secs(15)));
    }
}
