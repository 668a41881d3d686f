use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant, sleep};
use tracing::{info, warn};

use strata_core::impls::InMemoryBackend;
use strata_core::{
    QueueRegistry, RetrieveOptions, StrataConfig, StrataError, Task, TaskAttributes, TaskHandler,
    TaskQueue, WorkerGroup,
};

const LEVELS: usize = 3;
const TASKS: u32 = 30;

/// Resizes nothing, but fails the first attempt of every `flaky` task so
/// the hand-back path shows up in the logs.
struct ResizeHandler {
    handled: AtomicU32,
    failed_once: Mutex<HashSet<String>>,
    per_level: [AtomicU32; LEVELS],
}

impl ResizeHandler {
    fn new() -> Self {
        Self {
            handled: AtomicU32::new(0),
            failed_once: Mutex::new(HashSet::new()),
            per_level: Default::default(),
        }
    }
}

#[async_trait]
impl TaskHandler for ResizeHandler {
    async fn handle(&self, task: &Task) -> Result<(), StrataError> {
        let image = task.attr("image").unwrap_or("?").to_string();
        if task.attr("flaky") == Some("yes") {
            let first = self
                .failed_once
                .lock()
                .map_err(|_| StrataError::Handler("handler state poisoned".into()))?
                .insert(image.clone());
            if first {
                return Err(StrataError::Handler(format!("{image}: transient failure")));
            }
        }

        sleep(Duration::from_millis(20)).await;
        let level = task.level().unwrap_or(0).min(LEVELS - 1);
        self.per_level[level].fetch_add(1, Ordering::Relaxed);
        self.handled.fetch_add(1, Ordering::Relaxed);
        info!(image = %image, level, receive_count = ?task.receive_count(), "resized");
        Ok(())
    }
}

#[derive(Serialize)]
struct DrainReport {
    queue: String,
    levels: usize,
    enqueued: u32,
    handled: u32,
    handled_per_level: Vec<u32>,
    remaining: u64,
    elapsed_ms: u128,
}

fn install_tracing(config: &StrataConfig) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let env_filter = tracing_subscriber::EnvFilter::new(&filter);
    if config.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}

fn load_config() -> Result<StrataConfig, StrataError> {
    match std::env::var("STRATA_CONFIG") {
        Ok(path) => StrataConfig::from_path(path),
        Err(_) => Ok(StrataConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    install_tracing(&config);

    let registry = QueueRegistry::new(Arc::new(InMemoryBackend::new()), config)?;
    let queue = Arc::new(registry.priority_queue("thumbnails", LEVELS).await?);

    for i in 0..TASKS {
        let mut attrs = TaskAttributes::new().with("image", format!("img-{i:03}.png"));
        if i % 7 == 0 {
            attrs.insert("flaky", "yes");
        }
        queue.add_task_with_priority(attrs, i64::from(i) % LEVELS as i64).await?;
    }
    info!(tasks = TASKS, levels = LEVELS, "tasks enqueued");

    let started = Instant::now();
    let handler = Arc::new(ResizeHandler::new());
    let workers = WorkerGroup::spawn(
        4,
        queue.clone(),
        handler.clone(),
        Some(RetrieveOptions::new(Duration::from_secs(30)).with_keep_alive(true)),
        Duration::from_millis(50),
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, stopping workers");
                break;
            }
            _ = sleep(Duration::from_millis(100)) => {}
        }
        if handler.handled.load(Ordering::Relaxed) >= TASKS && queue.num_in_queue().await? == 0 {
            break;
        }
    }

    workers.shutdown_and_join().await;
    queue.shutdown().await;

    let report = DrainReport {
        queue: queue.name().to_string(),
        levels: queue.num_levels(),
        enqueued: TASKS,
        handled: handler.handled.load(Ordering::Relaxed),
        handled_per_level: handler
            .per_level
            .iter()
            .map(|n| n.load(Ordering::Relaxed))
            .collect(),
        remaining: queue.num_in_queue().await?,
        elapsed_ms: started.elapsed().as_millis(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
