//! strata-core
//!
//! Priority task queues over a leased message store.
//!
//! # Modules
//! - **domain**: attributes, ids, task state, errors
//! - **ports**: the message-store boundary (`QueueBackend`)
//! - **impls**: in-process backend
//! - **queue**: `TaskQueue` contract, `BasicQueue`, `PriorityQueue`, `QueueRegistry`
//! - **task**: `Task` lifecycle and lease keep-alive
//! - **worker**: `WorkerGroup` consuming any `TaskQueue`
//! - **config**: construction-time settings

pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod queue;
pub mod task;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::StrataConfig;
pub use domain::{StrataError, TaskAttributes, TaskState};
pub use queue::{BasicQueue, PriorityQueue, QueueRegistry, RetrieveOptions, TaskQueue};
pub use task::{KeepAlivePolicy, Task};
pub use worker::{TaskHandler, WorkerGroup};
