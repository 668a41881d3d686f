//! Impls - port implementations that ship with the core.
//!
//! - **InMemoryBackend**: in-process queue service for tests, demos and
//!   local development
//!
//! Adapters for hosted queue services live in their own crates.

pub mod memory;

pub use self::memory::{InMemoryBackend, InMemoryConfig};
