//! Ports - boundary to external systems.
//!
//! The only collaborator the core talks to is the message queue service.
//! Production adapters live outside this crate; `impls` holds the in-process
//! one.

pub mod backend;

pub use self::backend::{QueueAttributes, QueueBackend, QueueError, ReceivedMessage};
