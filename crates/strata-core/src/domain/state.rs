//! Task state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle of a single `Task` instance.
///
/// State transitions:
/// - Unbound -> Enqueued (sent, no delivery handle yet)
/// - Leased -> Completed
/// - Leased -> Cancelled (attributes re-enqueued as a new task)
///
/// A task obtained from a queue starts out `Leased`; `Enqueued` instances are
/// what producers get back from `BasicQueue::enqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Constructed locally, never sent.
    Unbound,

    /// Sent to a queue.
    Enqueued,

    /// Received with a delivery handle; held by a consumer.
    Leased,

    /// Acknowledged and deleted from the queue.
    Completed,

    /// Handed back to the queue.
    Cancelled,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled)
    }

    /// Can `complete` / `cancel` be called?
    pub fn is_leased(self) -> bool {
        matches!(self, TaskState::Leased)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unbound => "unbound",
            Self::Enqueued => "enqueued",
            Self::Leased => "leased",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        })
    }
}
