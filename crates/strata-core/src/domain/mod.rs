//! Domain model (attributes, ids, task state, errors).

pub mod attributes;
pub mod errors;
pub mod ids;
pub mod state;

pub use self::attributes::TaskAttributes;
pub use self::errors::{Result, StrataError};
pub use self::ids::{DeliveryHandle, MessageId, QueueUrl};
pub use self::state::TaskState;
