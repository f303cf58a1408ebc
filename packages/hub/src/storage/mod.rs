pub mod queue;
pub mod store;

pub use queue::{EnqueueOpts, Queue, QueueConfig, QueueError, QueueMessage};
pub use store::{JobFilter, Store, StoreError};
