//! Bounded FIFO task queue: wire format, store, producer, and read-only inspection.

pub mod inspect;
pub mod producer;
pub mod store;
pub mod task;

pub use inspect::{QueueHealth, QueueStats};
pub use producer::QueueProducer;
pub use store::{MemoryTaskQueue, TaskQueue};
pub use task::{Task, TaskRecord, derive_task_id};
