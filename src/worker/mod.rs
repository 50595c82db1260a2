//! Worker system: N concurrent consumers of the task queue.
//!
//! Core components:
//! - `state`: per-slot lifecycle (starting → running ⇄ restarting → stopped) and counters
//! - `dispatch`: one task through the pipeline under deadline and bounded retry
//! - `worker`: the dequeue loop, cooperative stop at the top of each iteration
//! - `pool`: supervision: heartbeat staleness, crash detection, restarts, stats

pub mod dispatch;
pub mod pool;
pub mod state;
pub mod worker;

pub use dispatch::{Dispatcher, RetryPolicy};
pub use pool::{PoolSettings, PoolStats, WorkerPool};
pub use state::{WorkerRecord, WorkerSlot, WorkerState};
pub use worker::{Worker, WorkerDeps};
