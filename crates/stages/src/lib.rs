//! Staged execution for sorrel: the parallel transaction execution pipeline
//! and the state reconstitution engine.
//!
//! Both subsystems share one design: speculative execution of transactions
//! by a worker pool against a versioned in-memory state, conflict detection
//! by read-set validation, serial commit in transaction-number order, and
//! periodic flush to durable storage.

#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

mod config;
mod error;
pub mod exec;
mod metrics;
mod progress;
pub mod recon;
mod stage;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::ExecConfig;
pub use error::StageError;
pub use exec::ExecutionStage;
pub use recon::reconstitute_state;
pub use stage::{stage_checkpoint, save_stage_checkpoint, ExecOutput};

/// Capacity of the producer→worker task queue.
pub const TASK_QUEUE_CAPACITY: usize = 100_000;

/// Soft limit on the results heap, used by the driver for backpressure.
pub const RESULTS_HEAP_LIMIT: usize = 10_000;

/// Change-stream notifications are only emitted when syncing fewer than
/// this many blocks from the head.
pub const STATE_STREAM_LIMIT: u64 = 1024;
