//! Shared buffered state and pipeline queues for the sorrel execution
//! engine.
//!
//! Everything here sits between the block driver and the durable store:
//! [`SharedState`] is the versioned in-memory overlay all workers read
//! through, [`QueueWithRetry`] and [`ResultsQueue`] are the producer→worker
//! and worker→apply lanes, and [`ReconState`] buffers reconstitution writes
//! before they are flushed into the scratch store.

#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

mod cancel;
mod queue;
mod recon;
mod results;
mod shared;

pub use cancel::{CancelToken, Canceled};
pub use queue::QueueWithRetry;
pub use recon::ReconState;
pub use results::ResultsQueue;
pub use shared::{BufferedStateReader, SharedState};
