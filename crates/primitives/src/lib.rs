//! Commonly used types for the sorrel execution engine.
//!
//! This crate contains the block and transaction model consumed by the
//! execution stage, the [`TxTask`] unit of work that flows through the
//! parallel pipeline, and stage bookkeeping types.

#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

mod block;
mod stage;
mod task;

pub use block::{Block, Header, Transaction, TxMessage, Withdrawal};
pub use stage::{StageCheckpoint, StageId, EXECUTION};
pub use task::{ReadSet, StateKey, TaskError, TxTask, WriteSet};

/// An Ethereum-style block number.
pub type BlockNumber = u64;

/// A dense monotone number assigned to every unit of execution (pre-block
/// call, each transaction, post-block call) across the entire chain.
pub type TxNumber = u64;
