//! Contracts between the sorrel execution core and its collaborators.
//!
//! The execution pipeline drives a virtual machine, a block reader, a
//! history aggregator and an unwinder, but owns none of them. This crate
//! defines those seams.

#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

mod aggregator;
mod block_reader;
mod unwind;
mod vm;

pub use aggregator::{Aggregator, AggregatorStep, AGGREGATION_STEP};
pub use block_reader::BlockReader;
pub use unwind::{HeaderReporter, StateStream, Unwinder};
pub use vm::{StateReader, Vm, VmFactory};
