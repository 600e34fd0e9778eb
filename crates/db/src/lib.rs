//! Transactional key-value store abstraction for sorrel.
//!
//! The execution engine only depends on the small transactional surface in
//! [`Database`], [`DbTx`] and [`DbTxMut`]; the concrete store lives behind
//! these traits. The crate ships [`MemDb`], a snapshot-isolated in-memory
//! implementation used by the test-suite and as the reconstitution scratch
//! store.

#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

mod error;
mod mem;
pub mod models;
pub mod tables;
mod transaction;

pub use error::DatabaseError;
pub use mem::MemDb;
pub use transaction::{Database, DbTx, DbTxMut};
