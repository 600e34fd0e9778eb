use crate::{Block, Header, Transaction, TxMessage};
use alloy_primitives::{Address, Bytes, B256};
use std::{collections::HashMap, sync::Arc};

/// A key into the flat state: an account, one of its storage slots, or its
/// contract code.
///
/// The byte encoding (`[tag | address | slot]`) is stable and is used both as
/// the in-memory overlay key and as durable-store key material, so it must
/// never change for persisted data to stay readable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateKey {
    /// Account data (balance, nonce, code hash) of an address.
    Account(Address),
    /// A single storage slot of an account.
    Storage(Address, B256),
    /// Contract code of an address.
    Code(Address),
}

impl StateKey {
    const ACCOUNT_TAG: u8 = 0;
    const STORAGE_TAG: u8 = 1;
    const CODE_TAG: u8 = 2;

    /// Encode the key into its stable byte form.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Account(address) => {
                let mut out = Vec::with_capacity(21);
                out.push(Self::ACCOUNT_TAG);
                out.extend_from_slice(address.as_slice());
                out
            }
            Self::Storage(address, slot) => {
                let mut out = Vec::with_capacity(53);
                out.push(Self::STORAGE_TAG);
                out.extend_from_slice(address.as_slice());
                out.extend_from_slice(slot.as_slice());
                out
            }
            Self::Code(address) => {
                let mut out = Vec::with_capacity(21);
                out.push(Self::CODE_TAG);
                out.extend_from_slice(address.as_slice());
                out
            }
        }
    }

    /// Decode a key from its byte form. Returns `None` for malformed input.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let (&tag, rest) = buf.split_first()?;
        match tag {
            Self::ACCOUNT_TAG if rest.len() == 20 => {
                Some(Self::Account(Address::from_slice(rest)))
            }
            Self::STORAGE_TAG if rest.len() == 52 => Some(Self::Storage(
                Address::from_slice(&rest[..20]),
                B256::from_slice(&rest[20..]),
            )),
            Self::CODE_TAG if rest.len() == 20 => Some(Self::Code(Address::from_slice(rest))),
            _ => None,
        }
    }

    /// Whether this key addresses contract code.
    pub const fn is_code(&self) -> bool {
        matches!(self, Self::Code(_))
    }
}

/// The set of state keys a task observed during speculative execution,
/// together with the value (or absence) it saw for each.
pub type ReadSet = HashMap<StateKey, Option<Bytes>>;

/// The set of state keys a task modified, with the new value. `None` means
/// the key was deleted.
pub type WriteSet = HashMap<StateKey, Option<Bytes>>;

/// An error reported by the virtual machine for a single task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    /// Human readable reason.
    pub message: String,
}

impl TaskError {
    /// Create a new task error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// One unit of work for the execution pipeline: a pre-block system call
/// (`tx_index == -1`), a transaction, or the post-block finalization call
/// (`tx_index == txs.len()`).
///
/// Inputs are filled by the block driver; outputs (`gas_used`, `error`,
/// read/write sets, logs) are populated by the worker that executes the
/// task and are never mutated afterwards. A retry clears them wholesale
/// first.
#[derive(Debug)]
pub struct TxTask {
    /// Number of the containing block.
    pub block_num: u64,
    /// Index within the block. `-1` is the pre-block system call,
    /// `txs.len()` the post-block finalization call.
    pub tx_index: i32,
    /// Dense monotone transaction number across the whole chain.
    pub tx_num: u64,
    /// Header of the containing block.
    pub header: Header,
    /// Hash of the containing block.
    pub block_hash: B256,
    /// State root declared by the containing block's header.
    pub block_root: B256,
    /// All transactions of the block; shared between the block's tasks.
    pub txs: Arc<Vec<Transaction>>,
    /// Ommer headers of the block.
    pub ommers: Arc<Vec<Header>>,
    /// Withdrawals of the block.
    pub withdrawals: Arc<Vec<crate::Withdrawal>>,
    /// Decoded message, present for transaction tasks only.
    pub message: Option<TxMessage>,
    /// Recovered sender, present for transaction tasks only.
    pub sender: Option<Address>,
    /// Whether this is the post-block finalization task.
    pub is_final: bool,

    /// Gas used, populated by the worker.
    pub gas_used: u64,
    /// VM-reported error, populated by the worker.
    pub error: Option<TaskError>,
    /// Keys read during speculative execution, populated by the worker.
    pub read_set: ReadSet,
    /// Keys written during speculative execution, populated by the worker.
    pub write_set: WriteSet,
    /// Encoded logs emitted by the task, populated by the worker.
    pub logs: Vec<Bytes>,
}

impl TxTask {
    /// Build the task at `tx_index` of `block`, carrying `tx_num`.
    ///
    /// For transaction tasks the caller still needs to fill in
    /// [`message`](Self::message) and [`sender`](Self::sender).
    pub fn new(block: &Block, tx_index: i32, tx_num: u64) -> Self {
        Self {
            block_num: block.number(),
            tx_index,
            tx_num,
            header: block.header.clone(),
            block_hash: block.hash_slow(),
            block_root: block.header.state_root,
            txs: Arc::new(block.body.clone()),
            ommers: Arc::new(block.ommers.clone()),
            withdrawals: Arc::new(block.withdrawals.clone()),
            message: None,
            sender: None,
            is_final: tx_index >= 0 && tx_index as usize == block.body.len(),
            gas_used: 0,
            error: None,
            read_set: ReadSet::default(),
            write_set: WriteSet::default(),
            logs: Vec::new(),
        }
    }

    /// The transaction this task executes, if it is a transaction task.
    pub fn transaction(&self) -> Option<&Transaction> {
        usize::try_from(self.tx_index).ok().and_then(|i| self.txs.get(i))
    }

    /// Whether this is the pre-block or post-block system task.
    pub const fn is_system(&self) -> bool {
        self.tx_index < 0 || self.is_final
    }

    /// Clear all worker-produced outputs, making the task safe to re-execute.
    pub fn reset_outputs(&mut self) {
        self.gas_used = 0;
        self.error = None;
        self.read_set.clear();
        self.write_set.clear();
        self.logs.clear();
    }
}
