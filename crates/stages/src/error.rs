use alloy_primitives::B256;
use sorrel_db::DatabaseError;
use sorrel_primitives::{BlockNumber, TaskError, TxNumber};
use thiserror::Error;

/// A stage execution error.
///
/// Transient read-set conflicts and sender-serialization deferrals are
/// handled in-band by the pipeline and never surface here.
#[derive(Debug, Error)]
pub enum StageError {
    /// The VM reported an error for the transaction that became
    /// next-in-order.
    #[error("execution failed in block #{block}: {source}")]
    Execution {
        /// Block containing the failing transaction.
        block: BlockNumber,
        /// The VM-reported error.
        #[source]
        source: TaskError,
    },
    /// The computed commitment does not match the header root.
    #[error("wrong trie root of block #{block}: {got}, expected {expected}")]
    RootMismatch {
        /// The offending block.
        block: BlockNumber,
        /// Commitment computed over the post-execution state.
        got: B256,
        /// Root declared by the block header.
        expected: B256,
    },
    /// The gas used by execution does not match the header.
    #[error("gas used by execution: {used}, in header: {header} (block #{block})")]
    GasMismatch {
        /// The offending block.
        block: BlockNumber,
        /// Gas consumed by executing the block.
        used: u64,
        /// Gas declared by the block header.
        header: u64,
    },
    /// A transaction number could not be mapped to a block during
    /// reconstitution.
    #[error("tx number {tx_num} not found in snapshot blocks")]
    SnapshotBoundary {
        /// The unmappable transaction number.
        tx_num: TxNumber,
    },
    /// The block reader returned no block for a canonical number.
    #[error("block #{number} not found")]
    MissingBlock {
        /// The missing block number.
        number: BlockNumber,
    },
    /// The stage encountered a database error.
    #[error("internal database error occurred: {0}")]
    Database(#[from] DatabaseError),
    /// The pipeline was cancelled. A normal exit, not logged as an error.
    #[error("cancelled")]
    Canceled,
    /// An internal pipeline channel closed unexpectedly.
    #[error("pipeline channel closed")]
    ChannelClosed,
    /// The stage encountered a fatal error.
    #[error(transparent)]
    Fatal(Box<dyn std::error::Error + Send + Sync>),
}

impl StageError {
    /// If the error is fatal the whole sync pipeline stops.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Database(_) |
                Self::SnapshotBoundary { .. } |
                Self::ChannelClosed |
                Self::Fatal(_)
        )
    }

    /// Whether the error is a cancellation, i.e. a normal exit.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl From<sorrel_state::Canceled> for StageError {
    fn from(_: sorrel_state::Canceled) -> Self {
        Self::Canceled
    }
}
