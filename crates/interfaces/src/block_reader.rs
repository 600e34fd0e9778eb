use alloy_primitives::{Address, Bytes, B256};
use sorrel_db::{DatabaseError, DbTx};
use sorrel_primitives::{Block, BlockNumber, Header, Transaction};

/// Read access to canonical blocks and headers.
#[auto_impl::auto_impl(&, Arc)]
pub trait BlockReader: Send + Sync {
    /// The block at `number`, with senders recovered where the upstream
    /// stage has run.
    fn block_by_number(
        &self,
        tx: &dyn DbTx,
        number: BlockNumber,
    ) -> Result<Option<Block>, DatabaseError>;

    /// The header with the given hash and number.
    fn header(
        &self,
        tx: &dyn DbTx,
        hash: B256,
        number: BlockNumber,
    ) -> Result<Option<Header>, DatabaseError>;

    /// Raw encoded transactions of the block range, for change-stream
    /// notifications.
    fn raw_transactions(
        &self,
        tx: &dyn DbTx,
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<Vec<Bytes>, DatabaseError>;

    /// Highest block number covered by frozen snapshot files.
    fn frozen_blocks(&self) -> BlockNumber;

    /// Recover the sender of a transaction whose sender the upstream stage
    /// has not attached. Expensive; the driver logs every use.
    fn recover_sender(&self, transaction: &Transaction) -> Option<Address> {
        let _ = transaction;
        None
    }
}
