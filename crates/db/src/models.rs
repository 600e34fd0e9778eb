//! Storage models keyed into the raw-byte tables.

use crate::{tables, DatabaseError, DbTx, DbTxMut};
use sorrel_primitives::{BlockNumber, TxNumber};

/// Per-block transaction-number bookkeeping: the number assigned to the
/// block's pre-block task and the count of task slots the block occupies
/// (transactions plus the two block-boundary system calls).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoredBlockBodyIndices {
    /// Transaction number of the block's pre-block system task.
    pub first_tx_num: TxNumber,
    /// Number of task slots in the block, including both system tasks.
    pub tx_count: u64,
}

impl StoredBlockBodyIndices {
    /// Transaction number of the block's post-block system task.
    pub const fn last_tx_num(&self) -> TxNumber {
        self.first_tx_num + self.tx_count - 1
    }

    /// First transaction number of the next block.
    pub const fn next_tx_num(&self) -> TxNumber {
        self.first_tx_num + self.tx_count
    }

    /// Encode as 16 big-endian bytes.
    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.first_tx_num.to_be_bytes());
        out[8..].copy_from_slice(&self.tx_count.to_be_bytes());
        out
    }

    /// Decode from the 16-byte form.
    pub fn decode(buf: &[u8]) -> Result<Self, DatabaseError> {
        if buf.len() != 16 {
            return Err(DatabaseError::Decode { table: tables::BLOCK_BODY_INDICES });
        }
        Ok(Self {
            first_tx_num: u64::from_be_bytes(buf[..8].try_into().expect("checked length")),
            tx_count: u64::from_be_bytes(buf[8..].try_into().expect("checked length")),
        })
    }
}

/// Store the body indices of `block`.
pub fn put_block_body_indices(
    tx: &mut dyn DbTxMut,
    block: BlockNumber,
    indices: StoredBlockBodyIndices,
) -> Result<(), DatabaseError> {
    tx.put(tables::BLOCK_BODY_INDICES, &block.to_be_bytes(), &indices.encode())
}

/// Load the body indices of `block`.
pub fn block_body_indices(
    tx: &dyn DbTx,
    block: BlockNumber,
) -> Result<Option<StoredBlockBodyIndices>, DatabaseError> {
    tx.get(tables::BLOCK_BODY_INDICES, &block.to_be_bytes())?
        .map(|v| StoredBlockBodyIndices::decode(&v))
        .transpose()
}

/// Highest transaction number of `block` (its post-block system task).
pub fn max_tx_num(tx: &dyn DbTx, block: BlockNumber) -> Result<Option<TxNumber>, DatabaseError> {
    Ok(block_body_indices(tx, block)?.map(|i| i.last_tx_num()))
}

/// Lowest transaction number of `block` (its pre-block system task).
pub fn min_tx_num(tx: &dyn DbTx, block: BlockNumber) -> Result<Option<TxNumber>, DatabaseError> {
    Ok(block_body_indices(tx, block)?.map(|i| i.first_tx_num))
}

/// Find the block containing `tx_num`: the lowest block whose last
/// transaction number is at least `tx_num`. Returns `None` when `tx_num`
/// lies past the indexed chain.
pub fn find_block_num(
    tx: &dyn DbTx,
    tx_num: TxNumber,
) -> Result<Option<BlockNumber>, DatabaseError> {
    let mut found = None;
    tx.for_each(tables::BLOCK_BODY_INDICES, &[], &mut |key, value| {
        let indices = StoredBlockBodyIndices::decode(value)?;
        if indices.last_tx_num() >= tx_num && found.is_none() {
            let block = u64::from_be_bytes(
                key.try_into()
                    .map_err(|_| DatabaseError::Decode { table: tables::BLOCK_BODY_INDICES })?,
            );
            found = Some(block);
        }
        Ok(())
    })?;
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, MemDb};

    fn seed(db: &MemDb) {
        let mut tx = db.tx_mut().unwrap();
        // three blocks with 1, 3 and 0 transactions: 3, 5 and 2 task slots
        put_block_body_indices(
            &mut *tx,
            0,
            StoredBlockBodyIndices { first_tx_num: 0, tx_count: 3 },
        )
        .unwrap();
        put_block_body_indices(
            &mut *tx,
            1,
            StoredBlockBodyIndices { first_tx_num: 3, tx_count: 5 },
        )
        .unwrap();
        put_block_body_indices(
            &mut *tx,
            2,
            StoredBlockBodyIndices { first_tx_num: 8, tx_count: 2 },
        )
        .unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn tx_num_bounds() {
        let db = MemDb::new();
        seed(&db);
        let tx = db.tx().unwrap();
        assert_eq!(max_tx_num(&*tx, 0).unwrap(), Some(2));
        assert_eq!(min_tx_num(&*tx, 1).unwrap(), Some(3));
        assert_eq!(max_tx_num(&*tx, 1).unwrap(), Some(7));
        assert_eq!(max_tx_num(&*tx, 9).unwrap(), None);
    }

    #[test]
    fn find_block_by_tx_num() {
        let db = MemDb::new();
        seed(&db);
        let tx = db.tx().unwrap();
        assert_eq!(find_block_num(&*tx, 0).unwrap(), Some(0));
        assert_eq!(find_block_num(&*tx, 2).unwrap(), Some(0));
        assert_eq!(find_block_num(&*tx, 3).unwrap(), Some(1));
        assert_eq!(find_block_num(&*tx, 9).unwrap(), Some(2));
        assert_eq!(find_block_num(&*tx, 10).unwrap(), None);
    }
}
