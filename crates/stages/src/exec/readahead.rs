use crossbeam_channel::{bounded, select, Receiver, Sender};
use sorrel_db::{tables, Database, DatabaseError, DbTx};
use sorrel_interfaces::BlockReader;
use sorrel_primitives::{BlockNumber, StateKey};
use sorrel_state::CancelToken;
use std::thread::Scope;

/// How far ahead of the driver the prefetchers run.
const READ_AHEAD_BLOCKS: u64 = 100;

/// Blocks between read-transaction refreshes in a prefetch worker.
const TX_REFRESH_INTERVAL: usize = 100;

/// Handle to the background block prefetchers. Dropping it closes the feed
/// and lets the workers exit.
#[derive(Debug)]
pub(crate) struct ReadAhead {
    sender: Sender<BlockNumber>,
}

impl ReadAhead {
    /// Tell the prefetchers the driver reached `block`. Never blocks; a
    /// full feed just means the prefetchers are already far enough ahead.
    pub(crate) fn notify(&self, block: BlockNumber) {
        let _ = self.sender.try_send(block);
    }
}

/// Spawn the prefetch pool.
///
/// Snapshots are often stored on cheap drives and exceed RAM, so OS-level
/// readahead does not apply; instead the pool touches sender and recipient
/// accounts and their code for blocks up to [`READ_AHEAD_BLOCKS`] ahead,
/// warming the page cache.
pub(crate) fn spawn_read_ahead<'scope, 'env>(
    scope: &'scope Scope<'scope, 'env>,
    db: &'env dyn Database,
    block_reader: &'env dyn BlockReader,
    workers: usize,
    cancel: &'env CancelToken,
) -> ReadAhead {
    let (sender, receiver) = bounded(READ_AHEAD_BLOCKS as usize);
    for _ in 0..workers {
        let receiver = receiver.clone();
        scope.spawn(move || read_ahead_worker(db, block_reader, receiver, cancel));
    }
    ReadAhead { sender }
}

fn read_ahead_worker(
    db: &dyn Database,
    block_reader: &dyn BlockReader,
    feed: Receiver<BlockNumber>,
    cancel: &CancelToken,
) {
    let mut tx: Option<Box<dyn DbTx>> = None;
    let mut processed = 0usize;
    loop {
        let block = select! {
            recv(feed) -> block => match block {
                Ok(block) => block,
                Err(_) => return,
            },
            recv(cancel.channel()) -> _ => return,
        };
        if processed % TX_REFRESH_INTERVAL == 0 {
            tx = db.tx().ok();
        }
        processed += 1;
        if let Some(tx) = tx.as_deref() {
            // Prefetch failures only cost warm-up; never surface them.
            let _ = prefetch_block(tx, block_reader, block + READ_AHEAD_BLOCKS);
        }
    }
}

fn prefetch_block(
    tx: &dyn DbTx,
    block_reader: &dyn BlockReader,
    block_num: BlockNumber,
) -> Result<(), DatabaseError> {
    let Some(block) = block_reader.block_by_number(tx, block_num)? else {
        return Ok(());
    };
    for transaction in &block.body {
        if let Some(sender) = transaction.sender {
            touch_account(tx, sender)?;
        }
        if let Some(to) = transaction.to {
            touch_account(tx, to)?;
        }
    }
    touch_account(tx, block.header.beneficiary)?;
    Ok(())
}

fn touch_account(tx: &dyn DbTx, address: alloy_primitives::Address) -> Result<(), DatabaseError> {
    if tx.get(tables::PLAIN_STATE, &StateKey::Account(address).encode())?.is_some() {
        tx.get(tables::CODE, &StateKey::Code(address).encode())?;
    }
    Ok(())
}
