use alloy_primitives::{keccak256, Bytes};
use parking_lot::RwLock;
use sorrel_db::{tables, DatabaseError, DbTxMut};
use sorrel_primitives::{StateKey, TxNumber, TxTask};
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

const ENTRY_OVERHEAD: u64 = 32;

#[derive(Debug, Default)]
struct ReconBuffers {
    /// Account and storage writes, keyed `[tx_num(8) | state key]`.
    /// `None` is a tombstone destined for the delete table.
    plain_state: BTreeMap<Vec<u8>, Option<Bytes>>,
    /// Code writes, keyed like `plain_state`.
    code: BTreeMap<Vec<u8>, Option<Bytes>>,
    /// Code-hash writes derived from `code`, keyed like `plain_state`.
    plain_contract: BTreeMap<Vec<u8>, Option<Bytes>>,
}

/// Replayed state collected during reconstitution, buffered in RAM and
/// flushed into the scratch store's `*R`/`*D` tables when the size estimate
/// crosses the commit threshold.
///
/// No conflict detection happens here: the replay bitmap guarantees tasks
/// are disjoint against already-materialized history, so workers apply their
/// results directly.
#[derive(Debug, Default)]
pub struct ReconState {
    inner: RwLock<ReconBuffers>,
    size_estimate: AtomicU64,
    done_count: AtomicU64,
    max_tx_num: AtomicU64,
}

impl ReconState {
    /// Create an empty buffer set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb a completed task's write set.
    pub fn collect(&self, task: &TxTask) {
        let mut added = 0u64;
        {
            let mut inner = self.inner.write();
            for (key, value) in &task.write_set {
                let mut scratch_key = Vec::with_capacity(8 + 53);
                scratch_key.extend_from_slice(&task.tx_num.to_be_bytes());
                scratch_key.extend_from_slice(&key.encode());
                added += scratch_key.len() as u64
                    + value.as_ref().map_or(0, |v| v.len() as u64)
                    + ENTRY_OVERHEAD;
                if key.is_code() {
                    let code_hash =
                        value.as_ref().map(|code| Bytes::copy_from_slice(keccak256(code).as_slice()));
                    inner.plain_contract.insert(scratch_key.clone(), code_hash);
                    inner.code.insert(scratch_key, value.clone());
                } else {
                    inner.plain_state.insert(scratch_key, value.clone());
                }
            }
        }
        self.size_estimate.fetch_add(added, Ordering::Relaxed);
        self.done_count.fetch_add(1, Ordering::Relaxed);
        self.max_tx_num.fetch_max(task.tx_num, Ordering::Relaxed);
    }

    /// Write all buffered entries into the scratch store and reset the
    /// buffers. Values land in the `*R` tables, tombstones in the `*D`
    /// tables.
    pub fn flush(&self, tx: &mut dyn DbTxMut) -> Result<(), DatabaseError> {
        let mut inner = self.inner.write();
        let buffers = [
            (std::mem::take(&mut inner.plain_state), tables::PLAIN_STATE_R, tables::PLAIN_STATE_D),
            (std::mem::take(&mut inner.code), tables::CODE_R, tables::CODE_D),
            (
                std::mem::take(&mut inner.plain_contract),
                tables::PLAIN_CONTRACT_R,
                tables::PLAIN_CONTRACT_D,
            ),
        ];
        for (buffer, values_table, tombstones_table) in buffers {
            for (key, value) in buffer {
                match value {
                    Some(value) => tx.put(values_table, &key, &value)?,
                    None => tx.put(tombstones_table, &key, &[])?,
                }
            }
        }
        self.size_estimate.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Estimated byte size of the buffered writes.
    pub fn size_estimate(&self) -> u64 {
        self.size_estimate.load(Ordering::Relaxed)
    }

    /// Number of tasks absorbed since creation.
    pub fn done_count(&self) -> u64 {
        self.done_count.load(Ordering::Relaxed)
    }

    /// Highest transaction number absorbed so far.
    pub fn max_tx_num(&self) -> TxNumber {
        self.max_tx_num.load(Ordering::Relaxed)
    }
}
