use crate::{CancelToken, Canceled, QueueWithRetry};
use alloy_primitives::{Address, Bytes, B256};
use parking_lot::RwLock;
use sorrel_db::{tables, DatabaseError, DbTx};
use sorrel_interfaces::{Aggregator, StateReader};
use sorrel_primitives::{ReadSet, StateKey, TxNumber, TxTask};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

/// Fixed per-entry bookkeeping overhead in the size estimate.
const ENTRY_OVERHEAD: u64 = 32;

#[derive(Debug, Clone)]
struct VersionedValue {
    value: Option<Bytes>,
    #[allow(dead_code)]
    tx_num: TxNumber,
}

#[derive(Debug, Default)]
struct StateInner {
    /// Writes of applied tasks pending flush, keyed by the state-key
    /// encoding. Latest writer wins; the apply loop guarantees ascending
    /// transaction numbers.
    overlay: HashMap<Vec<u8>, VersionedValue>,
    /// Highest in-flight transaction number per sender.
    sender_tx: HashMap<Address, TxNumber>,
    /// Tasks deferred behind an earlier in-flight transaction of the same
    /// sender, keyed by the transaction number whose commit releases them.
    triggers: HashMap<TxNumber, TxTask>,
}

/// The shared in-memory overlay over the durable store.
///
/// All workers read through it, the apply loop is its single writer, and the
/// commit coordinator clears it after every flush. A read returns the value
/// produced by the highest-numbered applied transaction that wrote the key,
/// or falls through to the durable store.
#[derive(Debug, Default)]
pub struct SharedState {
    inner: RwLock<StateInner>,
    size_estimate: AtomicU64,
    done_count: AtomicU64,
}

impl SharedState {
    /// Create an empty overlay.
    pub fn new() -> Self {
        Self::default()
    }

    /// The overlay's current value for the encoded key, if any task wrote
    /// it since the last flush.
    pub fn latest(&self, key: &[u8]) -> Option<Option<Bytes>> {
        self.inner.read().overlay.get(key).map(|v| v.value.clone())
    }

    /// Validate a task's read set against the overlay: `false` if any
    /// observed value has since been overwritten.
    ///
    /// Keys absent from the overlay were read from the durable store, which
    /// does not change within an execution window, so they cannot conflict.
    pub fn reads_valid(&self, read_set: &ReadSet) -> bool {
        let inner = self.inner.read();
        read_set.iter().all(|(key, observed)| {
            match inner.overlay.get(&key.encode()) {
                Some(current) => current.value == *observed,
                None => true,
            }
        })
    }

    /// Merge a task's write set into the overlay and forward the changes to
    /// the aggregator's WAL. Must only be called by the apply loop, in
    /// transaction-number order.
    pub fn apply_state(
        &self,
        task: &TxTask,
        aggregator: &dyn Aggregator,
    ) -> Result<(), DatabaseError> {
        let mut added = 0u64;
        {
            let mut inner = self.inner.write();
            for (key, value) in &task.write_set {
                let encoded = key.encode();
                added += encoded.len() as u64
                    + value.as_ref().map_or(0, |v| v.len() as u64)
                    + ENTRY_OVERHEAD;
                inner.overlay.insert(
                    encoded,
                    VersionedValue { value: value.clone(), tx_num: task.tx_num },
                );
            }
        }
        self.size_estimate.fetch_add(added, Ordering::Relaxed);
        aggregator.absorb_changes(task)
    }

    /// Forward a task's logs and traces to the aggregator's history WAL.
    pub fn apply_logs_and_traces(
        &self,
        task: &TxTask,
        aggregator: &dyn Aggregator,
    ) -> Result<(), DatabaseError> {
        aggregator.apply_history(task)
    }

    /// Mark `tx_num` applied: release a task deferred behind it (returning
    /// the number of tasks promoted to the retry lane) and clear the
    /// sender's in-flight slot.
    pub fn commit_tx_num(
        &self,
        sender: Option<Address>,
        tx_num: TxNumber,
        queue: &QueueWithRetry,
    ) -> u64 {
        self.done_count.fetch_add(1, Ordering::Relaxed);
        let mut triggered = 0;
        let mut inner = self.inner.write();
        if let Some(task) = inner.triggers.remove(&tx_num) {
            queue.retry(task);
            triggered += 1;
        }
        if let Some(sender) = sender {
            if inner.sender_tx.get(&sender) == Some(&tx_num) {
                inner.sender_tx.remove(&sender);
            }
        }
        triggered
    }

    /// Attempt to mark the task's sender in-flight. Returns the task back
    /// when admitted; parks it behind the sender's earlier in-flight
    /// transaction otherwise.
    ///
    /// Transactions of one sender have an obvious data dependency on each
    /// other, so dispatching them concurrently would only produce conflicts.
    pub fn register_sender(&self, task: TxTask) -> Option<TxTask> {
        let sender = match task.sender {
            Some(sender) => sender,
            None => return Some(task),
        };
        let mut inner = self.inner.write();
        match inner.sender_tx.insert(sender, task.tx_num) {
            Some(blocking_tx_num) => {
                inner.triggers.insert(blocking_tx_num, task);
                None
            }
            None => Some(task),
        }
    }

    /// Clear a task's outputs and push it back onto the retry lane.
    pub fn retry(&self, mut task: TxTask, queue: &QueueWithRetry) {
        task.reset_outputs();
        queue.retry(task);
    }

    /// Enqueue a task for the worker pool, blocking on backpressure.
    pub fn add_work(
        &self,
        task: TxTask,
        queue: &QueueWithRetry,
        cancel: &CancelToken,
    ) -> Result<(), Canceled> {
        queue.add(task, cancel)
    }

    /// Estimated byte size of the buffered overlay.
    pub fn size_estimate(&self) -> u64 {
        self.size_estimate.load(Ordering::Relaxed)
    }

    /// Number of applied tasks since creation.
    pub fn done_count(&self) -> u64 {
        self.done_count.load(Ordering::Relaxed)
    }

    /// Drop the overlay after its contents have been flushed through the
    /// aggregator into the durable store.
    pub fn clear_overlay(&self) {
        self.inner.write().overlay.clear();
        self.size_estimate.store(0, Ordering::Relaxed);
    }
}

/// State reader used by the execution workers: overlay first, then the
/// worker's read-only durable transaction. Every read is recorded into a
/// read-set buffer unless discarding is requested; the apply worker
/// discards, since its executions are conflict-free by construction.
pub struct BufferedStateReader<'a> {
    state: &'a SharedState,
    tx: &'a dyn DbTx,
    read_set: ReadSet,
    discard_reads: bool,
}

impl<'a> BufferedStateReader<'a> {
    /// Create a reader over the overlay and a durable read transaction.
    pub fn new(state: &'a SharedState, tx: &'a dyn DbTx, discard_reads: bool) -> Self {
        Self { state, tx, read_set: ReadSet::default(), discard_reads }
    }

    /// Take the recorded read set, leaving the buffer empty.
    pub fn take_read_set(&mut self) -> ReadSet {
        std::mem::take(&mut self.read_set)
    }

    fn lookup(
        &mut self,
        key: StateKey,
        table: &'static str,
    ) -> Result<Option<Bytes>, DatabaseError> {
        let encoded = key.encode();
        let value = match self.state.latest(&encoded) {
            Some(value) => value,
            None => self.tx.get(table, &encoded)?.map(Bytes::from),
        };
        if !self.discard_reads {
            self.read_set.insert(key, value.clone());
        }
        Ok(value)
    }
}

impl StateReader for BufferedStateReader<'_> {
    fn read_account(&mut self, address: Address) -> Result<Option<Bytes>, DatabaseError> {
        self.lookup(StateKey::Account(address), tables::PLAIN_STATE)
    }

    fn read_storage(
        &mut self,
        address: Address,
        slot: B256,
    ) -> Result<Option<Bytes>, DatabaseError> {
        self.lookup(StateKey::Storage(address, slot), tables::PLAIN_STATE)
    }

    fn read_code(&mut self, address: Address) -> Result<Option<Bytes>, DatabaseError> {
        self.lookup(StateKey::Code(address), tables::CODE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sorrel_db::{Database, MemDb};
    use sorrel_primitives::{Block, WriteSet};

    /// Aggregator double that only counts absorbed tasks.
    #[derive(Default)]
    struct NoopAggregator(AtomicU64);

    impl Aggregator for NoopAggregator {
        fn set_tx_num(&self, _: u64) {}
        fn set_block_num(&self, _: u64) {}
        fn absorb_changes(&self, _: &TxTask) -> Result<(), DatabaseError> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        fn apply_state(&self, _: &TxTask) -> Result<(), DatabaseError> {
            Ok(())
        }
        fn apply_history(&self, _: &TxTask) -> Result<(), DatabaseError> {
            Ok(())
        }
        fn flush(&self, _: &mut dyn sorrel_db::DbTxMut) -> Result<(), DatabaseError> {
            Ok(())
        }
        fn can_prune(&self, _: &dyn DbTx) -> bool {
            false
        }
        fn prune(&self, _: &mut dyn sorrel_db::DbTxMut, _: u64) -> Result<(), DatabaseError> {
            Ok(())
        }
        fn compute_commitment(&self, _: bool) -> Result<B256, DatabaseError> {
            Ok(B256::ZERO)
        }
        fn build_files_in_background(&self, _: u64) {}
        fn has_background_files_build(&self) -> bool {
            false
        }
        fn background_progress(&self) -> String {
            String::new()
        }
        fn keep_in_db(&self, _: u64) {}
        fn merge_loop(&self) -> Result<(), DatabaseError> {
            Ok(())
        }
        fn make_steps(
            &self,
        ) -> Result<Vec<Box<dyn sorrel_interfaces::AggregatorStep>>, DatabaseError> {
            Ok(Vec::new())
        }
        fn enable_madv_normal(&self) {}
        fn disable_read_ahead(&self) {}
    }

    fn addr(n: u8) -> Address {
        Address::from([n; 20])
    }

    fn task_with_writes(tx_num: u64, writes: WriteSet) -> TxTask {
        let mut task = TxTask::new(&Block::default(), -1, tx_num);
        task.write_set = writes;
        task
    }

    #[test]
    fn overlay_read_and_validation() {
        let state = SharedState::new();
        let agg = NoopAggregator::default();
        let key = StateKey::Account(addr(1));

        let mut writes = WriteSet::default();
        writes.insert(key.clone(), Some(Bytes::from_static(b"v1")));
        state.apply_state(&task_with_writes(5, writes), &agg).unwrap();

        assert_eq!(state.latest(&key.encode()), Some(Some(Bytes::from_static(b"v1"))));

        // a read that observed the durable store (key absent) is invalid now
        let mut stale = ReadSet::default();
        stale.insert(key.clone(), None);
        assert!(!state.reads_valid(&stale));

        // a read that observed the overlay value is valid
        let mut fresh = ReadSet::default();
        fresh.insert(key.clone(), Some(Bytes::from_static(b"v1")));
        assert!(state.reads_valid(&fresh));

        // unrelated keys never conflict
        let mut unrelated = ReadSet::default();
        unrelated.insert(StateKey::Account(addr(9)), None);
        assert!(state.reads_valid(&unrelated));
    }

    #[test]
    fn size_estimate_grows_and_clears() {
        let state = SharedState::new();
        let agg = NoopAggregator::default();
        let mut writes = WriteSet::default();
        writes.insert(StateKey::Account(addr(1)), Some(Bytes::from_static(b"value")));
        state.apply_state(&task_with_writes(1, writes), &agg).unwrap();
        assert!(state.size_estimate() > 0);
        state.clear_overlay();
        assert_eq!(state.size_estimate(), 0);
    }

    #[test]
    fn sender_serialization_defers_and_releases() {
        let state = SharedState::new();
        let queue = QueueWithRetry::new(16);

        let mut first = TxTask::new(&Block::default(), 0, 10);
        first.sender = Some(addr(1));
        let mut second = TxTask::new(&Block::default(), 1, 11);
        second.sender = Some(addr(1));

        let first = state.register_sender(first).expect("first admitted");
        assert!(state.register_sender(second).is_none(), "second deferred");

        // committing the first transaction promotes the deferred one
        let triggered = state.commit_tx_num(first.sender, first.tx_num, &queue);
        assert_eq!(triggered, 1);
        assert_eq!(queue.retries_len(), 1);
    }

    #[test]
    fn commit_tx_num_counts_done() {
        let state = SharedState::new();
        let queue = QueueWithRetry::new(16);
        assert_eq!(state.commit_tx_num(None, 1, &queue), 0);
        assert_eq!(state.done_count(), 1);
    }

    #[test]
    fn buffered_reader_records_reads() {
        let db = MemDb::new();
        let key = StateKey::Account(addr(2));
        let mut rw = db.tx_mut().unwrap();
        rw.put(tables::PLAIN_STATE, &key.encode(), b"stored").unwrap();
        rw.commit().unwrap();

        let state = SharedState::new();
        let ro = db.tx().unwrap();
        let mut reader = BufferedStateReader::new(&state, &*ro, false);
        let value = reader.read_account(addr(2)).unwrap();
        assert_eq!(value, Some(Bytes::from_static(b"stored")));

        let read_set = reader.take_read_set();
        assert_eq!(read_set.get(&key), Some(&Some(Bytes::from_static(b"stored"))));
    }

    #[test]
    fn buffered_reader_prefers_overlay() {
        let db = MemDb::new();
        let state = SharedState::new();
        let agg = NoopAggregator::default();
        let key = StateKey::Storage(addr(3), B256::from([1u8; 32]));
        let mut writes = WriteSet::default();
        writes.insert(key.clone(), Some(Bytes::from_static(b"new")));
        state.apply_state(&task_with_writes(4, writes), &agg).unwrap();

        let ro = db.tx().unwrap();
        let mut reader = BufferedStateReader::new(&state, &*ro, true);
        let value = reader.read_storage(addr(3), B256::from([1u8; 32])).unwrap();
        assert_eq!(value, Some(Bytes::from_static(b"new")));
        // discard mode keeps no read set
        assert!(reader.take_read_set().is_empty());
    }
}
