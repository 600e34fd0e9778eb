use crate::{CancelToken, Canceled};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use sorrel_primitives::{TxNumber, TxTask};
use std::collections::BinaryHeap;

/// Heap entry ordered so that the smallest transaction number surfaces
/// first.
struct MinTxNum(TxTask);

impl PartialEq for MinTxNum {
    fn eq(&self, other: &Self) -> bool {
        self.0.tx_num == other.0.tx_num
    }
}
impl Eq for MinTxNum {}
impl PartialOrd for MinTxNum {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for MinTxNum {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.0.tx_num.cmp(&self.0.tx_num)
    }
}
impl std::fmt::Debug for MinTxNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MinTxNum").field(&self.0.tx_num).finish()
    }
}

/// Completed tasks on their way from the workers to the apply loop: a
/// bounded result channel absorbed into a min-heap keyed by transaction
/// number.
///
/// Only the task whose number matches the next expected output is ever
/// yielded, so the apply loop observes results in strict
/// transaction-number order no matter how workers finish.
#[derive(Debug)]
pub struct ResultsQueue {
    results_tx: Sender<TxTask>,
    results_rx: Receiver<TxTask>,
    heap: Mutex<BinaryHeap<MinTxNum>>,
    limit: usize,
}

impl ResultsQueue {
    /// Create a results queue with the given channel capacity and heap soft
    /// limit.
    pub fn new(channel_capacity: usize, limit: usize) -> Self {
        let (results_tx, results_rx) = bounded(channel_capacity);
        Self { results_tx, results_rx, heap: Mutex::new(BinaryHeap::new()), limit }
    }

    /// Send a completed task towards the apply loop. Blocks while the
    /// channel is full.
    pub fn send(&self, task: TxTask, cancel: &CancelToken) -> Result<(), Canceled> {
        select! {
            send(self.results_tx, task) -> res => res.map_err(|_| Canceled),
            recv(cancel.channel()) -> _ => Err(Canceled),
        }
    }

    /// Block until at least one result is available, then absorb every
    /// result that is ready into the heap.
    pub fn drain(&self, cancel: &CancelToken) -> Result<(), Canceled> {
        select! {
            recv(self.results_rx) -> task => {
                if let Ok(task) = task {
                    self.heap.lock().push(MinTxNum(task));
                }
            }
            recv(cancel.channel()) -> _ => return Err(Canceled),
        }
        self.drain_non_blocking();
        Ok(())
    }

    /// Absorb every result that is ready, without blocking.
    pub fn drain_non_blocking(&self) {
        let mut heap = self.heap.lock();
        while let Ok(task) = self.results_rx.try_recv() {
            heap.push(MinTxNum(task));
        }
    }

    /// Pop the next result if its transaction number does not exceed
    /// `expected`.
    pub fn next_if(&self, expected: TxNumber) -> Option<TxTask> {
        let mut heap = self.heap.lock();
        if heap.peek().is_some_and(|top| top.0.tx_num <= expected) {
            return heap.pop().map(|entry| entry.0);
        }
        None
    }

    /// Drop every buffered result (heap and channel), handing each to `f`.
    /// Used at commit time because read sets do not carry over.
    pub fn drop_results(&self, mut f: impl FnMut(TxTask)) {
        let mut heap = self.heap.lock();
        while let Ok(task) = self.results_rx.try_recv() {
            f(task);
        }
        for entry in heap.drain() {
            f(entry.0);
        }
    }

    /// Number of results buffered in the heap.
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Whether the heap is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Soft limit on the heap size, used by the driver for backpressure.
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Number of results sitting in the channel, not yet absorbed.
    pub fn result_ch_len(&self) -> usize {
        self.results_rx.len()
    }

    /// Capacity of the result channel.
    pub fn result_ch_cap(&self) -> usize {
        self.results_rx.capacity().unwrap_or_default()
    }
}
