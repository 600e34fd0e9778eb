use crate::{CancelToken, Canceled};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use sorrel_primitives::TxTask;

/// Producer→worker queue with two lanes: a bounded FIFO for new tasks and an
/// unbounded FIFO for conflict retries, drained with priority.
///
/// The queue imposes no transaction-number order; ordering is restored
/// downstream by the results heap.
#[derive(Debug)]
pub struct QueueWithRetry {
    new_tx: Sender<TxTask>,
    new_rx: Receiver<TxTask>,
    retry_tx: Sender<TxTask>,
    retry_rx: Receiver<TxTask>,
    close: Mutex<Option<Sender<()>>>,
    closed_rx: Receiver<()>,
}

impl QueueWithRetry {
    /// Create a queue with the given new-lane capacity.
    pub fn new(capacity: usize) -> Self {
        let (new_tx, new_rx) = bounded(capacity);
        let (retry_tx, retry_rx) = unbounded();
        let (close_tx, closed_rx) = bounded(0);
        Self {
            new_tx,
            new_rx,
            retry_tx,
            retry_rx,
            close: Mutex::new(Some(close_tx)),
            closed_rx,
        }
    }

    /// Enqueue a new task, blocking while the lane is full.
    pub fn add(&self, task: TxTask, cancel: &CancelToken) -> Result<(), Canceled> {
        select! {
            send(self.new_tx, task) -> res => res.map_err(|_| Canceled),
            recv(cancel.channel()) -> _ => Err(Canceled),
        }
    }

    /// Enqueue a task on the retry lane. Never blocks.
    pub fn retry(&self, task: TxTask) {
        // The receiver lives as long as `self`, so this cannot fail.
        let _ = self.retry_tx.send(task);
    }

    /// Pop the next task, retries first. Blocks until a task is available;
    /// returns `None` once the queue is closed and drained, or on
    /// cancellation.
    pub fn pop_next(&self, cancel: &CancelToken) -> Option<TxTask> {
        if let Ok(task) = self.retry_rx.try_recv() {
            return Some(task);
        }
        select! {
            recv(self.retry_rx) -> task => task.ok(),
            recv(self.new_rx) -> task => task.ok(),
            recv(self.closed_rx) -> _ => {
                self.retry_rx.try_recv().or_else(|_| self.new_rx.try_recv()).ok()
            }
            recv(cancel.channel()) -> _ => None,
        }
    }

    /// Close the queue, waking all blocked consumers. Idempotent.
    pub fn close(&self) {
        self.close.lock().take();
    }

    /// Number of tasks waiting in the new lane.
    pub fn new_tasks_len(&self) -> usize {
        self.new_rx.len()
    }

    /// Number of tasks waiting in the retry lane.
    pub fn retries_len(&self) -> usize {
        self.retry_rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sorrel_primitives::{Block, TxTask};

    fn task(tx_num: u64) -> TxTask {
        TxTask::new(&Block::default(), -1, tx_num)
    }

    #[test]
    fn retries_have_priority() {
        let queue = QueueWithRetry::new(16);
        let cancel = CancelToken::new();
        queue.add(task(1), &cancel).unwrap();
        queue.retry(task(2));
        assert_eq!(queue.pop_next(&cancel).unwrap().tx_num, 2);
        assert_eq!(queue.pop_next(&cancel).unwrap().tx_num, 1);
    }

    #[test]
    fn close_wakes_and_drains() {
        let queue = QueueWithRetry::new(16);
        let cancel = CancelToken::new();
        queue.add(task(1), &cancel).unwrap();
        queue.close();
        // still drains the queued task, then reports closed
        assert_eq!(queue.pop_next(&cancel).unwrap().tx_num, 1);
        assert!(queue.pop_next(&cancel).is_none());
    }

    #[test]
    fn cancel_unblocks_consumer() {
        let queue = std::sync::Arc::new(QueueWithRetry::new(1));
        let cancel = CancelToken::new();
        let handle = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            std::thread::spawn(move || queue.pop_next(&cancel))
        };
        cancel.cancel();
        assert!(handle.join().unwrap().is_none());
    }

    #[test]
    fn queue_lengths() {
        let queue = QueueWithRetry::new(16);
        let cancel = CancelToken::new();
        queue.add(task(1), &cancel).unwrap();
        queue.add(task(2), &cancel).unwrap();
        queue.retry(task(3));
        assert_eq!(queue.new_tasks_len(), 2);
        assert_eq!(queue.retries_len(), 1);
    }
}
