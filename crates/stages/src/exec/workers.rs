use crate::StageError;
use parking_lot::{Mutex, RwLock};
use sorrel_db::{Database, DbTx};
use sorrel_interfaces::{Vm, VmFactory};
use sorrel_state::{BufferedStateReader, CancelToken, QueueWithRetry, ResultsQueue, SharedState};
use sorrel_primitives::TxTask;

/// Per-worker durable read-transaction slots.
///
/// Workers exclusively own their transaction while executing; at commit time
/// the coordinator, holding the write lock, drops every slot so the workers
/// lazily reopen against the freshly committed state.
pub(crate) struct WorkerTxSlots {
    slots: Vec<Mutex<Option<Box<dyn DbTx>>>>,
}

impl std::fmt::Debug for WorkerTxSlots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerTxSlots").field("slots", &self.slots.len()).finish()
    }
}

impl WorkerTxSlots {
    pub(crate) fn new(count: usize) -> Self {
        Self { slots: (0..count).map(|_| Mutex::new(None)).collect() }
    }

    pub(crate) fn slot(&self, index: usize) -> &Mutex<Option<Box<dyn DbTx>>> {
        &self.slots[index]
    }

    /// Drop every worker transaction. Caller must hold the pipeline write
    /// lock so no worker is mid-execution.
    pub(crate) fn reset_all(&self) {
        for slot in &self.slots {
            slot.lock().take();
        }
    }
}

/// Execute a task against the shared overlay and a durable read
/// transaction, filling in its outputs.
pub(crate) fn run_tx_task(
    vm: &mut dyn Vm,
    shared: &SharedState,
    tx: &dyn DbTx,
    task: &mut TxTask,
    discard_reads: bool,
) -> Result<(), StageError> {
    task.reset_outputs();
    let mut reader = BufferedStateReader::new(shared, tx, discard_reads);
    vm.run_tx_task(task, &mut reader)?;
    task.read_set = reader.take_read_set();
    Ok(())
}

/// The designated worker used for serial execution: inline runs in the
/// sequential driver and in-place conflict resolution in the apply loop.
/// Its executions are conflict-free by construction, so read recording is
/// discarded.
pub(crate) struct ApplyWorker {
    vm: Box<dyn Vm>,
}

impl std::fmt::Debug for ApplyWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyWorker").finish_non_exhaustive()
    }
}

impl ApplyWorker {
    pub(crate) fn new(vm_factory: &dyn VmFactory) -> Self {
        Self { vm: vm_factory.create() }
    }

    pub(crate) fn run_tx_task(
        &mut self,
        shared: &SharedState,
        tx: &dyn DbTx,
        task: &mut TxTask,
    ) -> Result<(), StageError> {
        run_tx_task(&mut *self.vm, shared, tx, task, true)
    }
}

/// The speculative execution loop run by each pool worker.
///
/// Tasks are popped outside the quiesce lock and executed under its read
/// side, so the coordinator's write acquisition halts execution without
/// tearing a task in half. Results are pushed after the lock is released to
/// keep the commit path free of send-capacity deadlocks.
#[allow(clippy::too_many_arguments)]
pub(crate) fn worker_loop(
    worker_id: usize,
    quiesce: &RwLock<()>,
    cancel: &CancelToken,
    db: &dyn Database,
    slots: &WorkerTxSlots,
    shared: &SharedState,
    queue: &QueueWithRetry,
    results: &ResultsQueue,
    mut vm: Box<dyn Vm>,
) -> Result<(), StageError> {
    while let Some(mut task) = queue.pop_next(cancel) {
        {
            let _quiesce = quiesce.read();
            let mut slot = slots.slot(worker_id).lock();
            if slot.is_none() {
                *slot = Some(db.tx()?);
            }
            let tx = slot.as_deref().expect("slot populated above");
            run_tx_task(&mut *vm, shared, tx, &mut task, false)?;
        }
        if results.send(task, cancel).is_err() {
            break;
        }
    }
    Ok(())
}
