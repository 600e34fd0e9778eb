//! The transaction execution stage.
//!
//! Two modes share one engine. The parallel pipeline runs speculative
//! workers against the shared overlay, validates read sets at the serial
//! apply boundary and commits at block boundaries; the sequential pipeline
//! runs every task inline through the apply worker and checks the state
//! root after every block. Layered buffering is the same in both: task
//! write sets merge into the shared overlay, the overlay forwards into the
//! aggregator's WAL, and the WAL flushes into the durable store at commit.

mod readahead;
pub(crate) mod workers;

use crate::{
    error::StageError,
    metrics::ExecMetrics,
    progress::Progress,
    stage::{save_stage_checkpoint, stage_checkpoint, ExecOutput},
    ExecConfig, RESULTS_HEAP_LIMIT, STATE_STREAM_LIMIT, TASK_QUEUE_CAPACITY,
};
use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::{Mutex, RwLock};
use readahead::spawn_read_ahead;
use sorrel_db::{models, Database, DbTx, DbTxMut};
use sorrel_interfaces::{
    Aggregator, BlockReader, HeaderReporter, StateStream, Unwinder, VmFactory, AGGREGATION_STEP,
};
use sorrel_primitives::{
    Block, BlockNumber, StageCheckpoint, TxMessage, TxNumber, TxTask, EXECUTION,
};
use sorrel_state::{CancelToken, QueueWithRetry, ResultsQueue, SharedState};
use std::{
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{Scope, ScopedJoinHandle},
    time::Instant,
};
use tracing::{debug, error, info, warn};
use workers::{worker_loop, ApplyWorker, WorkerTxSlots};

/// A container for the stage's read-write transaction that opens a new one
/// when the current one is committed.
// NOTE: needed because `DbTxMut::commit` consumes the transaction, while the
// commit sites only hold a mutable reference to the stage's handle.
pub(crate) struct StageTx<'db> {
    db: &'db dyn Database,
    tx: Option<Box<dyn DbTxMut>>,
}

impl<'db> StageTx<'db> {
    pub(crate) fn new(db: &'db dyn Database) -> Result<Self, StageError> {
        Ok(Self { db, tx: Some(db.tx_mut()?) })
    }

    /// Commit the current inner transaction and open a new one.
    pub(crate) fn commit(&mut self) -> Result<(), StageError> {
        if let Some(tx) = self.tx.take() {
            tx.commit()?;
        }
        self.tx = Some(self.db.tx_mut()?);
        Ok(())
    }
}

impl std::ops::Deref for StageTx<'_> {
    type Target = dyn DbTxMut;

    /// # Panics
    ///
    /// Panics if the inner transaction does not exist; that cannot happen
    /// unless `commit` itself failed mid-way.
    fn deref(&self) -> &Self::Target {
        &**self.tx.as_ref().expect("stage transaction is always open")
    }
}

impl std::ops::DerefMut for StageTx<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.tx.as_mut().expect("stage transaction is always open")
    }
}

/// Restores the aggregator's keep-in-db policy when the stage leaves the
/// frozen-block range.
struct KeepInDbGuard<'a> {
    aggregator: &'a dyn Aggregator,
}

impl Drop for KeepInDbGuard<'_> {
    fn drop(&mut self) {
        self.aggregator.keep_in_db(AGGREGATION_STEP);
    }
}

/// Build the task at `tx_index` of `block`, recovering the sender lazily if
/// the upstream stage has not attached it.
pub(crate) fn build_task(
    block: &Block,
    tx_index: i32,
    tx_num: TxNumber,
    block_reader: &dyn BlockReader,
    require_sender: bool,
) -> Result<TxTask, StageError> {
    let mut task = TxTask::new(block, tx_index, tx_num);
    if let Some(transaction) = task.transaction().cloned() {
        let sender = match transaction.sender {
            Some(sender) => Some(sender),
            None if require_sender => {
                warn!(
                    target: "sync::stages::execution",
                    block = task.block_num,
                    tx_idx = task.tx_index,
                    "Expensive lazy sender recovery"
                );
                block_reader.recover_sender(&transaction)
            }
            None => None,
        };
        if require_sender && sender.is_none() {
            return Err(StageError::Fatal(
                format!("no sender for tx {} in block {}", task.tx_index, task.block_num).into(),
            ));
        }
        if let Some(sender) = sender {
            task.message = Some(TxMessage {
                from: sender,
                to: transaction.to,
                nonce: transaction.nonce,
                gas_limit: transaction.gas_limit,
                value: transaction.value,
                data: transaction.input.clone(),
            });
            task.sender = Some(sender);
        }
    }
    Ok(task)
}

/// What one pass over the contiguous prefix of the results heap did.
#[derive(Debug, Default)]
struct ProcessOutcome {
    /// The next expected transaction number after this pass.
    output_tx_num: TxNumber,
    /// Tasks applied.
    applied: u64,
    /// Conflicts encountered (re-executed in place or retried).
    conflicts: u64,
    /// Deferred same-sender tasks promoted to the retry lane.
    triggers: u64,
    /// Block of the last applied task.
    processed_block_num: Option<BlockNumber>,
    /// Whether the last applied task closed its block.
    stopped_at_block_end: bool,
}

/// Everything the pipeline roles share, borrowed for the lifetime of one
/// stage execution.
struct PipelineEnv<'a> {
    config: &'a ExecConfig,
    db: &'a dyn Database,
    aggregator: &'a dyn Aggregator,
    metrics: &'a ExecMetrics,
    shared: &'a SharedState,
    queue: &'a QueueWithRetry,
    results: &'a ResultsQueue,
    slots: &'a WorkerTxSlots,
    quiesce: &'a RwLock<()>,
    apply_worker: &'a Mutex<ApplyWorker>,
    output_tx_num: &'a AtomicU64,
    output_block_num: &'a AtomicU64,
    block_complete: &'a AtomicBool,
    consumed_tx: &'a Sender<()>,
    pipeline_cancel: &'a CancelToken,
    repeats_total: &'a AtomicU64,
    max_tx_num: TxNumber,
}

impl PipelineEnv<'_> {
    /// Consume the results heap in strict transaction-number order.
    ///
    /// The first conflict of a pass is re-executed in place through the
    /// apply worker (faster, and conflict-free under the single-writer
    /// discipline); subsequent conflicts are pushed back to the retry lane
    /// so the scheduler can interleave others.
    fn process_result_queue(
        &self,
        tx: &dyn DbTx,
        output_tx_num_in: TxNumber,
        apply_worker: &mut ApplyWorker,
        backpressure: bool,
        can_retry: bool,
        force_stop_at_block_end: bool,
    ) -> Result<ProcessOutcome, StageError> {
        let mut outcome = ProcessOutcome { output_tx_num: output_tx_num_in, ..Default::default() };
        let mut re_executed = false;
        while let Some(mut task) = self.results.next_if(outcome.output_tx_num) {
            if task.error.is_some() || !self.shared.reads_valid(&task.read_set) {
                outcome.conflicts += 1;
                if re_executed && can_retry {
                    self.shared.retry(task, self.queue);
                    continue;
                }
                apply_worker.run_tx_task(self.shared, tx, &mut task)?;
                if let Some(source) = task.error.clone() {
                    return Err(StageError::Execution { block: task.block_num, source });
                }
                re_executed = true;
            }

            if task.is_final {
                self.aggregator.apply_state(&task)?;
            }
            self.shared.apply_state(&task, self.aggregator)?;
            if !self.config.discard_history {
                self.shared.apply_logs_and_traces(&task, self.aggregator)?;
            }
            outcome.triggers += self.shared.commit_tx_num(task.sender, task.tx_num, self.queue);
            outcome.output_tx_num = task.tx_num + 1;
            outcome.applied += 1;
            if backpressure {
                let _ = self.consumed_tx.try_send(());
            }
            outcome.processed_block_num = Some(task.block_num);
            outcome.stopped_at_block_end = task.is_final;
            if force_stop_at_block_end && task.is_final {
                break;
            }
        }
        Ok(outcome)
    }

    /// Record a pass's counters into the metrics registry and the shared
    /// watermarks.
    fn absorb_outcome(&self, outcome: &ProcessOutcome) {
        self.metrics.repeats.increment(outcome.conflicts);
        self.metrics.triggers.increment(outcome.triggers);
        self.repeats_total.fetch_add(outcome.conflicts, Ordering::Relaxed);
        if let Some(block) = outcome.processed_block_num {
            self.output_block_num.fetch_max(block, Ordering::SeqCst);
        }
        if outcome.applied > 0 {
            self.output_tx_num.store(outcome.output_tx_num, Ordering::SeqCst);
            self.block_complete.store(outcome.stopped_at_block_end, Ordering::SeqCst);
        }
    }

    /// The serial apply loop: drains the results heap and applies the
    /// contiguous prefix until every task up to `max_tx_num` is in.
    fn apply_loop(&self, cancel: &CancelToken, done: &Sender<()>) -> Result<(), StageError> {
        let tx = self.db.tx()?;
        while self.output_tx_num.load(Ordering::SeqCst) <= self.max_tx_num {
            if self.results.drain(cancel).is_err() {
                return Err(StageError::Canceled);
            }
            let outcome = {
                let mut apply_worker = self.apply_worker.lock();
                self.process_result_queue(
                    &*tx,
                    self.output_tx_num.load(Ordering::SeqCst),
                    &mut apply_worker,
                    true,
                    true,
                    false,
                )?
            };
            self.absorb_outcome(&outcome);
        }
        let _ = done.try_send(());
        Ok(())
    }

    /// Current stage checkpoint derived from the pipeline watermarks.
    fn checkpoint(&self) -> StageCheckpoint {
        StageCheckpoint::new(
            self.output_block_num.load(Ordering::SeqCst),
            self.output_tx_num.load(Ordering::SeqCst).saturating_sub(1),
        )
    }
}

fn join_apply(handle: ScopedJoinHandle<'_, Result<(), StageError>>) -> Result<(), StageError> {
    match handle.join() {
        Ok(Err(err)) if !err.is_canceled() => Err(err),
        Ok(_) => Ok(()),
        Err(panic) => resume_unwind(panic),
    }
}

/// The commit coordinator of the parallel pipeline.
///
/// Between commits it keeps the WAL bounded (prune or flush on a tick);
/// when the buffered state crosses the threshold it quiesces the pipeline,
/// drains the in-flight work to a block boundary, flushes everything and
/// rotates the transactions.
fn rw_loop<'scope, 'a>(
    env: &'a PipelineEnv<'a>,
    scope: &'scope Scope<'scope, 'a>,
    cancel: &'a CancelToken,
) -> Result<(), StageError> {
    let mut stage_tx = StageTx::new(env.db)?;
    let mut progress = Progress::new(env.config.batch_size, env.config.worker_count);
    let log_tick = tick(env.config.log_interval);
    let prune_tick = tick(env.config.prune_interval);
    let (done_tx, done_rx) = bounded::<()>(1);

    let spawn_apply = |apply_cancel: &CancelToken| {
        let apply_cancel = apply_cancel.clone();
        let done_tx = done_tx.clone();
        scope.spawn(move || env.apply_loop(&apply_cancel, &done_tx))
    };

    let mut apply_cancel = CancelToken::new();
    let mut apply_handle = Some(spawn_apply(&apply_cancel));

    let loop_result = 'coordinator: loop {
        if env.output_tx_num.load(Ordering::SeqCst) > env.max_tx_num {
            break 'coordinator Ok(());
        }
        select! {
            recv(cancel.channel()) -> _ => break 'coordinator Err(StageError::Canceled),
            recv(env.pipeline_cancel.channel()) -> _ => break 'coordinator Err(StageError::Canceled),
            recv(done_rx) -> _ => continue 'coordinator,
            recv(log_tick) -> _ => {
                env.metrics.steps_in_db.set(
                    env.output_tx_num.load(Ordering::SeqCst) as f64 / AGGREGATION_STEP as f64,
                );
                progress.log(
                    env.shared,
                    env.queue,
                    env.results,
                    env.output_block_num.load(Ordering::SeqCst),
                    env.output_tx_num.load(Ordering::SeqCst),
                    env.repeats_total.load(Ordering::Relaxed),
                );
                if env.aggregator.has_background_files_build() {
                    info!(
                        target: "sync::stages::execution",
                        progress = %env.aggregator.background_progress(),
                        "Background files build"
                    );
                }
            }
            recv(prune_tick) -> _ => {
                if let Err(err) =
                    commit_if_due(env, &mut stage_tx, &mut apply_cancel, &mut apply_handle, &spawn_apply)
                {
                    break 'coordinator Err(err);
                }
            }
        }
    };

    apply_cancel.cancel();
    let apply_result = apply_handle.take().map(join_apply).unwrap_or(Ok(()));

    match loop_result.and(apply_result) {
        Ok(()) => {
            env.aggregator.flush(&mut *stage_tx)?;
            save_stage_checkpoint(&mut *stage_tx, EXECUTION, env.checkpoint())?;
            stage_tx.commit()?;
            Ok(())
        }
        Err(err) => {
            env.pipeline_cancel.cancel();
            Err(err)
        }
    }
}

/// One firing of the coordinator's prune tick: keep the WAL bounded while
/// below the commit threshold, run the full commit sequence otherwise.
fn commit_if_due<'scope, 'a>(
    env: &'a PipelineEnv<'a>,
    stage_tx: &mut StageTx<'a>,
    apply_cancel: &mut CancelToken,
    apply_handle: &mut Option<ScopedJoinHandle<'scope, Result<(), StageError>>>,
    spawn_apply: &dyn Fn(&CancelToken) -> ScopedJoinHandle<'scope, Result<(), StageError>>,
) -> Result<(), StageError> {
    if env.shared.size_estimate() < env.config.batch_size {
        if env.aggregator.can_prune(&**stage_tx) {
            env.aggregator.prune(&mut **stage_tx, AGGREGATION_STEP * 10)?;
        } else {
            env.aggregator.flush(&mut **stage_tx)?;
        }
        return Ok(());
    }

    let commit_start = Instant::now();
    info!(
        target: "sync::stages::execution",
        block_complete = env.block_complete.load(Ordering::SeqCst),
        "Committing"
    );

    // Stop the serial applier; the coordinator finishes its work inline.
    apply_cancel.cancel();
    if let Some(handle) = apply_handle.take() {
        join_apply(handle)?;
    }

    // Drain and apply up to the next block boundary: read sets do not carry
    // over a commit, so everything else goes back to the queue.
    while !env.block_complete.load(Ordering::SeqCst) {
        env.results.drain_non_blocking();
        let outcome = {
            let mut apply_worker = env.apply_worker.lock();
            env.process_result_queue(
                &**stage_tx,
                env.output_tx_num.load(Ordering::SeqCst),
                &mut apply_worker,
                false,
                false,
                true,
            )?
        };
        let stalled = outcome.applied == 0;
        env.absorb_outcome(&outcome);
        if env.block_complete.load(Ordering::SeqCst) {
            break;
        }
        if stalled && env.results.drain(env.pipeline_cancel).is_err() {
            return Err(StageError::Canceled);
        }
    }

    {
        let _quiesce = env.quiesce.write();
        let _ = env.consumed_tx.try_send(());
        env.results.drop_results(|task| env.shared.retry(task, env.queue));

        let _root = env.aggregator.compute_commitment(true)?;
        env.aggregator.flush(&mut **stage_tx)?;
        save_stage_checkpoint(&mut **stage_tx, EXECUTION, env.checkpoint())?;
        stage_tx.collect_metrics();
        stage_tx.commit()?;
        env.slots.reset_all();
        env.shared.clear_overlay();
    }

    *apply_cancel = CancelToken::new();
    *apply_handle = Some(spawn_apply(apply_cancel));

    info!(
        target: "sync::stages::execution",
        time = ?commit_start.elapsed(),
        "Committed"
    );
    Ok(())
}

/// The execution stage: replays blocks `[checkpoint+1, max_block]` against
/// the durable store and advances the stage watermark.
pub struct ExecutionStage {
    config: ExecConfig,
    db: Arc<dyn Database>,
    block_reader: Arc<dyn BlockReader>,
    vm_factory: Arc<dyn VmFactory>,
    aggregator: Arc<dyn Aggregator>,
    header_reporter: Option<Arc<dyn HeaderReporter>>,
    state_stream: Option<Arc<dyn StateStream>>,
    metrics: ExecMetrics,
}

impl std::fmt::Debug for ExecutionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStage").field("config", &self.config).finish_non_exhaustive()
    }
}

impl ExecutionStage {
    /// Create the stage from its configuration and collaborators.
    pub fn new(
        config: ExecConfig,
        db: Arc<dyn Database>,
        block_reader: Arc<dyn BlockReader>,
        vm_factory: Arc<dyn VmFactory>,
        aggregator: Arc<dyn Aggregator>,
    ) -> Self {
        Self {
            config,
            db,
            block_reader,
            vm_factory,
            aggregator,
            header_reporter: None,
            state_stream: None,
            metrics: ExecMetrics::new(),
        }
    }

    /// Attach a bad-header sink.
    pub fn with_header_reporter(mut self, reporter: Arc<dyn HeaderReporter>) -> Self {
        self.header_reporter = Some(reporter);
        self
    }

    /// Attach a change-stream sink.
    pub fn with_state_stream(mut self, stream: Arc<dyn StateStream>) -> Self {
        self.state_stream = Some(stream);
        self
    }

    /// Execute the stage up to `max_block`.
    ///
    /// A panic anywhere in the pipeline is logged and re-raised so the
    /// process halts instead of silently corrupting state.
    pub fn execute(
        &mut self,
        unwinder: &mut dyn Unwinder,
        max_block: BlockNumber,
        cancel: &CancelToken,
    ) -> Result<ExecOutput, StageError> {
        match catch_unwind(AssertUnwindSafe(|| self.execute_inner(unwinder, max_block, cancel))) {
            Ok(result) => result,
            Err(panic) => {
                error!(target: "sync::stages::execution", "Execution pipeline panicked");
                resume_unwind(panic)
            }
        }
    }

    fn execute_inner(
        &mut self,
        unwinder: &mut dyn Unwinder,
        max_block: BlockNumber,
        cancel: &CancelToken,
    ) -> Result<ExecOutput, StageError> {
        let (checkpoint, start_block, output_tx_num, max_tx_num) = {
            let tx = self.db.tx()?;
            let checkpoint = stage_checkpoint(&*tx, EXECUTION)?;
            let start_block = checkpoint.map_or(0, |c| c.block_number + 1);
            let output_tx_num = checkpoint.map_or(0, |c| c.tx_number + 1);
            let max_tx_num = models::max_tx_num(&*tx, max_block)?
                .ok_or(StageError::MissingBlock { number: max_block })?;
            (checkpoint.unwrap_or_default(), start_block, output_tx_num, max_tx_num)
        };
        if start_block > max_block {
            return Ok(ExecOutput { checkpoint, done: true });
        }

        self.aggregator.set_tx_num(output_tx_num);

        // While replaying the frozen range everything can retire to files
        // immediately; the guard restores the normal policy.
        let _keep_in_db = (start_block < self.block_reader.frozen_blocks()).then(|| {
            self.aggregator.keep_in_db(0);
            KeepInDbGuard { aggregator: &*self.aggregator }
        });

        if self.config.parallel {
            self.execute_parallel(checkpoint, start_block, max_block, output_tx_num, max_tx_num, cancel)
        } else {
            self.execute_sequential(unwinder, checkpoint, start_block, max_block, output_tx_num, cancel)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_sequential(
        &self,
        unwinder: &mut dyn Unwinder,
        start_checkpoint: StageCheckpoint,
        start_block: BlockNumber,
        max_block: BlockNumber,
        mut input_tx_num: TxNumber,
        cancel: &CancelToken,
    ) -> Result<ExecOutput, StageError> {
        let shared = SharedState::new();
        let queue = QueueWithRetry::new(TASK_QUEUE_CAPACITY);
        let results = ResultsQueue::new(16, RESULTS_HEAP_LIMIT);
        let mut progress = Progress::new(self.config.batch_size, self.config.worker_count);
        let mut apply_worker = ApplyWorker::new(&*self.vm_factory);
        let log_tick = tick(self.config.log_interval);

        let state_stream_on = !self.config.initial_cycle
            && self.config.state_stream
            && max_block - start_block < STATE_STREAM_LIMIT;

        let mut stage_tx = StageTx::new(&*self.db)?;
        let mut stage_progress = start_checkpoint;
        let mut interrupted = false;

        std::thread::scope(|scope| -> Result<(), StageError> {
            let read_ahead = spawn_read_ahead(scope, &*self.db, &*self.block_reader, 4, cancel);

            'blocks: for block_num in start_block..=max_block {
                if cancel.is_canceled() {
                    return Err(StageError::Canceled);
                }
                read_ahead.notify(block_num);

                let block = self
                    .block_reader
                    .block_by_number(&*stage_tx, block_num)?
                    .ok_or(StageError::MissingBlock { number: block_num })?;
                let header = block.header.clone();
                self.aggregator.set_block_num(block_num);

                if state_stream_on {
                    if let Some(stream) = &self.state_stream {
                        let txs =
                            self.block_reader.raw_transactions(&*stage_tx, block_num, block_num)?;
                        stream.start_change(block_num, block.hash_slow(), txs);
                    }
                }

                let txs_len = block.body.len() as i32;
                let mut gas_used = 0u64;
                for tx_index in -1..=txs_len {
                    let mut task =
                        build_task(&block, tx_index, input_tx_num, &*self.block_reader, true)?;
                    self.aggregator.set_tx_num(input_tx_num);
                    apply_worker.run_tx_task(&shared, &*stage_tx, &mut task)?;

                    let failure = if let Some(source) = task.error.clone() {
                        Some(StageError::Execution { block: block_num, source })
                    } else {
                        gas_used += task.gas_used;
                        if task.is_final && gas_used != header.gas_used && block_num > 0 {
                            // genesis is exempt from the cross-check
                            Some(StageError::GasMismatch {
                                block: block_num,
                                used: gas_used,
                                header: header.gas_used,
                            })
                        } else {
                            None
                        }
                    };
                    if let Some(err) = failure {
                        warn!(
                            target: "sync::stages::execution",
                            block = block_num,
                            hash = %header.hash_slow(),
                            %err,
                            "Execution failed"
                        );
                        if let Some(reporter) = &self.header_reporter {
                            reporter.report_bad_header(header.hash_slow(), header.parent_hash);
                        }
                        if self.config.bad_block_halt {
                            return Err(err);
                        }
                        unwinder.unwind_to(block_num.saturating_sub(1), header.hash_slow());
                        interrupted = true;
                        break 'blocks;
                    }

                    shared.apply_state(&task, &*self.aggregator)?;
                    if !self.config.discard_history {
                        shared.apply_logs_and_traces(&task, &*self.aggregator)?;
                    }
                    self.metrics
                        .triggers
                        .increment(shared.commit_tx_num(task.sender, task.tx_num, &queue));
                    input_tx_num += 1;
                }

                if !self.config.discard_commitment {
                    let root = self.aggregator.compute_commitment(true)?;
                    if root != header.state_root {
                        if self.config.bad_block_halt {
                            return Err(StageError::RootMismatch {
                                block: block_num,
                                got: root,
                                expected: header.state_root,
                            });
                        }
                        error!(
                            target: "sync::stages::execution",
                            block = block_num,
                            got = %root,
                            expected = %header.state_root,
                            hash = %header.hash_slow(),
                            "Wrong trie root"
                        );
                        self.aggregator.flush(&mut *stage_tx)?;
                        if let Some(reporter) = &self.header_reporter {
                            reporter.report_bad_header(header.hash_slow(), header.parent_hash);
                        }
                        if max_block > start_checkpoint.block_number {
                            // binary search for the bad block, biased older
                            let unwind_to = (max_block + start_checkpoint.block_number) / 2;
                            warn!(
                                target: "sync::stages::execution",
                                to = unwind_to,
                                "Unwinding due to incorrect root hash"
                            );
                            unwinder.unwind_to(unwind_to, header.hash_slow());
                        }
                        interrupted = true;
                        break 'blocks;
                    }
                }

                stage_progress = StageCheckpoint::new(block_num, input_tx_num - 1);

                if log_tick.try_recv().is_ok() {
                    self.metrics
                        .steps_in_db
                        .set(input_tx_num as f64 / AGGREGATION_STEP as f64);
                    progress.log(&shared, &queue, &results, block_num, input_tx_num, 0);

                    if shared.size_estimate() >= self.config.batch_size {
                        let commit_start = Instant::now();
                        self.aggregator.compute_commitment(true)?;
                        shared.clear_overlay();
                        self.aggregator.flush(&mut *stage_tx)?;
                        if self.config.produce_files {
                            self.aggregator.build_files_in_background(input_tx_num);
                            if self.aggregator.can_prune(&*stage_tx) {
                                self.aggregator.prune(&mut *stage_tx, AGGREGATION_STEP * 10)?;
                            }
                        }
                        save_stage_checkpoint(&mut *stage_tx, EXECUTION, stage_progress)?;
                        stage_tx.collect_metrics();
                        stage_tx.commit()?;
                        info!(
                            target: "sync::stages::execution",
                            time = ?commit_start.elapsed(),
                            "Committed"
                        );
                    }
                }
            }
            Ok(())
        })?;

        self.aggregator.flush(&mut *stage_tx)?;
        save_stage_checkpoint(&mut *stage_tx, EXECUTION, stage_progress)?;
        stage_tx.commit()?;

        Ok(ExecOutput { checkpoint: stage_progress, done: !interrupted })
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_parallel(
        &self,
        start_checkpoint: StageCheckpoint,
        start_block: BlockNumber,
        max_block: BlockNumber,
        start_output_tx_num: TxNumber,
        max_tx_num: TxNumber,
        cancel: &CancelToken,
    ) -> Result<ExecOutput, StageError> {
        let worker_count = self.config.worker_count.max(1);
        let shared = SharedState::new();
        let queue = QueueWithRetry::new(TASK_QUEUE_CAPACITY);
        let results = ResultsQueue::new((worker_count * 4).max(16), RESULTS_HEAP_LIMIT);
        let slots = WorkerTxSlots::new(worker_count);
        let quiesce = RwLock::new(());
        let apply_worker = Mutex::new(ApplyWorker::new(&*self.vm_factory));
        let pipeline_cancel = CancelToken::new();
        let (consumed_tx, consumed_rx) = bounded(1);
        let output_tx_num = AtomicU64::new(start_output_tx_num);
        let output_block_num = AtomicU64::new(start_checkpoint.block_number);
        let block_complete = AtomicBool::new(true);
        let repeats_total = AtomicU64::new(0);

        let env = PipelineEnv {
            config: &self.config,
            db: &*self.db,
            aggregator: &*self.aggregator,
            metrics: &self.metrics,
            shared: &shared,
            queue: &queue,
            results: &results,
            slots: &slots,
            quiesce: &quiesce,
            apply_worker: &apply_worker,
            output_tx_num: &output_tx_num,
            output_block_num: &output_block_num,
            block_complete: &block_complete,
            consumed_tx: &consumed_tx,
            pipeline_cancel: &pipeline_cancel,
            repeats_total: &repeats_total,
            max_tx_num,
        };

        std::thread::scope(|scope| -> Result<(), StageError> {
            let mut worker_handles = Vec::with_capacity(worker_count);
            for worker_id in 0..worker_count {
                let vm = self.vm_factory.create();
                let env = &env;
                worker_handles.push(scope.spawn(move || {
                    let result = worker_loop(
                        worker_id,
                        env.quiesce,
                        env.pipeline_cancel,
                        env.db,
                        env.slots,
                        env.shared,
                        env.queue,
                        env.results,
                        vm,
                    );
                    if result.is_err() {
                        env.pipeline_cancel.cancel();
                    }
                    result
                }));
            }

            let rw_handle = {
                let env = &env;
                scope.spawn(move || rw_loop(env, scope, cancel))
            };

            // The block driver runs on the stage's own thread.
            let slow_tick = tick(std::time::Duration::from_secs(1));
            let mut input_tx_num = start_output_tx_num;
            let mut driver_result: Result<(), StageError> = Ok(());
            'driver: for block_num in start_block..=max_block {
                if cancel.is_canceled() || pipeline_cancel.is_canceled() {
                    driver_result = Err(StageError::Canceled);
                    break;
                }
                let block = match self
                    .db
                    .tx()
                    .map_err(StageError::from)
                    .and_then(|tx| {
                        self.block_reader
                            .block_by_number(&*tx, block_num)?
                            .ok_or(StageError::MissingBlock { number: block_num })
                    }) {
                    Ok(block) => block,
                    Err(err) => {
                        driver_result = Err(err);
                        break;
                    }
                };
                self.aggregator.set_block_num(block_num);

                // Do not oversend: wait for the results heap and the shared
                // buffer to go below their thresholds.
                'backpressure: while results.len() > results.limit()
                    || shared.size_estimate() >= self.config.batch_size
                {
                    select! {
                        recv(cancel.channel()) -> _ => {
                            driver_result = Err(StageError::Canceled);
                            break 'driver;
                        }
                        recv(pipeline_cancel.channel()) -> _ => {
                            driver_result = Err(StageError::Canceled);
                            break 'driver;
                        }
                        recv(consumed_rx) -> _ => {}
                        recv(slow_tick) -> _ => break 'backpressure,
                    }
                }

                let txs_len = block.body.len() as i32;
                for tx_index in -1..=txs_len {
                    let task = match build_task(
                        &block,
                        tx_index,
                        input_tx_num,
                        &*self.block_reader,
                        true,
                    ) {
                        Ok(task) => task,
                        Err(err) => {
                            driver_result = Err(err);
                            break 'driver;
                        }
                    };
                    let admitted = if task.transaction().is_some() {
                        shared.register_sender(task)
                    } else {
                        Some(task)
                    };
                    if let Some(task) = admitted {
                        if shared.add_work(task, &queue, &pipeline_cancel).is_err() {
                            driver_result = Err(StageError::Canceled);
                            break 'driver;
                        }
                    }
                    input_tx_num += 1;
                }

                if self.config.produce_files {
                    self.aggregator
                        .build_files_in_background(output_tx_num.load(Ordering::SeqCst));
                }
            }
            debug!(target: "sync::stages::execution", "All transactions sent");

            if driver_result.is_err() {
                pipeline_cancel.cancel();
            }
            let rw_result = match rw_handle.join() {
                Ok(result) => result,
                Err(panic) => resume_unwind(panic),
            };

            pipeline_cancel.cancel();
            queue.close();
            let mut worker_err = None;
            for handle in worker_handles {
                match handle.join() {
                    Ok(Err(err)) if !err.is_canceled() && worker_err.is_none() => {
                        worker_err = Some(err)
                    }
                    Ok(_) => {}
                    Err(panic) => resume_unwind(panic),
                }
            }

            if cancel.is_canceled() {
                return Err(StageError::Canceled);
            }
            if let Err(err) = rw_result {
                if !err.is_canceled() {
                    return Err(err);
                }
            }
            if let Some(err) = worker_err {
                return Err(err);
            }
            driver_result
        })?;

        let tx = self.db.tx()?;
        let checkpoint = stage_checkpoint(&*tx, EXECUTION)?.unwrap_or(start_checkpoint);
        Ok(ExecOutput { checkpoint, done: checkpoint.block_number >= max_block })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Op, TestAggregator, TestBlockSpec, TestChain, TestProgram, TestTx};
    use alloy_primitives::{Address, Bytes, B256};
    use assert_matches::assert_matches;
    use sorrel_db::MemDb;
    use sorrel_primitives::StateKey;

    fn counter_key() -> StateKey {
        StateKey::Storage(Address::from([1u8; 20]), B256::from([9u8; 32]))
    }

    fn counter_bytes(value: u64) -> Bytes {
        Bytes::copy_from_slice(&value.to_be_bytes())
    }

    fn incr_tx(sender_byte: u8) -> TestTx {
        TestTx::new(
            Address::from([sender_byte; 20]),
            0,
            TestProgram::new(vec![Op::Incr(counter_key())], 21_000),
        )
    }

    /// One block whose transactions all bump the same counter.
    fn conflict_chain(tx_count: u8) -> TestChain {
        TestChain::build(vec![TestBlockSpec::with_txs(
            (0..tx_count).map(|i| incr_tx(5 + i)).collect(),
        )])
    }

    struct Fixture {
        chain: TestChain,
        db: MemDb,
        aggregator: TestAggregator,
        metrics: ExecMetrics,
        shared: SharedState,
        queue: QueueWithRetry,
        results: ResultsQueue,
        slots: WorkerTxSlots,
        quiesce: RwLock<()>,
        apply_worker: Mutex<ApplyWorker>,
        consumed_tx: Sender<()>,
        output_tx_num: AtomicU64,
        output_block_num: AtomicU64,
        block_complete: AtomicBool,
        pipeline_cancel: CancelToken,
        repeats_total: AtomicU64,
        config: ExecConfig,
    }

    impl Fixture {
        fn new(chain: TestChain) -> Self {
            let db = chain.setup_db();
            let factory = chain.vm_factory();
            let (consumed_tx, _consumed_rx) = bounded(1);
            Self {
                db,
                aggregator: TestAggregator::new(),
                metrics: ExecMetrics::new(),
                shared: SharedState::new(),
                queue: QueueWithRetry::new(64),
                results: ResultsQueue::new(8, 8),
                slots: WorkerTxSlots::new(1),
                quiesce: RwLock::new(()),
                apply_worker: Mutex::new(ApplyWorker::new(&factory)),
                consumed_tx,
                output_tx_num: AtomicU64::new(0),
                output_block_num: AtomicU64::new(0),
                block_complete: AtomicBool::new(true),
                pipeline_cancel: CancelToken::new(),
                repeats_total: AtomicU64::new(0),
                config: ExecConfig::default(),
                chain,
            }
        }

        fn env(&self) -> PipelineEnv<'_> {
            PipelineEnv {
                config: &self.config,
                db: &self.db,
                aggregator: &self.aggregator,
                metrics: &self.metrics,
                shared: &self.shared,
                queue: &self.queue,
                results: &self.results,
                slots: &self.slots,
                quiesce: &self.quiesce,
                apply_worker: &self.apply_worker,
                output_tx_num: &self.output_tx_num,
                output_block_num: &self.output_block_num,
                block_complete: &self.block_complete,
                consumed_tx: &self.consumed_tx,
                pipeline_cancel: &self.pipeline_cancel,
                repeats_total: &self.repeats_total,
                max_tx_num: self.chain.max_tx_num,
            }
        }

        /// Mark the counter as written by transaction number 1.
        fn apply_base_write(&self) {
            let mut base = TxTask::new(&self.chain.blocks[0], 0, 1);
            base.write_set.insert(counter_key(), Some(counter_bytes(1)));
            self.shared.apply_state(&base, &self.aggregator).unwrap();
        }

        /// A speculative result whose read observed the pre-write state.
        fn stale_task(&self, tx_index: i32, tx_num: TxNumber) -> TxTask {
            let mut task = TxTask::new(&self.chain.blocks[0], tx_index, tx_num);
            task.read_set.insert(counter_key(), None);
            task.write_set.insert(counter_key(), Some(counter_bytes(1)));
            task
        }
    }

    #[test]
    fn first_conflict_of_a_pass_is_reexecuted_in_place() {
        let fixture = Fixture::new(conflict_chain(2));
        let env = fixture.env();
        let cancel = CancelToken::new();

        fixture.apply_base_write();
        fixture.results.send(fixture.stale_task(1, 2), &cancel).unwrap();
        fixture.results.drain(&cancel).unwrap();

        let ro = fixture.db.tx().unwrap();
        let outcome = {
            let mut apply_worker = fixture.apply_worker.lock();
            env.process_result_queue(&*ro, 2, &mut apply_worker, false, true, false).unwrap()
        };

        assert_eq!(outcome.conflicts, 1);
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.output_tx_num, 3);
        // the re-execution saw the committed counter and bumped it
        assert_eq!(
            fixture.shared.latest(&counter_key().encode()),
            Some(Some(counter_bytes(2)))
        );
    }

    #[test]
    fn later_conflicts_of_a_pass_are_retried() {
        let fixture = Fixture::new(conflict_chain(3));
        let env = fixture.env();
        let cancel = CancelToken::new();

        fixture.apply_base_write();
        fixture.results.send(fixture.stale_task(1, 2), &cancel).unwrap();
        fixture.results.send(fixture.stale_task(2, 3), &cancel).unwrap();
        fixture.results.drain(&cancel).unwrap();

        let ro = fixture.db.tx().unwrap();
        let outcome = {
            let mut apply_worker = fixture.apply_worker.lock();
            env.process_result_queue(&*ro, 2, &mut apply_worker, false, true, false).unwrap()
        };

        assert_eq!(outcome.conflicts, 2);
        assert_eq!(outcome.applied, 1, "only the in-place re-execution applies");
        assert_eq!(fixture.queue.retries_len(), 1, "the second conflict goes to the retry lane");
    }

    #[test]
    fn valid_results_apply_without_reexecution() {
        let fixture = Fixture::new(conflict_chain(2));
        let env = fixture.env();
        let cancel = CancelToken::new();

        let mut clean = TxTask::new(&fixture.chain.blocks[0], 0, 1);
        clean.read_set.insert(counter_key(), None);
        clean.write_set.insert(counter_key(), Some(counter_bytes(1)));
        fixture.results.send(clean, &cancel).unwrap();
        fixture.results.drain(&cancel).unwrap();

        let ro = fixture.db.tx().unwrap();
        let outcome = {
            let mut apply_worker = fixture.apply_worker.lock();
            env.process_result_queue(&*ro, 1, &mut apply_worker, false, true, false).unwrap()
        };

        assert_eq!(outcome.conflicts, 0);
        assert_eq!(outcome.applied, 1);
        assert!(!outcome.stopped_at_block_end);
    }

    #[test]
    fn reexecution_error_surfaces_as_execution_failure() {
        let chain = TestChain::build(vec![TestBlockSpec::with_txs(vec![
            TestTx::new(Address::from([5u8; 20]), 0, TestProgram::failing()),
            incr_tx(6),
        ])]);
        let fixture = Fixture::new(chain);
        let env = fixture.env();
        let cancel = CancelToken::new();

        fixture.apply_base_write();
        // stale result for the failing transaction forces an in-place rerun
        fixture.results.send(fixture.stale_task(0, 1), &cancel).unwrap();
        fixture.results.drain(&cancel).unwrap();

        let ro = fixture.db.tx().unwrap();
        let mut apply_worker = fixture.apply_worker.lock();
        let result = env.process_result_queue(&*ro, 1, &mut apply_worker, false, true, false);
        assert_matches!(result, Err(StageError::Execution { block: 0, .. }));
    }

    #[test]
    fn force_stop_halts_at_the_block_boundary() {
        let fixture = Fixture::new(conflict_chain(1));
        let env = fixture.env();
        let cancel = CancelToken::new();

        // the block's post task followed by the next block's would-be task
        let mut final_task = TxTask::new(&fixture.chain.blocks[0], 1, 2);
        final_task.write_set.insert(counter_key(), Some(counter_bytes(7)));
        assert!(final_task.is_final);
        fixture.results.send(final_task, &cancel).unwrap();
        fixture.results.drain(&cancel).unwrap();

        let ro = fixture.db.tx().unwrap();
        let outcome = {
            let mut apply_worker = fixture.apply_worker.lock();
            env.process_result_queue(&*ro, 2, &mut apply_worker, false, true, true).unwrap()
        };
        assert!(outcome.stopped_at_block_end);
        assert_eq!(outcome.applied, 1);
    }
}
