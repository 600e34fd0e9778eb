//! The state reconstitution engine.
//!
//! Replays a contiguous transaction-number range covered by history
//! snapshots into live state: a bitmap scan finds the transactions that
//! touch state, replay workers execute exactly those against a
//! history-snapshot reader and collect writes into a scratch store, and a
//! final transpose folds the scratch tables into canonical plain-state
//! entries.

mod scan;
mod transpose;

use crate::{
    error::StageError,
    exec::{build_task, workers::WorkerTxSlots},
    progress::byte_count,
    stage::save_stage_checkpoint,
    ExecConfig,
};
use alloy_primitives::{Address, Bytes, B256};
use crossbeam_channel::{bounded, select, tick, Receiver};
use parking_lot::RwLock;
use scan::ScanWorker;
use sorrel_db::{models, tables, Database, DatabaseError, DbTx, MemDb};
use sorrel_interfaces::{
    Aggregator, AggregatorStep, BlockReader, StateReader, Vm, VmFactory,
};
use sorrel_primitives::{BlockNumber, StageCheckpoint, StateKey, TxNumber, EXECUTION};
use sorrel_state::{CancelToken, ReconState};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use transpose::transpose_scratch;

/// State reader of the replay workers: history snapshots first, then the
/// chain store for anything the snapshots do not cover.
///
/// Reads are exact historical values as of the task's transaction number,
/// which is what makes replay conflict-free without validation.
struct ReconStateReader<'a> {
    step: &'a dyn AggregatorStep,
    chain_tx: &'a dyn DbTx,
    tx_num: TxNumber,
}

impl ReconStateReader<'_> {
    fn lookup(
        &mut self,
        key: StateKey,
        table: &'static str,
    ) -> Result<Option<Bytes>, DatabaseError> {
        match self.step.read_as_of(&key, self.tx_num) {
            Some(value) => Ok(value),
            None => Ok(self.chain_tx.get(table, &key.encode())?.map(Bytes::from)),
        }
    }
}

impl StateReader for ReconStateReader<'_> {
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

/// Reconstitute state from history snapshots, step by step, then transpose
/// the scratch store into the main tables and advance the stage watermark.
pub fn reconstitute_state(
    config: &ExecConfig,
    chain_db: &dyn Database,
    block_reader: &dyn BlockReader,
    vm_factory: &dyn VmFactory,
    aggregator: &dyn Aggregator,
    cancel: &CancelToken,
) -> Result<StageCheckpoint, StageError> {
    let started = Instant::now();
    aggregator.enable_madv_normal();
    let result =
        reconstitute_inner(config, chain_db, block_reader, vm_factory, aggregator, cancel);
    aggregator.disable_read_ahead();
    if let Ok(checkpoint) = &result {
        info!(
            target: "sync::stages::reconstitution",
            to_block = checkpoint.block_number,
            took = ?started.elapsed(),
            "Reconstitution done"
        );
    }
    result
}

fn reconstitute_inner(
    config: &ExecConfig,
    chain_db: &dyn Database,
    block_reader: &dyn BlockReader,
    vm_factory: &dyn VmFactory,
    aggregator: &dyn Aggregator,
    cancel: &CancelToken,
) -> Result<StageCheckpoint, StageError> {
    // An unfinished merge can be left over from a hard stop; align the
    // history files before stepping over them.
    aggregator.merge_loop()?;

    let steps = aggregator.make_steps()?;
    let Some(last_step) = steps.last() else {
        let tx = chain_db.tx()?;
        return Ok(crate::stage::stage_checkpoint(&*tx, EXECUTION)?.unwrap_or_default());
    };

    // The first block not fully covered by history bounds the replay.
    let (target_block, target_tx_num) = {
        let tx = chain_db.tx()?;
        let (_, to_tx_num) = last_step.tx_num_range();
        let block = models::find_block_num(&*tx, to_tx_num)?
            .ok_or(StageError::SnapshotBoundary { tx_num: to_tx_num })?;
        if block == 0 {
            return Err(StageError::Fatal(
                "not enough transactions in the history data".into(),
            ));
        }
        let block = block - 1;
        let tx_num = models::max_tx_num(&*tx, block)?
            .ok_or(StageError::SnapshotBoundary { tx_num: to_tx_num })?
            + 1;
        (block, tx_num)
    };

    info!(
        target: "sync::stages::reconstitution",
        to_block = target_block,
        to_tx_num = target_tx_num,
        "Blocks execution, reconstitution"
    );

    // The scratch store takes the replay writes under aggressive
    // durability settings; it never outlives the run.
    let scratch = MemDb::open(&tables::RECON);

    let step_count = steps.len();
    for (index, step) in steps.iter().enumerate() {
        info!(
            target: "sync::stages::reconstitution",
            step = index + 1,
            out_of = step_count,
            workers = config.worker_count,
            "Step of incremental reconstitution"
        );
        reconstitute_step(
            index + 1 == step_count,
            config,
            &scratch,
            chain_db,
            block_reader,
            vm_factory,
            &**step,
            target_block,
            target_tx_num,
            cancel,
        )?;
    }

    let checkpoint = StageCheckpoint::new(target_block, target_tx_num - 1);
    {
        let scratch_ro = scratch.tx()?;
        let mut main_rw = chain_db.tx_mut()?;
        transpose_scratch(&*scratch_ro, &mut *main_rw)?;
        save_stage_checkpoint(&mut *main_rw, EXECUTION, checkpoint)?;
        main_rw.commit()?;
    }
    debug!(target: "sync::stages::reconstitution", "Scratch store transposed and dropped");

    Ok(checkpoint)
}

#[allow(clippy::too_many_arguments)]
fn reconstitute_step(
    last: bool,
    config: &ExecConfig,
    scratch: &MemDb,
    chain_db: &dyn Database,
    block_reader: &dyn BlockReader,
    vm_factory: &dyn VmFactory,
    step: &dyn AggregatorStep,
    target_block: BlockNumber,
    total_tx_num: TxNumber,
    cancel: &CancelToken,
) -> Result<(), StageError> {
    let worker_count = config.worker_count.max(1);
    let (mut start_tx_num, end_tx_num) = step.tx_num_range();

    // Expand to block boundaries; a step may cut a block in half.
    let (start_block, end_block) = {
        let tx = chain_db.tx()?;
        let mut start_block = models::find_block_num(&*tx, start_tx_num)?
            .ok_or(StageError::SnapshotBoundary { tx_num: start_tx_num })?;
        if start_block > 0 {
            start_block -= 1;
            start_tx_num = models::min_tx_num(&*tx, start_block)?
                .ok_or(StageError::SnapshotBoundary { tx_num: start_tx_num })?;
        }
        let end_block = if last {
            target_block
        } else {
            models::find_block_num(&*tx, end_tx_num)?
                .ok_or(StageError::SnapshotBoundary { tx_num: end_tx_num })?
        };
        (start_block, end_block)
    };

    info!(
        target: "sync::stages::reconstitution",
        start_tx_num,
        end_tx_num,
        start_block,
        end_block,
        "Reconstitution"
    );

    let mut scan = ScanWorker::new(step);
    let pass_start = Instant::now();
    scan.bitmap_accounts();
    log_slow_scan("accounts", pass_start);
    let pass_start = Instant::now();
    scan.bitmap_storage();
    log_slow_scan("storage", pass_start);
    let pass_start = Instant::now();
    scan.bitmap_code();
    log_slow_scan("code", pass_start);
    info!(
        target: "sync::stages::reconstitution",
        transactions = scan.cardinality(),
        out_of = end_tx_num - start_tx_num,
        "Ready to replay"
    );

    let recon = ReconState::new();
    let quiesce = RwLock::new(());
    let slots = WorkerTxSlots::new(worker_count);
    let step_cancel = CancelToken::new();
    let (work_tx, work_rx) = bounded::<sorrel_primitives::TxTask>(worker_count * 4);
    let (done_tx, done_rx) = bounded::<()>(1);

    let recon_ref = &recon;
    let quiesce_ref = &quiesce;
    let slots_ref = &slots;
    let step_cancel_ref = &step_cancel;

    std::thread::scope(|scope| -> Result<(), StageError> {
        let mut worker_handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let step_view = step.clone_step();
            let vm = vm_factory.create();
            let work_rx = work_rx.clone();
            worker_handles.push(scope.spawn(move || {
                let result = recon_worker_loop(
                    worker_id,
                    quiesce_ref,
                    slots_ref,
                    chain_db,
                    recon_ref,
                    step_view,
                    vm,
                    work_rx,
                    step_cancel_ref,
                );
                if result.is_err() {
                    step_cancel_ref.cancel();
                }
                result
            }));
        }

        let monitor_handle = {
            let batch_size = config.batch_size;
            let log_interval = config.log_interval;
            scope.spawn(move || {
                let result = recon_monitor(
                    scratch,
                    recon_ref,
                    quiesce_ref,
                    slots_ref,
                    batch_size,
                    log_interval,
                    (start_tx_num, end_tx_num, total_tx_num),
                    cancel,
                    step_cancel_ref,
                    &done_rx,
                );
                if result.is_err() {
                    step_cancel_ref.cancel();
                }
                result
            })
        };

        // This thread is the sole producer and the sole owner of the work
        // channel's send side; it is closed exactly once, in the tail below.
        let produce_result = (|| -> Result<(), StageError> {
            let mut input_tx_num = start_tx_num;
            for block_num in start_block..=end_block {
                let block = {
                    let tx = chain_db.tx()?;
                    block_reader
                        .block_by_number(&*tx, block_num)?
                        .ok_or(StageError::MissingBlock { number: block_num })?
                };
                let txs_len = block.body.len() as i32;
                for tx_index in -1..=txs_len {
                    if scan.contains(input_tx_num) {
                        let task =
                            build_task(&block, tx_index, input_tx_num, block_reader, false)?;
                        select! {
                            send(work_tx, task) -> res => {
                                if res.is_err() {
                                    return Err(StageError::ChannelClosed);
                                }
                            }
                            recv(cancel.channel()) -> _ => return Err(StageError::Canceled),
                            recv(step_cancel.channel()) -> _ => return Err(StageError::Canceled),
                        }
                    }
                    input_tx_num += 1;
                }
            }
            Ok(())
        })();

        drop(work_tx);
        let _ = done_tx.try_send(());

        let mut first_err: Option<StageError> = None;
        let mut note = |result: Result<(), StageError>| {
            if let Err(err) = result {
                if !err.is_canceled() && first_err.is_none() {
                    first_err = Some(err);
                }
            }
        };
        for handle in worker_handles {
            match handle.join() {
                Ok(result) => note(result),
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        match monitor_handle.join() {
            Ok(result) => note(result),
            Err(panic) => std::panic::resume_unwind(panic),
        }
        if cancel.is_canceled() {
            return Err(StageError::Canceled);
        }
        if let Some(err) = first_err {
            return Err(err);
        }
        produce_result
    })?;

    // Final flush of the step's remaining buffered writes.
    let mut tx = scratch.tx_mut()?;
    recon.flush(&mut *tx)?;
    tx.commit()?;
    Ok(())
}

fn log_slow_scan(history: &'static str, started: Instant) {
    if started.elapsed() > Duration::from_secs(5) {
        info!(
            target: "sync::stages::reconstitution",
            history,
            took = ?started.elapsed(),
            "Scan history"
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn recon_worker_loop(
    worker_id: usize,
    quiesce: &RwLock<()>,
    slots: &WorkerTxSlots,
    chain_db: &dyn Database,
    recon: &ReconState,
    step: Box<dyn AggregatorStep>,
    mut vm: Box<dyn Vm>,
    work: Receiver<sorrel_primitives::TxTask>,
    cancel: &CancelToken,
) -> Result<(), StageError> {
    loop {
        let mut task = select! {
            recv(work) -> task => match task {
                Ok(task) => task,
                Err(_) => return Ok(()),
            },
            recv(cancel.channel()) -> _ => return Ok(()),
        };
        let _quiesce = quiesce.read();
        let mut slot = slots.slot(worker_id).lock();
        if slot.is_none() {
            *slot = Some(chain_db.tx()?);
        }
        let chain_tx = slot.as_deref().expect("slot populated above");

        task.reset_outputs();
        let mut reader = ReconStateReader { step: &*step, chain_tx, tx_num: task.tx_num };
        vm.run_tx_task(&mut task, &mut reader)?;
        if let Some(source) = task.error.clone() {
            return Err(StageError::Execution { block: task.block_num, source });
        }
        recon.collect(&task);
    }
}

#[allow(clippy::too_many_arguments)]
fn recon_monitor(
    scratch: &MemDb,
    recon: &ReconState,
    quiesce: &RwLock<()>,
    slots: &WorkerTxSlots,
    batch_size: u64,
    log_interval: Duration,
    (start_tx_num, end_tx_num, total_tx_num): (TxNumber, TxNumber, TxNumber),
    cancel: &CancelToken,
    step_cancel: &CancelToken,
    done: &Receiver<()>,
) -> Result<(), StageError> {
    let log_tick = tick(log_interval);
    let mut prev_time = Instant::now();
    let mut prev_count = 0u64;
    loop {
        select! {
            recv(done) -> _ => return Ok(()),
            recv(cancel.channel()) -> _ => return Err(StageError::Canceled),
            recv(step_cancel.channel()) -> _ => return Err(StageError::Canceled),
            recv(log_tick) -> _ => {
                let count = recon.done_count();
                let max_tx_num = recon.max_tx_num();
                let interval = prev_time.elapsed().as_secs_f64();
                let speed = if interval > 0.0 {
                    (count.saturating_sub(prev_count)) as f64 / interval
                } else {
                    0.0
                };
                let overall = 100.0 * max_tx_num as f64 / total_tx_num as f64;
                let step_progress = 100.0 * max_tx_num.saturating_sub(start_tx_num) as f64
                    / (end_tx_num - start_tx_num) as f64;
                info!(
                    target: "sync::stages::reconstitution",
                    overall = format_args!("{overall:.2}%"),
                    step = format_args!("{step_progress:.2}%"),
                    tx_per_s = format_args!("{speed:.1}"),
                    buffer = format_args!(
                        "{}/{}",
                        byte_count(recon.size_estimate()),
                        byte_count(batch_size)
                    ),
                    "State reconstitution"
                );
                prev_time = Instant::now();
                prev_count = count;

                if recon.size_estimate() >= batch_size {
                    let flush_start = Instant::now();
                    {
                        let _guard = quiesce.write();
                        slots.reset_all();
                        let mut tx = scratch.tx_mut()?;
                        recon.flush(&mut *tx)?;
                        tx.commit()?;
                    }
                    info!(
                        target: "sync::stages::reconstitution",
                        took = ?flush_start.elapsed(),
                        "State reconstitution, commit"
                    );
                }
            }
        }
    }
}
