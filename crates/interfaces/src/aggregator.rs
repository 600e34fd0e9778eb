use alloy_primitives::{Bytes, B256};
use sorrel_db::{DatabaseError, DbTx, DbTxMut};
use sorrel_primitives::{StateKey, TxNumber, TxTask};

/// Width of one history aggregation step, in transaction numbers.
pub const AGGREGATION_STEP: u64 = 500_000;

/// Owner of the history write-ahead log, snapshot files, commitment
/// computation and pruning policy.
///
/// The core only buffers state in RAM; everything durable flows through
/// this contract. Implementations are internally synchronized. During a
/// commit the coordinator additionally holds the pipeline write lock, so
/// `flush` never races task application.
#[auto_impl::auto_impl(&, Arc)]
pub trait Aggregator: Send + Sync {
    /// Position the aggregator at the transaction number about to execute.
    fn set_tx_num(&self, tx_num: TxNumber);

    /// Position the aggregator at the block about to execute.
    fn set_block_num(&self, block_num: u64);

    /// Absorb a task's write set into the history WAL.
    fn absorb_changes(&self, task: &TxTask) -> Result<(), DatabaseError>;

    /// End-of-block effects, invoked when a block's post-block task applies.
    fn apply_state(&self, task: &TxTask) -> Result<(), DatabaseError>;

    /// Forward a task's logs and traces to the history WAL.
    fn apply_history(&self, task: &TxTask) -> Result<(), DatabaseError>;

    /// Flush the WAL into the durable store.
    fn flush(&self, tx: &mut dyn DbTxMut) -> Result<(), DatabaseError>;

    /// Whether retired history is available for pruning.
    fn can_prune(&self, tx: &dyn DbTx) -> bool;

    /// Prune up to `budget` transaction numbers of retired history.
    fn prune(&self, tx: &mut dyn DbTxMut, budget: u64) -> Result<(), DatabaseError>;

    /// Compute the commitment over the post-execution state.
    fn compute_commitment(&self, finalize: bool) -> Result<B256, DatabaseError>;

    /// Kick off background snapshot-file building up to `tx_num`.
    fn build_files_in_background(&self, tx_num: TxNumber);

    /// Whether a background file build is currently running.
    fn has_background_files_build(&self) -> bool;

    /// Human-readable progress of the background file build.
    fn background_progress(&self) -> String;

    /// Keep at least `steps` aggregation steps in the database instead of
    /// retiring them to files.
    fn keep_in_db(&self, steps: u64);

    /// Merge partially built snapshot files left over from a hard stop.
    fn merge_loop(&self) -> Result<(), DatabaseError>;

    /// The history steps available for reconstitution, oldest first.
    fn make_steps(&self) -> Result<Vec<Box<dyn AggregatorStep>>, DatabaseError>;

    /// Restore normal kernel readahead on the snapshot files.
    fn enable_madv_normal(&self);

    /// Disable kernel readahead on the snapshot files.
    fn disable_read_ahead(&self);
}

/// A read view over one history aggregation step, used by the
/// reconstitution engine.
pub trait AggregatorStep: Send + Sync {
    /// The `[start, end)` transaction-number range this step covers.
    fn tx_num_range(&self) -> (TxNumber, TxNumber);

    /// An independent clone of this view, one per replay worker.
    fn clone_step(&self) -> Box<dyn AggregatorStep>;

    /// Visit the transaction numbers in this step that changed any account.
    fn touched_accounts(&self, f: &mut dyn FnMut(TxNumber));

    /// Visit the transaction numbers in this step that changed any storage
    /// slot.
    fn touched_storage(&self, f: &mut dyn FnMut(TxNumber));

    /// Visit the transaction numbers in this step that changed any contract
    /// code.
    fn touched_code(&self, f: &mut dyn FnMut(TxNumber));

    /// The latest historical value of `key` at a transaction number strictly
    /// below `tx_num`, if the history snapshots cover it. The outer `None`
    /// means "not covered, fall through to the store"; the inner `None` is a
    /// recorded deletion.
    fn read_as_of(&self, key: &StateKey, tx_num: TxNumber) -> Option<Option<Bytes>>;
}
