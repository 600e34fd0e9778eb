use alloy_primitives::{Address, Bytes, B256};
use sorrel_db::DatabaseError;
use sorrel_primitives::TxTask;

/// Capability set handed to the virtual machine for state access.
///
/// Implementations differ in where they read from: the execution pipeline
/// reads overlay-then-store, the reconstitution pipeline reads
/// history-snapshot-then-store. Recording the read set, where required, is
/// the implementation's concern.
pub trait StateReader {
    /// Read the account entry of `address`. `None` means the account does
    /// not exist.
    fn read_account(&mut self, address: Address) -> Result<Option<Bytes>, DatabaseError>;

    /// Read the storage `slot` of `address`.
    fn read_storage(
        &mut self,
        address: Address,
        slot: B256,
    ) -> Result<Option<Bytes>, DatabaseError>;

    /// Read the contract code of `address`.
    fn read_code(&mut self, address: Address) -> Result<Option<Bytes>, DatabaseError>;
}

/// The virtual machine that interprets a single task.
///
/// `run_tx_task` is a pure function of the task inputs and the state visible
/// through `reader`: it populates the task's outputs (`gas_used`, `logs`,
/// `write_set`) and records a transaction-level failure in `task.error`.
/// Infrastructure failures are returned through the `Result`.
pub trait Vm: Send {
    /// Execute `task` against the state visible through `reader`.
    fn run_tx_task(
        &mut self,
        task: &mut TxTask,
        reader: &mut dyn StateReader,
    ) -> Result<(), DatabaseError>;
}

/// Creates one VM instance per worker.
#[auto_impl::auto_impl(&, Arc)]
pub trait VmFactory: Send + Sync {
    /// Create a fresh VM instance.
    fn create(&self) -> Box<dyn Vm>;
}
