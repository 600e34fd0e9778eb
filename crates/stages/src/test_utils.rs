//! Test doubles for the execution pipeline's external collaborators: a
//! scripted VM, a deterministic chain builder that precomputes header roots
//! and the change history, and recording aggregator/unwinder/reader stubs.

#![allow(missing_docs)]

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use parking_lot::Mutex;
use sorrel_db::{
    models::{put_block_body_indices, StoredBlockBodyIndices},
    tables, Database, DatabaseError, DbTx, DbTxMut, MemDb,
};
use sorrel_interfaces::{
    Aggregator, AggregatorStep, BlockReader, StateReader, Vm, VmFactory,
};
use sorrel_primitives::{
    Block, BlockNumber, Header, StateKey, TaskError, Transaction, TxNumber, TxTask,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

/// One scripted VM operation.
#[derive(Debug, Clone)]
pub enum Op {
    /// Read a key (recorded into the read set).
    Read(StateKey),
    /// Write a constant value.
    Write(StateKey, Bytes),
    /// Read a u64 counter, add one, write it back. Creates a genuine
    /// read→write dependency between tasks touching the same key.
    Incr(StateKey),
    /// Delete a key.
    Delete(StateKey),
}

/// Scripted behavior of one task.
#[derive(Debug, Clone, Default)]
pub struct TestProgram {
    pub ops: Vec<Op>,
    pub gas: u64,
    pub fail: bool,
}

impl TestProgram {
    pub fn new(ops: Vec<Op>, gas: u64) -> Self {
        Self { ops, gas, fail: false }
    }

    pub fn failing() -> Self {
        Self { fail: true, ..Default::default() }
    }

    fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.gas == 0 && !self.fail
    }
}

type Programs = HashMap<(BlockNumber, i32), TestProgram>;

/// VM double that executes [`TestProgram`]s keyed by `(block, tx_index)`.
#[derive(Debug, Clone)]
pub struct MockVm {
    programs: Arc<Programs>,
}

fn read_key(
    reader: &mut dyn StateReader,
    key: &StateKey,
) -> Result<Option<Bytes>, DatabaseError> {
    match key {
        StateKey::Account(address) => reader.read_account(*address),
        StateKey::Storage(address, slot) => reader.read_storage(*address, *slot),
        StateKey::Code(address) => reader.read_code(*address),
    }
}

fn counter_bytes(value: u64) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

fn parse_counter(value: Option<&Bytes>) -> u64 {
    value
        .and_then(|bytes| bytes.as_ref().try_into().ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

impl Vm for MockVm {
    fn run_tx_task(
        &mut self,
        task: &mut TxTask,
        reader: &mut dyn StateReader,
    ) -> Result<(), DatabaseError> {
        let Some(program) = self.programs.get(&(task.block_num, task.tx_index)) else {
            return Ok(());
        };
        if program.fail {
            task.error = Some(TaskError::new("scripted failure"));
            return Ok(());
        }
        for op in &program.ops {
            match op {
                Op::Read(key) => {
                    read_key(reader, key)?;
                }
                Op::Write(key, value) => {
                    task.write_set.insert(key.clone(), Some(value.clone()));
                }
                Op::Delete(key) => {
                    task.write_set.insert(key.clone(), None);
                }
                Op::Incr(key) => {
                    let current = read_key(reader, key)?;
                    let next = parse_counter(current.as_ref()) + 1;
                    task.write_set.insert(key.clone(), Some(counter_bytes(next)));
                }
            }
        }
        task.gas_used = program.gas;
        Ok(())
    }
}

/// Factory handing out [`MockVm`] instances sharing one program table.
#[derive(Debug, Clone)]
pub struct MockVmFactory {
    programs: Arc<Programs>,
}

impl VmFactory for MockVmFactory {
    fn create(&self) -> Box<dyn Vm> {
        Box::new(MockVm { programs: Arc::clone(&self.programs) })
    }
}

/// A transaction in a [`TestBlockSpec`].
#[derive(Debug, Clone)]
pub struct TestTx {
    pub sender: Address,
    pub nonce: u64,
    pub program: TestProgram,
}

impl TestTx {
    pub fn new(sender: Address, nonce: u64, program: TestProgram) -> Self {
        Self { sender, nonce, program }
    }
}

/// Specification of one block to build.
#[derive(Debug, Clone, Default)]
pub struct TestBlockSpec {
    pub txs: Vec<TestTx>,
    pub pre: TestProgram,
    pub post: TestProgram,
}

impl TestBlockSpec {
    pub fn with_txs(txs: Vec<TestTx>) -> Self {
        Self { txs, ..Default::default() }
    }
}

pub type ChangeLog = BTreeMap<TxNumber, Vec<(StateKey, Option<Bytes>)>>;

/// A deterministic chain fixture.
///
/// Built by simulating sequential execution of the scripted programs, so
/// header roots, header gas and the per-transaction change history all
/// agree with what [`MockVm`] plus [`TestAggregator`] will produce.
#[derive(Debug, Clone)]
pub struct TestChain {
    pub blocks: Vec<Block>,
    pub programs: Arc<Programs>,
    pub history: Arc<ChangeLog>,
    /// Final simulated state, keyed by the state-key encoding.
    pub final_state: BTreeMap<Vec<u8>, Bytes>,
    pub max_tx_num: TxNumber,
}

impl TestChain {
    pub fn build(specs: Vec<TestBlockSpec>) -> Self {
        let mut programs = Programs::new();
        let mut history = ChangeLog::new();
        let mut state: BTreeMap<Vec<u8>, Bytes> = BTreeMap::new();
        let mut blocks = Vec::with_capacity(specs.len());
        let mut tx_num: TxNumber = 0;
        let mut parent_hash = B256::ZERO;

        for (block_num, spec) in specs.into_iter().enumerate() {
            let block_num = block_num as BlockNumber;
            let txs_len = spec.txs.len() as i32;
            let mut gas_used = 0u64;

            for tx_index in -1..=txs_len {
                let program = if tx_index < 0 {
                    &spec.pre
                } else if tx_index == txs_len {
                    &spec.post
                } else {
                    &spec.txs[tx_index as usize].program
                };
                let changes = simulate(program, &mut state);
                if !changes.is_empty() {
                    history.insert(tx_num, changes);
                }
                gas_used += program.gas;
                if !program.is_empty() {
                    programs.insert((block_num, tx_index), program.clone());
                }
                tx_num += 1;
            }

            let header = Header {
                number: block_num,
                parent_hash,
                state_root: state_root(&state),
                beneficiary: Address::with_last_byte(0xfe),
                gas_limit: 30_000_000,
                gas_used,
                timestamp: 1_700_000_000 + block_num * 12,
                base_fee_per_gas: Some(7),
            };
            parent_hash = header.hash_slow();

            let body = spec
                .txs
                .iter()
                .enumerate()
                .map(|(index, tx)| Transaction {
                    hash: {
                        let mut buf = [0u8; 16];
                        buf[..8].copy_from_slice(&block_num.to_be_bytes());
                        buf[8..].copy_from_slice(&(index as u64).to_be_bytes());
                        keccak256(buf)
                    },
                    nonce: tx.nonce,
                    gas_limit: tx.program.gas.max(21_000),
                    to: Some(Address::with_last_byte(0xee)),
                    value: U256::ZERO,
                    input: Bytes::new(),
                    sender: Some(tx.sender),
                })
                .collect();

            blocks.push(Block { header, body, ommers: Vec::new(), withdrawals: Vec::new() });
        }

        Self {
            blocks,
            programs: Arc::new(programs),
            history: Arc::new(history),
            final_state: state,
            max_tx_num: tx_num.saturating_sub(1),
        }
    }

    pub fn vm_factory(&self) -> MockVmFactory {
        MockVmFactory { programs: Arc::clone(&self.programs) }
    }

    /// First transaction number of `block`.
    pub fn first_tx_num(&self, block: BlockNumber) -> TxNumber {
        self.blocks[..block as usize]
            .iter()
            .map(|b| b.body.len() as u64 + 2)
            .sum()
    }

    /// Last transaction number of `block` (its post-block task).
    pub fn last_tx_num(&self, block: BlockNumber) -> TxNumber {
        self.first_tx_num(block) + self.blocks[block as usize].body.len() as u64 + 1
    }

    pub fn block_reader(&self) -> TestBlockReader {
        TestBlockReader { blocks: Arc::new(self.blocks.clone()) }
    }

    pub fn last_block(&self) -> BlockNumber {
        self.blocks.len() as BlockNumber - 1
    }

    /// A fresh store seeded with the block↔tx-number index.
    pub fn setup_db(&self) -> MemDb {
        let db = MemDb::new();
        let mut tx = db.tx_mut().unwrap();
        let mut first_tx_num = 0;
        for block in &self.blocks {
            let tx_count = block.body.len() as u64 + 2;
            put_block_body_indices(
                &mut *tx,
                block.number(),
                StoredBlockBodyIndices { first_tx_num, tx_count },
            )
            .unwrap();
            first_tx_num += tx_count;
        }
        tx.commit().unwrap();
        db
    }

    /// The expected contents of the main state tables after executing the
    /// whole chain.
    pub fn expected_tables(&self) -> [(&'static str, BTreeMap<Vec<u8>, Vec<u8>>); 3] {
        let mut plain_state = BTreeMap::new();
        let mut code = BTreeMap::new();
        let mut contract_code = BTreeMap::new();
        for (key, value) in &self.final_state {
            match key.first() {
                Some(2) => {
                    code.insert(key.clone(), value.to_vec());
                    contract_code.insert(key.clone(), keccak256(value).to_vec());
                }
                _ => {
                    plain_state.insert(key.clone(), value.to_vec());
                }
            }
        }
        [
            (tables::PLAIN_STATE, plain_state),
            (tables::CODE, code),
            (tables::PLAIN_CONTRACT_CODE, contract_code),
        ]
    }
}

fn simulate(
    program: &TestProgram,
    state: &mut BTreeMap<Vec<u8>, Bytes>,
) -> Vec<(StateKey, Option<Bytes>)> {
    let mut changes: BTreeMap<StateKey, Option<Bytes>> = BTreeMap::new();
    for op in &program.ops {
        match op {
            Op::Read(_) => {}
            Op::Write(key, value) => {
                state.insert(key.encode(), value.clone());
                changes.insert(key.clone(), Some(value.clone()));
            }
            Op::Delete(key) => {
                state.remove(&key.encode());
                changes.insert(key.clone(), None);
            }
            Op::Incr(key) => {
                let next = parse_counter(state.get(&key.encode())) + 1;
                let value = counter_bytes(next);
                state.insert(key.encode(), value.clone());
                changes.insert(key.clone(), Some(value));
            }
        }
    }
    changes.into_iter().collect()
}

fn state_root(state: &BTreeMap<Vec<u8>, Bytes>) -> B256 {
    let mut buf = Vec::new();
    for (key, value) in state {
        buf.extend_from_slice(&(key.len() as u64).to_be_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(&(value.len() as u64).to_be_bytes());
        buf.extend_from_slice(value);
    }
    keccak256(&buf)
}

/// Block reader over a fixed chain.
#[derive(Debug, Clone)]
pub struct TestBlockReader {
    blocks: Arc<Vec<Block>>,
}

impl BlockReader for TestBlockReader {
    fn block_by_number(
        &self,
        _tx: &dyn DbTx,
        number: BlockNumber,
    ) -> Result<Option<Block>, DatabaseError> {
        Ok(self.blocks.get(number as usize).cloned())
    }

    fn header(
        &self,
        _tx: &dyn DbTx,
        _hash: B256,
        number: BlockNumber,
    ) -> Result<Option<Header>, DatabaseError> {
        Ok(self.blocks.get(number as usize).map(|block| block.header.clone()))
    }

    fn raw_transactions(
        &self,
        _tx: &dyn DbTx,
        _from: BlockNumber,
        _to: BlockNumber,
    ) -> Result<Vec<Bytes>, DatabaseError> {
        Ok(Vec::new())
    }

    fn frozen_blocks(&self) -> BlockNumber {
        0
    }
}

#[derive(Debug, Default)]
struct AggInner {
    /// Pending changes since the last flush, keyed by the state-key
    /// encoding.
    wal: BTreeMap<Vec<u8>, Option<Bytes>>,
    /// Full current state, for the commitment.
    cumulative: BTreeMap<Vec<u8>, Bytes>,
    /// Absorb order, for monotonicity assertions.
    absorbed_tx_nums: Vec<TxNumber>,
    last_absorbed_final: bool,
    /// Set if a flush ever happened while mid-block.
    flushed_mid_block: bool,
    flush_count: u64,
    logs_seen: u64,
    files_built_at: Vec<TxNumber>,
}

/// Aggregator double: WAL in a map, commitment as a digest over the
/// cumulative state, optional recorded history served as steps.
#[derive(Debug, Default)]
pub struct TestAggregator {
    inner: Mutex<AggInner>,
    history: Option<Arc<ChangeLog>>,
    step_count: usize,
    history_end: TxNumber,
}

impl TestAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// An aggregator whose history snapshots cover the chain through
    /// `last_covered_block`, split into `step_count` steps.
    pub fn with_history(
        chain: &TestChain,
        step_count: usize,
        last_covered_block: BlockNumber,
    ) -> Self {
        Self {
            inner: Mutex::default(),
            history: Some(Arc::clone(&chain.history)),
            step_count,
            history_end: chain.last_tx_num(last_covered_block) + 1,
        }
    }

    pub fn absorbed_tx_nums(&self) -> Vec<TxNumber> {
        self.inner.lock().absorbed_tx_nums.clone()
    }

    pub fn flush_count(&self) -> u64 {
        self.inner.lock().flush_count
    }

    pub fn flushed_mid_block(&self) -> bool {
        self.inner.lock().flushed_mid_block
    }

    pub fn logs_seen(&self) -> u64 {
        self.inner.lock().logs_seen
    }

    pub fn files_built_at(&self) -> Vec<TxNumber> {
        self.inner.lock().files_built_at.clone()
    }
}

impl Aggregator for TestAggregator {
    fn set_tx_num(&self, _tx_num: TxNumber) {}

    fn set_block_num(&self, _block_num: u64) {}

    fn absorb_changes(&self, task: &TxTask) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock();
        inner.absorbed_tx_nums.push(task.tx_num);
        inner.last_absorbed_final = task.is_final;
        let mut changes: Vec<_> = task.write_set.iter().collect();
        changes.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in changes {
            let encoded = key.encode();
            match value {
                Some(value) => {
                    inner.cumulative.insert(encoded.clone(), value.clone());
                }
                None => {
                    inner.cumulative.remove(&encoded);
                }
            }
            inner.wal.insert(encoded, value.clone());
        }
        Ok(())
    }

    fn apply_state(&self, task: &TxTask) -> Result<(), DatabaseError> {
        debug_assert!(task.is_final);
        Ok(())
    }

    fn apply_history(&self, task: &TxTask) -> Result<(), DatabaseError> {
        self.inner.lock().logs_seen += task.logs.len() as u64;
        Ok(())
    }

    fn flush(&self, tx: &mut dyn DbTxMut) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock();
        if !inner.wal.is_empty() && !inner.last_absorbed_final {
            inner.flushed_mid_block = true;
        }
        inner.flush_count += 1;
        for (key, value) in std::mem::take(&mut inner.wal) {
            match key.first() {
                Some(2) => match value {
                    Some(code) => {
                        tx.put(tables::CODE, &key, &code)?;
                        tx.put(tables::PLAIN_CONTRACT_CODE, &key, keccak256(&code).as_slice())?;
                    }
                    None => {
                        tx.delete(tables::CODE, &key)?;
                        tx.delete(tables::PLAIN_CONTRACT_CODE, &key)?;
                    }
                },
                _ => match value {
                    Some(value) => tx.put(tables::PLAIN_STATE, &key, &value)?,
                    None => {
                        tx.delete(tables::PLAIN_STATE, &key)?;
                    }
                },
            }
        }
        Ok(())
    }

    fn can_prune(&self, _tx: &dyn DbTx) -> bool {
        false
    }

    fn prune(&self, _tx: &mut dyn DbTxMut, _budget: u64) -> Result<(), DatabaseError> {
        Ok(())
    }

    fn compute_commitment(&self, _finalize: bool) -> Result<B256, DatabaseError> {
        let inner = self.inner.lock();
        let mut buf = Vec::new();
        for (key, value) in &inner.cumulative {
            buf.extend_from_slice(&(key.len() as u64).to_be_bytes());
            buf.extend_from_slice(key);
            buf.extend_from_slice(&(value.len() as u64).to_be_bytes());
            buf.extend_from_slice(value);
        }
        Ok(keccak256(&buf))
    }

    fn build_files_in_background(&self, tx_num: TxNumber) {
        self.inner.lock().files_built_at.push(tx_num);
    }

    fn has_background_files_build(&self) -> bool {
        false
    }

    fn background_progress(&self) -> String {
        String::new()
    }

    fn keep_in_db(&self, _steps: u64) {}

    fn merge_loop(&self) -> Result<(), DatabaseError> {
        Ok(())
    }

    fn make_steps(&self) -> Result<Vec<Box<dyn AggregatorStep>>, DatabaseError> {
        let Some(history) = &self.history else {
            return Ok(Vec::new());
        };
        let count = self.step_count.max(1) as u64;
        let width = self.history_end.div_ceil(count);
        let mut steps: Vec<Box<dyn AggregatorStep>> = Vec::new();
        let mut start = 0;
        while start < self.history_end {
            let end = (start + width).min(self.history_end);
            steps.push(Box::new(TestAggregatorStep {
                history: Arc::clone(history),
                range: (start, end),
            }));
            start = end;
        }
        Ok(steps)
    }

    fn enable_madv_normal(&self) {}

    fn disable_read_ahead(&self) {}
}

/// History view over one step of the recorded change log.
#[derive(Debug, Clone)]
pub struct TestAggregatorStep {
    history: Arc<ChangeLog>,
    range: (TxNumber, TxNumber),
}

impl TestAggregatorStep {
    fn touched(&self, matches: impl Fn(&StateKey) -> bool, f: &mut dyn FnMut(TxNumber)) {
        for (tx_num, changes) in self.history.range(self.range.0..self.range.1) {
            if changes.iter().any(|(key, _)| matches(key)) {
                f(*tx_num);
            }
        }
    }
}

impl AggregatorStep for TestAggregatorStep {
    fn tx_num_range(&self) -> (TxNumber, TxNumber) {
        self.range
    }

    fn clone_step(&self) -> Box<dyn AggregatorStep> {
        Box::new(self.clone())
    }

    fn touched_accounts(&self, f: &mut dyn FnMut(TxNumber)) {
        self.touched(|key| matches!(key, StateKey::Account(_)), f)
    }

    fn touched_storage(&self, f: &mut dyn FnMut(TxNumber)) {
        self.touched(|key| matches!(key, StateKey::Storage(..)), f)
    }

    fn touched_code(&self, f: &mut dyn FnMut(TxNumber)) {
        self.touched(|key| matches!(key, StateKey::Code(_)), f)
    }

    fn read_as_of(&self, key: &StateKey, tx_num: TxNumber) -> Option<Option<Bytes>> {
        for (_, changes) in self.history.range(..tx_num).rev() {
            if let Some((_, value)) = changes.iter().find(|(k, _)| k == key) {
                return Some(value.clone());
            }
        }
        // not covered: the key was never written in recorded history
        None
    }
}

/// Unwinder double recording every request.
#[derive(Debug, Default)]
pub struct TestUnwinder {
    pub calls: Vec<(BlockNumber, B256)>,
}

impl sorrel_interfaces::Unwinder for TestUnwinder {
    fn unwind_to(&mut self, block: BlockNumber, bad_block: B256) {
        self.calls.push((block, bad_block));
    }
}

/// Header reporter double recording every bad-header report.
#[derive(Debug, Default)]
pub struct TestHeaderReporter {
    pub reports: Mutex<Vec<(B256, B256)>>,
}

impl sorrel_interfaces::HeaderReporter for TestHeaderReporter {
    fn report_bad_header(&self, hash: B256, parent: B256) {
        self.reports.lock().push((hash, parent));
    }
}

/// Dump a table into a map for comparisons.
pub fn dump_table(db: &MemDb, table: &'static str) -> BTreeMap<Vec<u8>, Vec<u8>> {
    let tx = db.tx().unwrap();
    let mut out = BTreeMap::new();
    tx.for_each(table, &[], &mut |key, value| {
        out.insert(key.to_vec(), value.to_vec());
        Ok(())
    })
    .unwrap();
    out
}
