//! End-to-end tests of the execution stage over the in-memory store: both
//! pipelines produce byte-identical state, apply order is monotone, failed
//! root/gas checks unwind, and checkpoints only ever land on block
//! boundaries.

use alloy_primitives::{Address, Bytes, B256};
use assert_matches::assert_matches;
use sorrel_db::MemDb;
use sorrel_primitives::{StateKey, TxNumber};
use sorrel_stages::{
    test_utils::{
        dump_table, Op, TestAggregator, TestBlockSpec, TestChain, TestHeaderReporter,
        TestProgram, TestTx, TestUnwinder,
    },
    ExecConfig, ExecutionStage, StageError,
};
use sorrel_state::CancelToken;
use std::{sync::Arc, time::Duration};

fn addr(n: u8) -> Address {
    Address::from([n; 20])
}

fn counter(n: u8) -> StateKey {
    StateKey::Storage(addr(0xc0), B256::from([n; 32]))
}

fn account(n: u8) -> StateKey {
    StateKey::Account(addr(n))
}

/// A block of `txs` transactions from distinct senders, each bumping its
/// own account plus one of `hot` shared counters. Adjacent transactions
/// conflict on the hot counters, exercising validation and retry.
fn contended_block(block_num: u8, txs: usize, hot: u8) -> TestBlockSpec {
    let txs = (0..txs)
        .map(|i| {
            let sender = addr(10 + i as u8);
            let program = TestProgram::new(
                vec![
                    Op::Incr(account(10 + i as u8)),
                    Op::Incr(counter(i as u8 % hot)),
                    Op::Read(counter((i as u8 + 1) % hot)),
                ],
                21_000,
            );
            TestTx::new(sender, block_num as u64, program)
        })
        .collect();
    let post = TestProgram::new(vec![Op::Incr(account(0xfe))], 0);
    TestBlockSpec { txs, pre: TestProgram::default(), post }
}

fn contended_chain(blocks: usize, txs: usize) -> TestChain {
    TestChain::build((0..blocks).map(|b| contended_block(b as u8, txs, 3)).collect())
}

struct Harness {
    chain: TestChain,
    db: MemDb,
    aggregator: Arc<TestAggregator>,
    reporter: Arc<TestHeaderReporter>,
    stage: ExecutionStage,
}

impl Harness {
    fn new(chain: TestChain, config: ExecConfig) -> Self {
        let db = chain.setup_db();
        let aggregator = Arc::new(TestAggregator::new());
        let reporter = Arc::new(TestHeaderReporter::default());
        let stage = ExecutionStage::new(
            config,
            Arc::new(db.clone()),
            Arc::new(chain.block_reader()),
            Arc::new(chain.vm_factory()),
            aggregator.clone(),
        )
        .with_header_reporter(reporter.clone());
        Self { chain, db, aggregator, reporter, stage }
    }

    fn execute(&mut self) -> Result<sorrel_stages::ExecOutput, StageError> {
        let mut unwinder = TestUnwinder::default();
        self.stage.execute(&mut unwinder, self.chain.last_block(), &CancelToken::new())
    }

    fn execute_with_unwinder(
        &mut self,
        unwinder: &mut TestUnwinder,
    ) -> Result<sorrel_stages::ExecOutput, StageError> {
        self.stage.execute(unwinder, self.chain.last_block(), &CancelToken::new())
    }

    fn assert_state_matches_chain(&self) {
        for (table, expected) in self.chain.expected_tables() {
            assert_eq!(dump_table(&self.db, table), expected, "table {table} diverged");
        }
    }
}

fn parallel_config() -> ExecConfig {
    ExecConfig { parallel: true, worker_count: 4, ..Default::default() }
}

#[test]
fn sequential_executes_chain_and_verifies_roots() {
    let mut harness = Harness::new(contended_chain(4, 4), ExecConfig::default());
    let output = harness.execute().unwrap();

    assert!(output.done);
    assert_eq!(output.checkpoint.block_number, harness.chain.last_block());
    assert_eq!(output.checkpoint.tx_number, harness.chain.max_tx_num);
    harness.assert_state_matches_chain();
    assert!(harness.aggregator.flush_count() >= 1);
    assert!(!harness.aggregator.flushed_mid_block());
}

#[test]
fn parallel_state_is_byte_identical_to_sequential() {
    let chain = contended_chain(6, 6);

    let mut sequential = Harness::new(chain.clone(), ExecConfig::default());
    let seq_out = sequential.execute().unwrap();

    let mut parallel = Harness::new(chain, parallel_config());
    let par_out = parallel.execute().unwrap();

    assert!(seq_out.done && par_out.done);
    assert_eq!(seq_out.checkpoint, par_out.checkpoint);
    for (table, _) in sequential.chain.expected_tables() {
        assert_eq!(
            dump_table(&sequential.db, table),
            dump_table(&parallel.db, table),
            "table {table} diverged between pipelines"
        );
    }
    sequential.assert_state_matches_chain();
    parallel.assert_state_matches_chain();
}

#[test]
fn parallel_apply_order_is_monotone_and_dense() {
    let mut harness = Harness::new(contended_chain(5, 5), parallel_config());
    harness.execute().unwrap();

    let absorbed = harness.aggregator.absorbed_tx_nums();
    let expected: Vec<TxNumber> = (0..=harness.chain.max_tx_num).collect();
    assert_eq!(absorbed, expected);
}

#[test]
fn same_sender_transactions_commit_in_nonce_order() {
    // two transactions from one sender bump the same counter; the second is
    // deferred at dispatch and must still land after the first
    let sender = addr(42);
    let spec = TestBlockSpec::with_txs(vec![
        TestTx::new(sender, 0, TestProgram::new(vec![Op::Incr(counter(0))], 21_000)),
        TestTx::new(sender, 1, TestProgram::new(vec![Op::Incr(counter(0))], 21_000)),
    ]);
    let mut harness = Harness::new(TestChain::build(vec![spec]), parallel_config());
    harness.execute().unwrap();

    harness.assert_state_matches_chain();
    let plain_state = dump_table(&harness.db, sorrel_db::tables::PLAIN_STATE);
    assert_eq!(
        plain_state.get(&counter(0).encode()),
        Some(&2u64.to_be_bytes().to_vec()),
        "both increments must be applied, in order"
    );
}

#[test]
fn parallel_commits_only_at_block_boundaries() {
    let config = ExecConfig {
        parallel: true,
        worker_count: 4,
        batch_size: 1,
        log_interval: Duration::from_millis(5),
        prune_interval: Duration::from_millis(5),
        ..Default::default()
    };
    let mut harness = Harness::new(contended_chain(24, 4), config);
    let output = harness.execute().unwrap();

    assert!(output.done);
    assert!(!harness.aggregator.flushed_mid_block());
    harness.assert_state_matches_chain();
}

#[test]
fn root_mismatch_reports_and_unwinds_with_binary_search() {
    let mut chain = contended_chain(8, 2);
    let bad_block = 5u64;
    chain.blocks[bad_block as usize].header.state_root = B256::repeat_byte(0xaa);
    let bad_hash = chain.blocks[bad_block as usize].header.hash_slow();
    let max_block = chain.last_block();

    let mut harness = Harness::new(chain, ExecConfig::default());
    let mut unwinder = TestUnwinder::default();
    let output = harness.execute_with_unwinder(&mut unwinder).unwrap();

    assert!(!output.done);
    assert_eq!(output.checkpoint.block_number, bad_block - 1);
    // binary search between the stage start (0) and the target, biased older
    assert_eq!(unwinder.calls, vec![((max_block) / 2, bad_hash)]);
    assert_eq!(harness.reporter.reports.lock().len(), 1);
}

#[test]
fn root_mismatch_halts_when_configured() {
    let mut chain = contended_chain(4, 2);
    chain.blocks[2].header.state_root = B256::repeat_byte(0xbb);

    let config = ExecConfig { bad_block_halt: true, ..Default::default() };
    let mut harness = Harness::new(chain, config);
    assert_matches!(
        harness.execute(),
        Err(StageError::RootMismatch { block: 2, .. })
    );
}

#[test]
fn gas_mismatch_fails_the_block() {
    let mut chain = contended_chain(5, 2);
    chain.blocks[3].header.gas_used += 1;

    // isolate the gas cross-check from the root check
    let config = ExecConfig { discard_commitment: true, ..Default::default() };
    let mut harness = Harness::new(chain, config);
    let mut unwinder = TestUnwinder::default();
    let output = harness.execute_with_unwinder(&mut unwinder).unwrap();
    assert!(!output.done);
    assert_eq!(output.checkpoint.block_number, 2);
    assert_eq!(unwinder.calls.len(), 1);
    assert_eq!(unwinder.calls[0].0, 2);

    let config =
        ExecConfig { discard_commitment: true, bad_block_halt: true, ..Default::default() };
    let mut chain = contended_chain(5, 2);
    chain.blocks[3].header.gas_used += 1;
    let mut harness = Harness::new(chain, config);
    assert_matches!(
        harness.execute(),
        Err(StageError::GasMismatch { block: 3, .. })
    );
}

#[test]
fn genesis_is_exempt_from_the_gas_cross_check() {
    let mut chain = contended_chain(3, 2);
    chain.blocks[0].header.gas_used += 1;

    let config = ExecConfig { discard_commitment: true, ..Default::default() };
    let mut harness = Harness::new(chain, config);
    let output = harness.execute().unwrap();
    assert!(output.done, "genesis gas mismatch must not fail the stage");
}

#[test]
fn vm_error_surfaces_as_execution_failure() {
    let mut specs: Vec<TestBlockSpec> = (0..3).map(|b| contended_block(b, 2, 2)).collect();
    specs[1].txs[1].program = TestProgram::failing();
    let chain = TestChain::build(specs);

    let config =
        ExecConfig { discard_commitment: true, bad_block_halt: true, ..Default::default() };
    let mut harness = Harness::new(chain, config);
    assert_matches!(
        harness.execute(),
        Err(StageError::Execution { block: 1, .. })
    );
}

#[test]
fn resumes_from_the_persisted_checkpoint() {
    let chain = contended_chain(6, 3);
    let mut harness = Harness::new(chain.clone(), ExecConfig::default());

    // first leg: stop at block 2
    let mut unwinder = TestUnwinder::default();
    let first = harness.stage.execute(&mut unwinder, 2, &CancelToken::new()).unwrap();
    assert!(first.done);
    assert_eq!(first.checkpoint.block_number, 2);
    assert_eq!(first.checkpoint.tx_number, chain.last_tx_num(2));

    // second leg continues where the checkpoint points
    let second = harness.execute().unwrap();
    assert!(second.done);
    assert_eq!(second.checkpoint.block_number, chain.last_block());
    harness.assert_state_matches_chain();

    // dense apply order across both legs
    let expected: Vec<TxNumber> = (0..=chain.max_tx_num).collect();
    assert_eq!(harness.aggregator.absorbed_tx_nums(), expected);
}

#[test]
fn caught_up_stage_is_a_no_op() {
    let mut harness = Harness::new(contended_chain(3, 2), ExecConfig::default());
    let first = harness.execute().unwrap();
    let second = harness.execute().unwrap();
    assert!(second.done);
    assert_eq!(first.checkpoint, second.checkpoint);
}

#[test]
fn cancellation_is_a_clean_exit() {
    for config in [ExecConfig::default(), parallel_config()] {
        let chain = contended_chain(4, 2);
        let mut harness = Harness::new(chain, config);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut unwinder = TestUnwinder::default();
        let result =
            harness.stage.execute(&mut unwinder, harness.chain.last_block(), &cancel);
        assert_matches!(result, Err(StageError::Canceled));
    }
}

#[test]
fn empty_blocks_only_run_system_tasks() {
    let chain = TestChain::build(vec![
        TestBlockSpec::default(),
        TestBlockSpec {
            post: TestProgram::new(vec![Op::Write(account(1), Bytes::from_static(b"x"))], 0),
            ..Default::default()
        },
    ]);
    let mut harness = Harness::new(chain, ExecConfig::default());
    let output = harness.execute().unwrap();
    assert!(output.done);
    harness.assert_state_matches_chain();
}
