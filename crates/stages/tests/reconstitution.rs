//! End-to-end tests of the reconstitution engine: replaying a history range
//! into a fresh store produces exactly the state forward execution
//! produces, scratch flushes fold correctly through the transpose, and
//! boundary mapping failures are fatal.

use alloy_primitives::{Address, Bytes, B256};
use assert_matches::assert_matches;
use sorrel_db::{tables, MemDb};
use sorrel_primitives::{StateKey, EXECUTION};
use sorrel_stages::{
    reconstitute_state, stage_checkpoint,
    test_utils::{
        dump_table, Op, TestAggregator, TestBlockSpec, TestChain, TestProgram, TestTx,
        TestUnwinder,
    },
    ExecConfig, ExecutionStage, StageError,
};
use sorrel_state::CancelToken;
use std::{sync::Arc, time::Duration};

fn addr(n: u8) -> Address {
    Address::from([n; 20])
}

fn slot(n: u8) -> B256 {
    B256::from([n; 32])
}

/// A chain exercising every write shape: account counters, storage writes,
/// code deploys and deletes, plus no-op transactions that must stay out of
/// the replay set.
fn history_chain(blocks: usize) -> TestChain {
    let specs = (0..blocks as u64)
        .map(|block_num| {
            let mut txs = vec![
                TestTx::new(
                    addr(10),
                    block_num,
                    TestProgram::new(
                        vec![
                            Op::Incr(StateKey::Account(addr(10))),
                            Op::Write(
                                StateKey::Storage(addr(10), slot(block_num as u8)),
                                Bytes::from_static(b"stored"),
                            ),
                        ],
                        21_000,
                    ),
                ),
                // a pure read: touches nothing, must not be replayed
                TestTx::new(
                    addr(11),
                    block_num,
                    TestProgram::new(vec![Op::Read(StateKey::Account(addr(10)))], 21_000),
                ),
            ];
            if block_num % 3 == 1 {
                txs.push(TestTx::new(
                    addr(12),
                    block_num,
                    TestProgram::new(
                        vec![Op::Write(
                            StateKey::Code(addr(12)),
                            Bytes::from(vec![block_num as u8; 16]),
                        )],
                        53_000,
                    ),
                ));
            }
            if block_num % 3 == 2 {
                txs.push(TestTx::new(
                    addr(12),
                    block_num,
                    TestProgram::new(
                        vec![
                            Op::Delete(StateKey::Storage(addr(10), slot(block_num as u8 - 2))),
                            Op::Delete(StateKey::Code(addr(12))),
                        ],
                        30_000,
                    ),
                ));
            }
            TestBlockSpec {
                txs,
                pre: TestProgram::default(),
                post: TestProgram::new(vec![Op::Incr(StateKey::Account(addr(0xfe)))], 0),
            }
        })
        .collect();
    TestChain::build(specs)
}

/// Forward-execute the chain up to `max_block` into a fresh store.
fn forward_execute(chain: &TestChain, max_block: u64) -> MemDb {
    let db = chain.setup_db();
    let mut stage = ExecutionStage::new(
        ExecConfig::default(),
        Arc::new(db.clone()),
        Arc::new(chain.block_reader()),
        Arc::new(chain.vm_factory()),
        Arc::new(TestAggregator::new()),
    );
    let mut unwinder = TestUnwinder::default();
    let output = stage.execute(&mut unwinder, max_block, &CancelToken::new()).unwrap();
    assert!(output.done);
    db
}

fn assert_same_state(forward: &MemDb, recon: &MemDb) {
    for table in [tables::PLAIN_STATE, tables::CODE, tables::PLAIN_CONTRACT_CODE] {
        assert_eq!(
            dump_table(forward, table),
            dump_table(recon, table),
            "table {table} diverged between forward execution and reconstitution"
        );
    }
}

#[test]
fn reconstitution_matches_forward_execution() {
    let chain = history_chain(9);
    let last_covered = chain.last_block() - 1;

    let forward_db = forward_execute(&chain, last_covered);

    let recon_db = chain.setup_db();
    let aggregator = TestAggregator::with_history(&chain, 3, last_covered);
    let checkpoint = reconstitute_state(
        &ExecConfig::default(),
        &recon_db,
        &chain.block_reader(),
        &chain.vm_factory(),
        &aggregator,
        &CancelToken::new(),
    )
    .unwrap();

    assert_eq!(checkpoint.block_number, last_covered);
    assert_eq!(checkpoint.tx_number, chain.last_tx_num(last_covered));
    assert_same_state(&forward_db, &recon_db);

    // the watermark is persisted alongside the transposed state
    let tx = sorrel_db::Database::tx(&recon_db).unwrap();
    assert_eq!(stage_checkpoint(&*tx, EXECUTION).unwrap(), Some(checkpoint));
}

#[test]
fn single_step_and_multi_step_agree() {
    let chain = history_chain(7);
    let last_covered = chain.last_block() - 1;

    let mut stores = Vec::new();
    for step_count in [1, 4] {
        let recon_db = chain.setup_db();
        let aggregator = TestAggregator::with_history(&chain, step_count, last_covered);
        reconstitute_state(
            &ExecConfig::default(),
            &recon_db,
            &chain.block_reader(),
            &chain.vm_factory(),
            &aggregator,
            &CancelToken::new(),
        )
        .unwrap();
        stores.push(recon_db);
    }
    assert_same_state(&stores[0], &stores[1]);
}

#[test]
fn mid_step_flushes_do_not_change_the_result() {
    let chain = history_chain(12);
    let last_covered = chain.last_block() - 1;
    let forward_db = forward_execute(&chain, last_covered);

    let recon_db = chain.setup_db();
    let aggregator = TestAggregator::with_history(&chain, 2, last_covered);
    let config = ExecConfig {
        batch_size: 1,
        log_interval: Duration::from_millis(2),
        ..Default::default()
    };
    reconstitute_state(
        &config,
        &recon_db,
        &chain.block_reader(),
        &chain.vm_factory(),
        &aggregator,
        &CancelToken::new(),
    )
    .unwrap();

    assert_same_state(&forward_db, &recon_db);
}

#[test]
fn history_past_the_block_index_is_a_boundary_error() {
    let chain = history_chain(5);
    let recon_db = chain.setup_db();
    // snapshots claim to cover the whole chain, so the first uncovered
    // block cannot be mapped
    let aggregator = TestAggregator::with_history(&chain, 1, chain.last_block());
    let result = reconstitute_state(
        &ExecConfig::default(),
        &recon_db,
        &chain.block_reader(),
        &chain.vm_factory(),
        &aggregator,
        &CancelToken::new(),
    );
    assert_matches!(result, Err(StageError::SnapshotBoundary { .. }));
}

#[test]
fn no_history_steps_is_a_no_op() {
    let chain = history_chain(3);
    let recon_db = chain.setup_db();
    let aggregator = TestAggregator::new();
    let checkpoint = reconstitute_state(
        &ExecConfig::default(),
        &recon_db,
        &chain.block_reader(),
        &chain.vm_factory(),
        &aggregator,
        &CancelToken::new(),
    )
    .unwrap();
    assert_eq!(checkpoint, Default::default());
    assert!(dump_table(&recon_db, tables::PLAIN_STATE).is_empty());
}

#[test]
fn replay_failure_aborts_the_step() {
    // history says tx (2, 0) writes, but the VM fails at replay time
    let specs = (0..6u64)
        .map(|block_num| {
            let program = if block_num == 2 {
                let mut broken = TestProgram::failing();
                broken.ops =
                    vec![Op::Write(StateKey::Account(addr(10)), Bytes::from_static(b"x"))];
                broken
            } else {
                TestProgram::new(vec![Op::Incr(StateKey::Account(addr(10)))], 21_000)
            };
            TestBlockSpec::with_txs(vec![TestTx::new(addr(10), block_num, program)])
        })
        .collect();
    let chain = TestChain::build(specs);
    let last_covered = chain.last_block() - 1;

    let recon_db = chain.setup_db();
    let aggregator = TestAggregator::with_history(&chain, 1, last_covered);
    let result = reconstitute_state(
        &ExecConfig::default(),
        &recon_db,
        &chain.block_reader(),
        &chain.vm_factory(),
        &aggregator,
        &CancelToken::new(),
    );
    assert_matches!(result, Err(StageError::Execution { block: 2, .. }));
}
