//! Declaration of all database tables.
//!
//! Keys and values are raw bytes; the models in [`crate::models`] and the
//! state-key encoding in `sorrel-primitives` define their layout.

/// Latest account and storage entries, keyed by the state-key encoding.
pub const PLAIN_STATE: &str = "PlainState";
/// Latest contract code, keyed by the state-key encoding.
pub const CODE: &str = "Code";
/// Contract code hashes, keyed by the state-key encoding.
pub const PLAIN_CONTRACT_CODE: &str = "PlainContractCode";

/// Reconstitution scratch: replayed account/storage writes, keyed
/// `[tx_num(8) | state key]`.
pub const PLAIN_STATE_R: &str = "PlainStateR";
/// Reconstitution scratch: account/storage tombstones, keyed like
/// [`PLAIN_STATE_R`].
pub const PLAIN_STATE_D: &str = "PlainStateD";
/// Reconstitution scratch: replayed code writes.
pub const CODE_R: &str = "CodeR";
/// Reconstitution scratch: code tombstones.
pub const CODE_D: &str = "CodeD";
/// Reconstitution scratch: replayed code-hash writes.
pub const PLAIN_CONTRACT_R: &str = "PlainContractR";
/// Reconstitution scratch: code-hash tombstones.
pub const PLAIN_CONTRACT_D: &str = "PlainContractD";

/// Stage checkpoints, keyed by stage name.
pub const SYNC_STAGE: &str = "SyncStage";
/// Per-block first transaction number and task count, keyed by block number.
pub const BLOCK_BODY_INDICES: &str = "BlockBodyIndices";

/// All tables of the main store.
pub const ALL: [&str; 11] = [
    PLAIN_STATE,
    CODE,
    PLAIN_CONTRACT_CODE,
    PLAIN_STATE_R,
    PLAIN_STATE_D,
    CODE_R,
    CODE_D,
    PLAIN_CONTRACT_R,
    PLAIN_CONTRACT_D,
    SYNC_STAGE,
    BLOCK_BODY_INDICES,
];

/// Tables of the reconstitution scratch store.
pub const RECON: [&str; 6] = [
    PLAIN_STATE_R,
    PLAIN_STATE_D,
    CODE_R,
    CODE_D,
    PLAIN_CONTRACT_R,
    PLAIN_CONTRACT_D,
];
