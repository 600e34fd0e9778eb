use sorrel_db::{tables, DatabaseError, DbTx, DbTxMut};
use sorrel_primitives::{StageCheckpoint, StageId};

/// The output of a stage execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOutput {
    /// How far the stage got.
    pub checkpoint: StageCheckpoint,
    /// Whether the stage is done with its whole input range.
    pub done: bool,
}

/// Load the persisted checkpoint of `stage`.
pub fn stage_checkpoint(
    tx: &dyn DbTx,
    stage: StageId,
) -> Result<Option<StageCheckpoint>, DatabaseError> {
    Ok(tx
        .get(tables::SYNC_STAGE, stage.as_str().as_bytes())?
        .as_deref()
        .and_then(StageCheckpoint::decode))
}

/// Persist the checkpoint of `stage`. Only ever advanced here; rewinding is
/// the unwinder's job.
pub fn save_stage_checkpoint(
    tx: &mut dyn DbTxMut,
    stage: StageId,
    checkpoint: StageCheckpoint,
) -> Result<(), DatabaseError> {
    tx.put(tables::SYNC_STAGE, stage.as_str().as_bytes(), &checkpoint.encode())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sorrel_db::{Database, MemDb};
    use sorrel_primitives::EXECUTION;

    #[test]
    fn checkpoint_persistence_roundtrip() {
        let db = MemDb::new();
        let mut tx = db.tx_mut().unwrap();
        assert_eq!(stage_checkpoint(&*tx, EXECUTION).unwrap(), None);

        let checkpoint = StageCheckpoint::new(42, 1000);
        save_stage_checkpoint(&mut *tx, EXECUTION, checkpoint).unwrap();
        tx.commit().unwrap();

        let ro = db.tx().unwrap();
        assert_eq!(stage_checkpoint(&*ro, EXECUTION).unwrap(), Some(checkpoint));
    }
}
