use sorrel_db::{tables, DatabaseError, DbTx, DbTxMut};

/// Sort-merge collector for the final reconstitution transpose.
///
/// Scratch entries keyed `[tx_num(8) | key]` are re-keyed `[key | tx_num(8)]`
/// so that, sorted, consecutive records of one key fold to the latest write.
/// Tombstones fold to a delete.
#[derive(Debug, Default)]
pub(crate) struct TransposeCollector {
    entries: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl TransposeCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Absorb a value record from a `*R` scratch table.
    pub(crate) fn collect_value(&mut self, scratch_key: &[u8], value: &[u8]) {
        self.entries.push((transpose_key(scratch_key), Some(value.to_vec())));
    }

    /// Absorb a tombstone record from a `*D` scratch table.
    pub(crate) fn collect_tombstone(&mut self, scratch_key: &[u8]) {
        self.entries.push((transpose_key(scratch_key), None));
    }

    /// Fold and write into `table`: for every key, the record with the
    /// highest transaction number wins; a winning tombstone deletes.
    pub(crate) fn load(
        mut self,
        tx: &mut dyn DbTxMut,
        table: &'static str,
    ) -> Result<(), DatabaseError> {
        self.entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let mut current: Option<(Vec<u8>, Option<Vec<u8>>)> = None;
        for (transposed, value) in self.entries {
            let key = &transposed[..transposed.len() - 8];
            match &mut current {
                Some((current_key, current_value)) if current_key.as_slice() == key => {
                    *current_value = value;
                }
                _ => {
                    if let Some(finished) = current.take() {
                        write_entry(tx, table, finished)?;
                    }
                    current = Some((key.to_vec(), value));
                }
            }
        }
        if let Some(finished) = current {
            write_entry(tx, table, finished)?;
        }
        Ok(())
    }
}

fn transpose_key(scratch_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(scratch_key.len());
    out.extend_from_slice(&scratch_key[8..]);
    out.extend_from_slice(&scratch_key[..8]);
    out
}

fn write_entry(
    tx: &mut dyn DbTxMut,
    table: &'static str,
    (key, value): (Vec<u8>, Option<Vec<u8>>),
) -> Result<(), DatabaseError> {
    match value {
        Some(value) => tx.put(table, &key, &value),
        None => tx.delete(table, &key).map(|_| ()),
    }
}

/// Transpose all scratch tables into the main plain-state, code and
/// contract-code tables.
pub(crate) fn transpose_scratch(
    scratch: &dyn DbTx,
    main: &mut dyn DbTxMut,
) -> Result<(), DatabaseError> {
    const MAPPING: [(&str, &str, &str); 3] = [
        (tables::PLAIN_STATE_R, tables::PLAIN_STATE_D, tables::PLAIN_STATE),
        (tables::CODE_R, tables::CODE_D, tables::CODE),
        (tables::PLAIN_CONTRACT_R, tables::PLAIN_CONTRACT_D, tables::PLAIN_CONTRACT_CODE),
    ];
    for (values_table, tombstones_table, destination) in MAPPING {
        let mut collector = TransposeCollector::new();
        scratch.read_ahead(values_table);
        scratch.for_each(values_table, &[], &mut |key, value| {
            collector.collect_value(key, value);
            Ok(())
        })?;
        scratch.read_ahead(tombstones_table);
        scratch.for_each(tombstones_table, &[], &mut |key, _| {
            collector.collect_tombstone(key);
            Ok(())
        })?;
        collector.load(main, destination)?;
    }
    Ok(())
}
