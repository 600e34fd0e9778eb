use crate::{tables, Database, DatabaseError, DbTx, DbTxMut};
use parking_lot::{ArcMutexGuard, Mutex, RawMutex, RwLock};
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

type Table = BTreeMap<Vec<u8>, Vec<u8>>;
type Snapshot = BTreeMap<&'static str, Table>;

/// In-memory snapshot-isolated store.
///
/// Read transactions hold an `Arc` of the snapshot current at begin time,
/// so they keep seeing it unchanged across later commits, the same rotation
/// discipline the workers rely on with an MVCC store. A single writer is
/// enforced with a lock held for the lifetime of the read-write
/// transaction.
///
/// Used by the test-suite and as the reconstitution scratch store.
#[derive(Clone)]
pub struct MemDb {
    inner: Arc<Inner>,
}

struct Inner {
    committed: RwLock<Arc<Snapshot>>,
    writer: Arc<Mutex<()>>,
}

impl std::fmt::Debug for MemDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDb").finish_non_exhaustive()
    }
}

impl MemDb {
    /// Open a store with all main tables declared.
    pub fn new() -> Self {
        Self::open(&tables::ALL)
    }

    /// Open a store declaring only the given tables. Access to any other
    /// table errors with [`DatabaseError::TableNotFound`].
    pub fn open(table_names: &[&'static str]) -> Self {
        let snapshot: Snapshot = table_names.iter().map(|name| (*name, Table::new())).collect();
        Self {
            inner: Arc::new(Inner {
                committed: RwLock::new(Arc::new(snapshot)),
                writer: Arc::new(Mutex::new(())),
            }),
        }
    }
}

impl Default for MemDb {
    fn default() -> Self {
        Self::new()
    }
}

impl Database for MemDb {
    fn tx(&self) -> Result<Box<dyn DbTx>, DatabaseError> {
        Ok(Box::new(MemTx { snapshot: self.inner.committed.read().clone() }))
    }

    fn tx_mut(&self) -> Result<Box<dyn DbTxMut>, DatabaseError> {
        // Acquire the writer lock before snapshotting so the base always is
        // the latest committed state.
        let guard = self.inner.writer.lock_arc();
        let snapshot = self.inner.committed.read().clone();
        Ok(Box::new(MemTxMut {
            db: Arc::clone(&self.inner),
            snapshot,
            dirty: BTreeMap::new(),
            cleared: HashSet::new(),
            _guard: guard,
        }))
    }
}

fn table<'a>(snapshot: &'a Snapshot, name: &'static str) -> Result<&'a Table, DatabaseError> {
    snapshot.get(name).ok_or(DatabaseError::TableNotFound(name))
}

fn walk_prefix(
    table: &Table,
    prefix: &[u8],
    f: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), DatabaseError>,
) -> Result<(), DatabaseError> {
    for (key, value) in table.range(prefix.to_vec()..) {
        if !key.starts_with(prefix) {
            break;
        }
        f(key, value)?;
    }
    Ok(())
}

struct MemTx {
    snapshot: Arc<Snapshot>,
}

impl DbTx for MemTx {
    fn get(&self, name: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        Ok(table(&self.snapshot, name)?.get(key).cloned())
    }

    fn for_each(
        &self,
        name: &'static str,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), DatabaseError>,
    ) -> Result<(), DatabaseError> {
        walk_prefix(table(&self.snapshot, name)?, prefix, f)
    }

    fn entries(&self, name: &'static str) -> Result<usize, DatabaseError> {
        Ok(table(&self.snapshot, name)?.len())
    }

    fn collect_metrics(&self) {
        for (name, table) in self.snapshot.iter() {
            metrics::gauge!("db.table_entries", "table" => *name).set(table.len() as f64);
        }
    }
}

struct MemTxMut {
    db: Arc<Inner>,
    snapshot: Arc<Snapshot>,
    /// Buffered writes; `None` is a pending delete.
    dirty: BTreeMap<&'static str, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    /// Tables wiped by `clear` in this transaction.
    cleared: HashSet<&'static str>,
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl DbTx for MemTxMut {
    fn get(&self, name: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        let base = table(&self.snapshot, name)?;
        if let Some(pending) = self.dirty.get(name).and_then(|t| t.get(key)) {
            return Ok(pending.clone());
        }
        if self.cleared.contains(name) {
            return Ok(None);
        }
        Ok(base.get(key).cloned())
    }

    fn for_each(
        &self,
        name: &'static str,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), DatabaseError>,
    ) -> Result<(), DatabaseError> {
        let base = table(&self.snapshot, name)?;
        let empty = BTreeMap::new();
        let overlay = self.dirty.get(name).unwrap_or(&empty);

        let mut base_iter = base
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|_| !self.cleared.contains(name))
            .peekable();
        let mut overlay_iter = overlay
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .peekable();

        // Sorted merge; overlay entries shadow base entries.
        loop {
            let order = match (base_iter.peek(), overlay_iter.peek()) {
                (None, None) => break,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (Some(_), None) => std::cmp::Ordering::Less,
                (Some((base_key, _)), Some((overlay_key, _))) => base_key.cmp(overlay_key),
            };
            match order {
                std::cmp::Ordering::Less => {
                    let (key, value) = base_iter.next().expect("peeked");
                    f(key, value)?;
                }
                std::cmp::Ordering::Equal => {
                    base_iter.next();
                    let (key, value) = overlay_iter.next().expect("peeked");
                    if let Some(value) = value {
                        f(key, value)?;
                    }
                }
                std::cmp::Ordering::Greater => {
                    let (key, value) = overlay_iter.next().expect("peeked");
                    if let Some(value) = value {
                        f(key, value)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn entries(&self, name: &'static str) -> Result<usize, DatabaseError> {
        let mut count = 0;
        self.for_each(name, &[], &mut |_, _| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }

    fn collect_metrics(&self) {
        for (name, table) in self.snapshot.iter() {
            metrics::gauge!("db.table_entries", "table" => *name).set(table.len() as f64);
        }
    }
}

impl DbTxMut for MemTxMut {
    fn put(
        &mut self,
        name: &'static str,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), DatabaseError> {
        table(&self.snapshot, name)?;
        self.dirty.entry(name).or_default().insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, name: &'static str, key: &[u8]) -> Result<bool, DatabaseError> {
        let existed = self.get(name, key)?.is_some();
        self.dirty.entry(name).or_default().insert(key.to_vec(), None);
        Ok(existed)
    }

    fn clear(&mut self, name: &'static str) -> Result<(), DatabaseError> {
        table(&self.snapshot, name)?;
        self.dirty.remove(name);
        self.cleared.insert(name);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        let mut next = (*self.snapshot).clone();
        for name in &self.cleared {
            if let Some(table) = next.get_mut(name) {
                table.clear();
            }
        }
        for (name, writes) in self.dirty {
            let table = next.get_mut(name).ok_or(DatabaseError::TableNotFound(name))?;
            for (key, value) in writes {
                match value {
                    Some(value) => {
                        table.insert(key, value);
                    }
                    None => {
                        table.remove(&key);
                    }
                }
            }
        }
        *self.db.committed.write() = Arc::new(next);
        Ok(())
    }
}
