use crate::DatabaseError;

/// A transactional key-value store.
///
/// Read-only transactions see a consistent snapshot taken at `tx()` time and
/// are unaffected by later commits; at most one read-write transaction is
/// live at a time.
pub trait Database: Send + Sync {
    /// Begin a read-only transaction.
    fn tx(&self) -> Result<Box<dyn DbTx>, DatabaseError>;

    /// Begin a read-write transaction. Blocks while another read-write
    /// transaction is live.
    fn tx_mut(&self) -> Result<Box<dyn DbTxMut>, DatabaseError>;
}

/// A read-only transaction.
pub trait DbTx: Send + Sync {
    /// Get the value stored under `key` in `table`.
    fn get(&self, table: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError>;

    /// Walk all entries of `table` whose key starts with `prefix`, in key
    /// order. The callback returning an error aborts the walk.
    fn for_each(
        &self,
        table: &'static str,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), DatabaseError>,
    ) -> Result<(), DatabaseError>;

    /// Number of entries in `table`.
    fn entries(&self, table: &'static str) -> Result<usize, DatabaseError>;

    /// Export store statistics to the metrics registry. Default is a no-op.
    fn collect_metrics(&self) {}

    /// Hint that `table` is about to be scanned front to back, so the
    /// backend can prefetch pages. Default is a no-op.
    fn read_ahead(&self, table: &'static str) {
        let _ = table;
    }
}

/// A read-write transaction. Writes are buffered and become visible to new
/// read transactions only after [`commit`](DbTxMut::commit).
pub trait DbTxMut: DbTx {
    /// Store `value` under `key` in `table`, replacing any existing value.
    fn put(&mut self, table: &'static str, key: &[u8], value: &[u8])
        -> Result<(), DatabaseError>;

    /// Delete the entry under `key` in `table`. Returns whether an entry was
    /// visible to this transaction.
    fn delete(&mut self, table: &'static str, key: &[u8]) -> Result<bool, DatabaseError>;

    /// Remove every entry of `table`.
    fn clear(&mut self, table: &'static str) -> Result<(), DatabaseError>;

    /// Atomically publish all buffered writes.
    fn commit(self: Box<Self>) -> Result<(), DatabaseError>;
}
