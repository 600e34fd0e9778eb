use alloy_primitives::{Bytes, B256};
use sorrel_primitives::BlockNumber;

/// Rewinds the stage watermark to an earlier block after a failed root
/// check. The actual rewind of persisted state happens outside the
/// execution core.
pub trait Unwinder {
    /// Request an unwind to `block`, blaming `bad_block`.
    fn unwind_to(&mut self, block: BlockNumber, bad_block: B256);
}

/// Sink for bad-header reports, feeding the header downloader.
#[auto_impl::auto_impl(&, Arc)]
pub trait HeaderReporter: Send + Sync {
    /// Report that the block with `hash` (child of `parent`) failed
    /// validation.
    fn report_bad_header(&self, hash: B256, parent: B256);
}

/// Change-stream notifications for downstream consumers, fed only for small
/// head-of-chain ranges.
#[auto_impl::auto_impl(&, Arc)]
pub trait StateStream: Send + Sync {
    /// Announce that state changes for `block` are about to be produced.
    fn start_change(&self, block: BlockNumber, hash: B256, txs: Vec<Bytes>);
}
