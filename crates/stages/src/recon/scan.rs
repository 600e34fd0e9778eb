use bitvec::prelude::BitVec;
use sorrel_interfaces::AggregatorStep;
use sorrel_primitives::TxNumber;

/// Builds the replay set of one reconstitution step: the bitmap of
/// transaction numbers that touch any account, storage slot or code entry.
/// Anything outside the bitmap need not be executed.
pub(crate) struct ScanWorker<'a> {
    step: &'a dyn AggregatorStep,
    start_tx_num: TxNumber,
    bits: BitVec,
}

impl<'a> ScanWorker<'a> {
    pub(crate) fn new(step: &'a dyn AggregatorStep) -> Self {
        let (start_tx_num, end_tx_num) = step.tx_num_range();
        let bits = BitVec::repeat(false, (end_tx_num - start_tx_num) as usize);
        Self { step, start_tx_num, bits }
    }

    pub(crate) fn bitmap_accounts(&mut self) {
        let start = self.start_tx_num;
        let bits = &mut self.bits;
        self.step.touched_accounts(&mut |tx_num| mark(bits, start, tx_num));
    }

    pub(crate) fn bitmap_storage(&mut self) {
        let start = self.start_tx_num;
        let bits = &mut self.bits;
        self.step.touched_storage(&mut |tx_num| mark(bits, start, tx_num));
    }

    pub(crate) fn bitmap_code(&mut self) {
        let start = self.start_tx_num;
        let bits = &mut self.bits;
        self.step.touched_code(&mut |tx_num| mark(bits, start, tx_num));
    }

    /// Whether `tx_num` is in the replay set.
    pub(crate) fn contains(&self, tx_num: TxNumber) -> bool {
        tx_num
            .checked_sub(self.start_tx_num)
            .and_then(|offset| self.bits.get(offset as usize).map(|bit| *bit))
            .unwrap_or(false)
    }

    /// Number of transaction numbers in the replay set.
    pub(crate) fn cardinality(&self) -> usize {
        self.bits.count_ones()
    }
}

fn mark(bits: &mut BitVec, start: TxNumber, tx_num: TxNumber) {
    if let Some(offset) = tx_num.checked_sub(start) {
        if (offset as usize) < bits.len() {
            bits.set(offset as usize, true);
        }
    }
}
