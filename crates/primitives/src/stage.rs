use std::fmt;

/// Unique identifier of a sync stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageId(pub &'static str);

/// The transaction execution stage.
pub const EXECUTION: StageId = StageId("Execution");

impl StageId {
    /// The stage id as a string, used as the persistence key.
    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Progress of a stage: the block it has reached and the transaction number
/// it has reached. Advanced monotonically; rewound only by the unwinder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCheckpoint {
    /// Highest fully processed block.
    pub block_number: u64,
    /// Highest applied transaction number.
    pub tx_number: u64,
}

impl StageCheckpoint {
    /// Create a checkpoint at the given block and transaction number.
    pub const fn new(block_number: u64, tx_number: u64) -> Self {
        Self { block_number, tx_number }
    }

    /// Encode as 16 big-endian bytes.
    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.block_number.to_be_bytes());
        out[8..].copy_from_slice(&self.tx_number.to_be_bytes());
        out
    }

    /// Decode from the 16-byte form. Returns `None` for malformed input.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != 16 {
            return None;
        }
        let block_number = u64::from_be_bytes(buf[..8].try_into().ok()?);
        let tx_number = u64::from_be_bytes(buf[8..].try_into().ok()?);
        Some(Self { block_number, tx_number })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_roundtrip() {
        let checkpoint = StageCheckpoint::new(1234, 567_890);
        assert_eq!(StageCheckpoint::decode(&checkpoint.encode()), Some(checkpoint));
        assert_eq!(StageCheckpoint::decode(&[0u8; 3]), None);
    }
}
