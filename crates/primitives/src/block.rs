use alloy_primitives::{keccak256, Address, Bytes, B256, U256};

/// A block header.
///
/// Only the fields the execution stage actually consumes are modeled; the
/// full consensus header lives with the block reader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    /// Block number.
    pub number: u64,
    /// Hash of the parent block.
    pub parent_hash: B256,
    /// Root of the post-execution state, as declared by the header.
    pub state_root: B256,
    /// Address collecting the block rewards and fees.
    pub beneficiary: Address,
    /// Total gas limit of the block.
    pub gas_limit: u64,
    /// Total gas used by all transactions, as declared by the header.
    pub gas_used: u64,
    /// Block timestamp.
    pub timestamp: u64,
    /// Base fee per gas, if the block is post-London.
    pub base_fee_per_gas: Option<u64>,
}

impl Header {
    /// Compute the hash of the header.
    ///
    /// The hash is computed on demand over a fixed-width field encoding.
    pub fn hash_slow(&self) -> B256 {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&self.number.to_be_bytes());
        buf.extend_from_slice(self.parent_hash.as_slice());
        buf.extend_from_slice(self.state_root.as_slice());
        buf.extend_from_slice(self.beneficiary.as_slice());
        buf.extend_from_slice(&self.gas_limit.to_be_bytes());
        buf.extend_from_slice(&self.gas_used.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.base_fee_per_gas.unwrap_or_default().to_be_bytes());
        keccak256(&buf)
    }
}

/// A signed transaction with its sender attached if it has already been
/// recovered by an upstream stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    /// Transaction hash.
    pub hash: B256,
    /// Sender nonce.
    pub nonce: u64,
    /// Gas limit of the transaction.
    pub gas_limit: u64,
    /// Recipient, `None` for contract creation.
    pub to: Option<Address>,
    /// Transferred value.
    pub value: U256,
    /// Call data.
    pub input: Bytes,
    /// Recovered sender, if the sender-recovery stage has run.
    pub sender: Option<Address>,
}

impl Transaction {
    /// Returns the recovered sender, if present.
    pub const fn sender(&self) -> Option<Address> {
        self.sender
    }
}

/// The decoded message form of a transaction, i.e. the inputs handed to the
/// virtual machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxMessage {
    /// Message sender.
    pub from: Address,
    /// Recipient, `None` for contract creation.
    pub to: Option<Address>,
    /// Sender nonce.
    pub nonce: u64,
    /// Gas limit.
    pub gas_limit: u64,
    /// Transferred value.
    pub value: U256,
    /// Call data.
    pub data: Bytes,
}

/// A validator withdrawal included in a block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Withdrawal {
    /// Monotonically increasing withdrawal index.
    pub index: u64,
    /// Index of the withdrawing validator.
    pub validator_index: u64,
    /// Target address of the withdrawal.
    pub address: Address,
    /// Withdrawn amount in gwei.
    pub amount: u64,
}

/// A block as handed out by the block reader: header, transactions, ommers
/// and withdrawals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    /// Block header.
    pub header: Header,
    /// Transactions in the block.
    pub body: Vec<Transaction>,
    /// Ommer headers.
    pub ommers: Vec<Header>,
    /// Validator withdrawals.
    pub withdrawals: Vec<Withdrawal>,
}

impl Block {
    /// Block number, from the header.
    pub const fn number(&self) -> u64 {
        self.header.number
    }

    /// Hash of the block, computed from the header.
    pub fn hash_slow(&self) -> B256 {
        self.header.hash_slow()
    }
}
