//! Consumed chain interfaces.
//!
//! The block chain and the transaction codec are external collaborators;
//! the nonce cache only needs block heights, per-block transaction bytes,
//! and the (sender, random id) pair each transaction decodes to.

use alloy_primitives::{Address, B256, U256};
use bytes::Bytes;

/// Errors from chain reads or transaction decoding.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("chain read failed: {0}")]
    Chain(String),

    #[error("transaction decode failed: {0}")]
    Decode(String),

    /// The (account, random id) pair was already seen inside the window.
    #[error("duplicate transaction")]
    NonceConflict,
}

/// Read access to the committed chain.
pub trait ChainReader: Send + Sync {
    /// Current chain height.
    fn number(&self) -> Result<u64, LedgerError>;

    /// Hash of the block at `height`.
    fn number_hash(&self, height: u64) -> Result<B256, LedgerError>;

    /// Raw encoded transactions of the block with the given hash.
    fn transactions(&self, block_hash: B256) -> Result<Vec<Bytes>, LedgerError>;
}

/// Decodes the fields the replay guard fingerprints a transaction by.
pub trait TxKeyCodec: Send + Sync {
    fn decode(&self, raw: &[u8]) -> Result<TxFingerprint, LedgerError>;
}

/// The replay-relevant identity of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxFingerprint {
    /// Sending account.
    pub sender: Address,
    /// Per-account transaction sequence counter.
    pub random_id: U256,
}

impl TxFingerprint {
    pub fn new(sender: Address, random_id: U256) -> Self {
        Self { sender, random_id }
    }

    /// Cache key: `hex(sender) + "_" + decimal(random_id)`.
    pub fn key(&self) -> String {
        format!("{}_{}", hex::encode(self.sender), self.random_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_hex_sender_underscore_decimal_id() {
        let tx = TxFingerprint::new(Address::repeat_byte(0xab), U256::from(42u64));
        assert_eq!(
            tx.key(),
            format!("{}_{}", "ab".repeat(20), 42)
        );
    }

    #[test]
    fn distinct_random_ids_give_distinct_keys() {
        let sender = Address::repeat_byte(1);
        let a = TxFingerprint::new(sender, U256::from(1u64));
        let b = TxFingerprint::new(sender, U256::from(2u64));
        assert_ne!(a.key(), b.key());
    }
}
