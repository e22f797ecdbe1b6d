//! mesh-ledger — chain-facing interfaces and the transaction-replay guard.

pub mod chain;
pub mod nonce;

pub use chain::{ChainReader, LedgerError, TxFingerprint, TxKeyCodec};
pub use nonce::NonceCache;
