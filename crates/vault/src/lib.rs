//! Persistent core of a multisignature deterministic wallet.
//!
//! The vault is the authoritative, transactional store for keychains,
//! accounts and their address pools, wallet transactions, and the
//! best-known fragment of the block header chain. External events (new
//! transaction, new merkle block, new signature) enter through the
//! [`Vault`] façade, which serializes every operation behind one global
//! mutex and one atomic store transaction.

mod accounts;
mod blob;
mod chain;
mod error;
mod keychains;
mod model;
mod queries;
mod session;
mod txn;
mod txs;
mod vault;

pub use error::VaultError;
pub use model::{
    ScriptStatus, TxOutStatus, TxStatus, ALL_WILDCARD, BLOCK_INDEX_UNKNOWN, CHANGE_BIN_NAME,
    DEFAULT_BIN_NAME, TIME_HORIZON_WINDOW,
};
pub use queries::{AccountInfo, KeychainInfo, SigningScriptEntry, TxInfo, TxOutEntry};
pub use txs::{Recipient, SigningRequest};
pub use vault::Vault;

pub use vaultd_keychain::Secret;
