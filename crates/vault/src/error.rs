//! The closed error taxonomy of the vault core.

use std::collections::BTreeSet;

use vaultd_keychain::KeyError;
use vaultd_primitives::encoding::DecodeError;
use vaultd_primitives::{to_hex, Hash256};
use vaultd_script::{ScriptError, SighashError, SignError};
use vaultd_storage::StoreError;

#[derive(Debug)]
pub enum VaultError {
    KeychainNotFound(String),
    KeychainAlreadyExists(String),
    KeychainIsNotPrivate(String),
    KeychainChainCodeUnlockFailed(String),
    KeychainPrivateKeyUnlockFailed(String),
    KeychainInvalidPrivateKey(String),
    AccountNotFound(String),
    AccountAlreadyExists(String),
    AccountChainCodeLocked {
        account: String,
        locked: BTreeSet<String>,
    },
    AccountBinNotFound {
        account: String,
        bin: String,
    },
    AccountBinAlreadyExists {
        account: String,
        bin: String,
    },
    AccountBinOutOfScripts {
        account: String,
        bin: String,
    },
    AccountCannotIssueChangeScript(String),
    AccountInsufficientFunds(String),
    AccountBinInvalidName(String),
    TxNotFound(Hash256),
    BlobInvalid(&'static str),
    InvariantViolation(String),
    Store(StoreError),
    Decode(DecodeError),
    Script(ScriptError),
    Sighash(SighashError),
    Sign(SignError),
    Key(KeyError),
    Io(std::io::Error),
}

impl std::fmt::Display for VaultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VaultError::KeychainNotFound(name) => write!(f, "keychain not found: {name}"),
            VaultError::KeychainAlreadyExists(name) => {
                write!(f, "keychain already exists: {name}")
            }
            VaultError::KeychainIsNotPrivate(name) => {
                write!(f, "keychain has no private key: {name}")
            }
            VaultError::KeychainChainCodeUnlockFailed(name) => {
                write!(f, "chain code unlock failed for keychain {name}")
            }
            VaultError::KeychainPrivateKeyUnlockFailed(name) => {
                write!(f, "private key unlock failed for keychain {name}")
            }
            VaultError::KeychainInvalidPrivateKey(name) => {
                write!(f, "recovered private key does not match keychain {name}")
            }
            VaultError::AccountNotFound(name) => write!(f, "account not found: {name}"),
            VaultError::AccountAlreadyExists(name) => write!(f, "account already exists: {name}"),
            VaultError::AccountChainCodeLocked { account, locked } => {
                write!(f, "account {account} has locked chain codes:")?;
                for name in locked {
                    write!(f, " {name}")?;
                }
                Ok(())
            }
            VaultError::AccountBinNotFound { account, bin } => {
                write!(f, "account bin not found: {account}::{bin}")
            }
            VaultError::AccountBinAlreadyExists { account, bin } => {
                write!(f, "account bin already exists: {account}::{bin}")
            }
            VaultError::AccountBinOutOfScripts { account, bin } => {
                write!(f, "account bin out of scripts: {account}::{bin}")
            }
            VaultError::AccountCannotIssueChangeScript(account) => {
                write!(f, "account {account} cannot issue change scripts directly")
            }
            VaultError::AccountInsufficientFunds(account) => {
                write!(f, "account has insufficient funds: {account}")
            }
            VaultError::AccountBinInvalidName(name) => {
                write!(f, "invalid account bin name: {name}")
            }
            VaultError::TxNotFound(hash) => write!(f, "transaction not found: {}", to_hex(hash)),
            VaultError::BlobInvalid(message) => write!(f, "invalid archive: {message}"),
            VaultError::InvariantViolation(message) => write!(f, "{message}"),
            VaultError::Store(err) => write!(f, "{err}"),
            VaultError::Decode(err) => write!(f, "{err}"),
            VaultError::Script(err) => write!(f, "{err}"),
            VaultError::Sighash(err) => write!(f, "{err}"),
            VaultError::Sign(err) => write!(f, "{err}"),
            VaultError::Key(err) => write!(f, "{err}"),
            VaultError::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for VaultError {}

impl From<StoreError> for VaultError {
    fn from(err: StoreError) -> Self {
        VaultError::Store(err)
    }
}

impl From<DecodeError> for VaultError {
    fn from(err: DecodeError) -> Self {
        VaultError::Decode(err)
    }
}

impl From<ScriptError> for VaultError {
    fn from(err: ScriptError) -> Self {
        VaultError::Script(err)
    }
}

impl From<SighashError> for VaultError {
    fn from(err: SighashError) -> Self {
        VaultError::Sighash(err)
    }
}

impl From<SignError> for VaultError {
    fn from(err: SignError) -> Self {
        VaultError::Sign(err)
    }
}

impl From<KeyError> for VaultError {
    fn from(err: KeyError) -> Self {
        VaultError::Key(err)
    }
}

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        VaultError::Io(err)
    }
}
