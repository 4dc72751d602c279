//! Hierarchical-deterministic key material and its at-rest encryption.

pub mod extkey;
pub mod seal;
pub mod secret;

pub use extkey::{
    derive_child_privkey, derive_child_pubkey, fingerprint, master_from_entropy, pubkey_for,
    MAX_CHILD_INDEX,
};
pub use seal::SealedSecret;
pub use secret::Secret;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    InvalidEntropy,
    InvalidKey,
    InvalidChildIndex,
    DerivationFailed,
    KdfFailed,
    SealFailed,
    UnsealFailed,
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyError::InvalidEntropy => write!(f, "entropy is too short"),
            KeyError::InvalidKey => write!(f, "invalid key material"),
            KeyError::InvalidChildIndex => write!(f, "hardened child index not supported"),
            KeyError::DerivationFailed => write!(f, "child key derivation failed"),
            KeyError::KdfFailed => write!(f, "key derivation function failed"),
            KeyError::SealFailed => write!(f, "secret encryption failed"),
            KeyError::UnsealFailed => write!(f, "secret decryption failed"),
        }
    }
}

impl std::error::Error for KeyError {}
