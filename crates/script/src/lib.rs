//! Multisignature script construction, signature tracking, and signing
//! digests.

pub mod multisig;
pub mod secp;
pub mod sighash;

pub use multisig::{
    multisig_redeem_script, p2sh_script_pubkey, InputScript, ScriptError, MAX_MULTISIG_KEYS,
};
pub use secp::{pubkey_from_secret, sign_hash, verify_hash, SignError};
pub use sighash::{signature_hash_all, SighashError, SIGHASH_ALL};
