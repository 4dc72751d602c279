//! Persistent row types and their codecs.

pub mod account;
pub mod chain;
pub mod keychain;
pub mod tx;

pub use account::{
    bin_key, parse_script_key, script_key, script_prefix, AccountRecord, BinRecord, KeyLocator,
    ScriptKeyRef, SigningScriptRecord, ALL_WILDCARD, CHANGE_BIN_NAME, DEFAULT_BIN_NAME,
};
pub use chain::{block_tx_key, height_key, HeaderRecord, MerkleBlockRecord, TIME_HORIZON_WINDOW};
pub use keychain::KeychainRecord;
pub use tx::{TxInRecord, TxOutRecord, TxRecord, BLOCK_INDEX_UNKNOWN};

use vaultd_keychain::SealedSecret;
use vaultd_primitives::encoding::{DecodeError, Decoder, Encoder};

/// Transaction status ladder. Reconciliation promotes along `Ord`; the
/// conflict rules of the insertion algorithm handle `Conflicting` and
/// `Confirmed` explicitly.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u8)]
pub enum TxStatus {
    Unsigned = 1,
    Unsent = 2,
    Sent = 3,
    Propagated = 4,
    Confirmed = 5,
    Conflicting = 6,
}

impl TxStatus {
    pub const ALL: [TxStatus; 6] = [
        TxStatus::Unsigned,
        TxStatus::Unsent,
        TxStatus::Sent,
        TxStatus::Propagated,
        TxStatus::Confirmed,
        TxStatus::Conflicting,
    ];

    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            1 => Ok(TxStatus::Unsigned),
            2 => Ok(TxStatus::Unsent),
            3 => Ok(TxStatus::Sent),
            4 => Ok(TxStatus::Propagated),
            5 => Ok(TxStatus::Confirmed),
            6 => Ok(TxStatus::Conflicting),
            _ => Err(DecodeError::InvalidData("unknown tx status")),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TxStatus::Unsigned => "UNSIGNED",
            TxStatus::Unsent => "UNSENT",
            TxStatus::Sent => "SENT",
            TxStatus::Propagated => "PROPAGATED",
            TxStatus::Confirmed => "CONFIRMED",
            TxStatus::Conflicting => "CONFLICTING",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u8)]
pub enum ScriptStatus {
    Unused = 1,
    Change = 2,
    Issued = 3,
    Used = 4,
}

impl ScriptStatus {
    pub const ALL: [ScriptStatus; 4] = [
        ScriptStatus::Unused,
        ScriptStatus::Change,
        ScriptStatus::Issued,
        ScriptStatus::Used,
    ];

    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            1 => Ok(ScriptStatus::Unused),
            2 => Ok(ScriptStatus::Change),
            3 => Ok(ScriptStatus::Issued),
            4 => Ok(ScriptStatus::Used),
            _ => Err(DecodeError::InvalidData("unknown signing script status")),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScriptStatus::Unused => "UNUSED",
            ScriptStatus::Change => "CHANGE",
            ScriptStatus::Issued => "ISSUED",
            ScriptStatus::Used => "USED",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u8)]
pub enum TxOutStatus {
    Unspent = 1,
    Spent = 2,
}

impl TxOutStatus {
    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            1 => Ok(TxOutStatus::Unspent),
            2 => Ok(TxOutStatus::Spent),
            _ => Err(DecodeError::InvalidData("unknown txout status")),
        }
    }
}

pub(crate) fn write_sealed(encoder: &mut Encoder, sealed: &SealedSecret) {
    encoder.write_var_bytes(&sealed.salt);
    encoder.write_bytes(&sealed.nonce);
    match sealed.lock_key_digest {
        Some(digest) => {
            encoder.write_bool(true);
            encoder.write_bytes(&digest);
        }
        None => encoder.write_bool(false),
    }
    encoder.write_var_bytes(&sealed.ciphertext);
}

pub(crate) fn read_sealed(decoder: &mut Decoder) -> Result<SealedSecret, DecodeError> {
    let salt = decoder.read_var_bytes()?;
    let nonce = decoder.read_fixed::<12>()?;
    let lock_key_digest = if decoder.read_bool()? {
        Some(decoder.read_fixed::<32>()?)
    } else {
        None
    };
    let ciphertext = decoder.read_var_bytes()?;
    Ok(SealedSecret {
        salt,
        nonce,
        lock_key_digest,
        ciphertext,
    })
}
