//! Account, bin, and signing-script rows.

use vaultd_primitives::encoding::{DecodeError, Decoder, Encoder};
use vaultd_primitives::hash::sha256d;
use vaultd_primitives::Hash256;

use super::ScriptStatus;

/// Reserved bin names. Names beginning with `@` cannot be created by
/// callers; `@all` is the query wildcard and never a stored name.
pub const CHANGE_BIN_NAME: &str = "@change";
pub const DEFAULT_BIN_NAME: &str = "@default";
pub const ALL_WILDCARD: &str = "@all";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountRecord {
    pub hash: Hash256,
    pub name: String,
    pub min_sigs: u32,
    /// Sorted; the hash and every derived script depend on this order.
    pub keychain_hashes: Vec<Hash256>,
    pub unused_pool_size: u32,
    pub time_created: u32,
    pub bin_count: u32,
}

impl AccountRecord {
    pub fn content_hash(min_sigs: u32, sorted_keychain_hashes: &[Hash256]) -> Hash256 {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(min_sigs);
        encoder.write_varint(sorted_keychain_hashes.len() as u64);
        for hash in sorted_keychain_hashes {
            encoder.write_hash(hash);
        }
        sha256d(&encoder.into_inner())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub(crate) fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.hash);
        encoder.write_var_str(&self.name);
        encoder.write_u32_le(self.min_sigs);
        encoder.write_varint(self.keychain_hashes.len() as u64);
        for hash in &self.keychain_hashes {
            encoder.write_hash(hash);
        }
        encoder.write_u32_le(self.unused_pool_size);
        encoder.write_u32_le(self.time_created);
        encoder.write_u32_le(self.bin_count);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let record = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(record)
    }

    pub(crate) fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let hash = decoder.read_hash()?;
        let name = decoder.read_var_str()?;
        let min_sigs = decoder.read_u32_le()?;
        let count = decoder.read_varint()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut keychain_hashes = Vec::with_capacity(count);
        for _ in 0..count {
            keychain_hashes.push(decoder.read_hash()?);
        }
        let unused_pool_size = decoder.read_u32_le()?;
        let time_created = decoder.read_u32_le()?;
        let bin_count = decoder.read_u32_le()?;
        Ok(Self {
            hash,
            name,
            min_sigs,
            keychain_hashes,
            unused_pool_size,
            time_created,
            bin_count,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BinRecord {
    pub account: Hash256,
    pub name: String,
    /// Derivation index of this bin under each account keychain.
    pub bin_index: u32,
    pub next_script_index: u32,
}

impl BinRecord {
    pub fn is_change(&self) -> bool {
        self.name == CHANGE_BIN_NAME
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub(crate) fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.account);
        encoder.write_var_str(&self.name);
        encoder.write_u32_le(self.bin_index);
        encoder.write_u32_le(self.next_script_index);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let record = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(record)
    }

    pub(crate) fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let account = decoder.read_hash()?;
        let name = decoder.read_var_str()?;
        let bin_index = decoder.read_u32_le()?;
        let next_script_index = decoder.read_u32_le()?;
        Ok(Self {
            account,
            name,
            bin_index,
            next_script_index,
        })
    }
}

/// One derived child key inside a signing script, with its root keychain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptKeyRef {
    pub pubkey: Vec<u8>,
    pub keychain: Hash256,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningScriptRecord {
    pub account: Hash256,
    pub bin_name: String,
    pub index: u32,
    pub status: ScriptStatus,
    pub label: String,
    /// EDIT-form input script template (placeholders only).
    pub txin_script: Vec<u8>,
    pub txout_script: Vec<u8>,
    pub keys: Vec<ScriptKeyRef>,
}

impl SigningScriptRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_hash(&self.account);
        encoder.write_var_str(&self.bin_name);
        encoder.write_u32_le(self.index);
        encoder.write_u8(self.status as u8);
        encoder.write_var_str(&self.label);
        encoder.write_var_bytes(&self.txin_script);
        encoder.write_var_bytes(&self.txout_script);
        encoder.write_varint(self.keys.len() as u64);
        for key in &self.keys {
            encoder.write_var_bytes(&key.pubkey);
            encoder.write_hash(&key.keychain);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let account = decoder.read_hash()?;
        let bin_name = decoder.read_var_str()?;
        let index = decoder.read_u32_le()?;
        let status = ScriptStatus::from_u8(decoder.read_u8()?)?;
        let label = decoder.read_var_str()?;
        let txin_script = decoder.read_var_bytes()?;
        let txout_script = decoder.read_var_bytes()?;
        let count = decoder.read_varint()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            let pubkey = decoder.read_var_bytes()?;
            let keychain = decoder.read_hash()?;
            keys.push(ScriptKeyRef { pubkey, keychain });
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            account,
            bin_name,
            index,
            status,
            label,
            txin_script,
            txout_script,
            keys,
        })
    }
}

/// Derivation coordinates of one pool key, resolvable back to its root
/// keychain at signing time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyLocator {
    pub keychain: Hash256,
    pub bin_index: u32,
    pub script_index: u32,
}

impl KeyLocator {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_hash(&self.keychain);
        encoder.write_u32_le(self.bin_index);
        encoder.write_u32_le(self.script_index);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let keychain = decoder.read_hash()?;
        let bin_index = decoder.read_u32_le()?;
        let script_index = decoder.read_u32_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            keychain,
            bin_index,
            script_index,
        })
    }
}

/// `account ‖ len(name) ‖ name`. The length byte keeps one bin name from
/// being a key prefix of another; bin names are limited to 255 bytes.
pub fn bin_key(account: &Hash256, bin_name: &str) -> Vec<u8> {
    let name = bin_name.as_bytes();
    let mut key = Vec::with_capacity(33 + name.len());
    key.extend_from_slice(account);
    key.push(name.len() as u8);
    key.extend_from_slice(name);
    key
}

/// `bin_key ‖ index BE`, so a prefix scan of a bin yields index order.
pub fn script_key(account: &Hash256, bin_name: &str, index: u32) -> Vec<u8> {
    let mut key = bin_key(account, bin_name);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

pub fn script_prefix(account: &Hash256, bin_name: &str) -> Vec<u8> {
    bin_key(account, bin_name)
}

/// Splits a `script_key` back into its coordinates.
pub fn parse_script_key(key: &[u8]) -> Result<(Hash256, String, u32), DecodeError> {
    if key.len() < 37 {
        return Err(DecodeError::InvalidData("script key too short"));
    }
    let account: Hash256 = key[0..32]
        .try_into()
        .expect("script key account slice length");
    let name_len = key[32] as usize;
    if key.len() != 33 + name_len + 4 {
        return Err(DecodeError::InvalidData("script key length mismatch"));
    }
    let name = std::str::from_utf8(&key[33..33 + name_len])
        .map_err(|_| DecodeError::InvalidData("script key bin name not utf8"))?
        .to_string();
    let index = u32::from_be_bytes(
        key[33 + name_len..]
            .try_into()
            .expect("script key index slice length"),
    );
    Ok((account, name, index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_key_roundtrip() {
        let account = [0xabu8; 32];
        let key = script_key(&account, "@change", 42);
        let (parsed_account, parsed_name, parsed_index) =
            parse_script_key(&key).expect("parse");
        assert_eq!(parsed_account, account);
        assert_eq!(parsed_name, "@change");
        assert_eq!(parsed_index, 42);
    }

    #[test]
    fn bin_keys_do_not_prefix_collide() {
        let account = [1u8; 32];
        let short = script_prefix(&account, "bin");
        let long = script_prefix(&account, "bin2");
        assert!(!long.starts_with(&short));
    }

    #[test]
    fn script_keys_sort_by_index() {
        let account = [2u8; 32];
        let a = script_key(&account, "b", 1);
        let b = script_key(&account, "b", 2);
        let c = script_key(&account, "b", 300);
        assert!(a < b && b < c);
    }

    #[test]
    fn account_codec_roundtrip() {
        let hashes = vec![[3u8; 32], [4u8; 32]];
        let record = AccountRecord {
            hash: AccountRecord::content_hash(2, &hashes),
            name: "savings".to_string(),
            min_sigs: 2,
            keychain_hashes: hashes,
            unused_pool_size: 25,
            time_created: 1_234_567,
            bin_count: 2,
        };
        assert_eq!(
            AccountRecord::decode(&record.encode()).expect("decode"),
            record
        );
    }

    #[test]
    fn signing_script_codec_roundtrip() {
        let record = SigningScriptRecord {
            account: [5u8; 32],
            bin_name: DEFAULT_BIN_NAME.to_string(),
            index: 7,
            status: ScriptStatus::Issued,
            label: "rent".to_string(),
            txin_script: vec![0x00, 0x00, 0x4c],
            txout_script: vec![0xa9, 0x14],
            keys: vec![ScriptKeyRef {
                pubkey: vec![0x02; 33],
                keychain: [6u8; 32],
            }],
        };
        assert_eq!(
            SigningScriptRecord::decode(&record.encode()).expect("decode"),
            record
        );
    }
}
