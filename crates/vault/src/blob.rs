//! Self-contained textual archives for keychains and accounts.
//!
//! An archive is a magic/version line followed by one hex line of
//! consensus-encoded payload. Sealed secrets travel as stored — encrypted;
//! the archive never contains plaintext key material.

use vaultd_primitives::encoding::{Decoder, Encoder};
use vaultd_primitives::{from_hex, to_hex};

use crate::error::VaultError;
use crate::model::{AccountRecord, BinRecord, KeychainRecord};

const KEYCHAIN_MAGIC: &str = "VAULTD KEYCHAIN 1";
const ACCOUNT_MAGIC: &str = "VAULTD ACCOUNT 1";

pub fn encode_keychain_blob(record: &KeychainRecord) -> String {
    format!("{KEYCHAIN_MAGIC}\n{}\n", to_hex(&record.encode()))
}

pub fn decode_keychain_blob(text: &str) -> Result<KeychainRecord, VaultError> {
    let payload = archive_payload(text, KEYCHAIN_MAGIC)?;
    let mut decoder = Decoder::new(&payload);
    let record = KeychainRecord::decode_from(&mut decoder)?;
    if !decoder.is_empty() {
        return Err(VaultError::BlobInvalid("trailing bytes in keychain archive"));
    }
    Ok(record)
}

pub fn encode_account_blob(
    account: &AccountRecord,
    keychains: &[KeychainRecord],
    bins: &[BinRecord],
) -> String {
    let mut encoder = Encoder::new();
    account.encode_into(&mut encoder);
    encoder.write_varint(keychains.len() as u64);
    for keychain in keychains {
        keychain.encode_into(&mut encoder);
    }
    encoder.write_varint(bins.len() as u64);
    for bin in bins {
        bin.encode_into(&mut encoder);
    }
    format!("{ACCOUNT_MAGIC}\n{}\n", to_hex(&encoder.into_inner()))
}

pub fn decode_account_blob(
    text: &str,
) -> Result<(AccountRecord, Vec<KeychainRecord>, Vec<BinRecord>), VaultError> {
    let payload = archive_payload(text, ACCOUNT_MAGIC)?;
    let mut decoder = Decoder::new(&payload);

    let account = AccountRecord::decode_from(&mut decoder)?;

    let keychain_count = decoder.read_varint()?;
    let keychain_count =
        usize::try_from(keychain_count).map_err(|_| VaultError::BlobInvalid("archive too large"))?;
    let mut keychains = Vec::with_capacity(keychain_count);
    for _ in 0..keychain_count {
        keychains.push(KeychainRecord::decode_from(&mut decoder)?);
    }

    let bin_count = decoder.read_varint()?;
    let bin_count =
        usize::try_from(bin_count).map_err(|_| VaultError::BlobInvalid("archive too large"))?;
    let mut bins = Vec::with_capacity(bin_count);
    for _ in 0..bin_count {
        bins.push(BinRecord::decode_from(&mut decoder)?);
    }

    if !decoder.is_empty() {
        return Err(VaultError::BlobInvalid("trailing bytes in account archive"));
    }
    Ok((account, keychains, bins))
}

fn archive_payload(text: &str, magic: &str) -> Result<Vec<u8>, VaultError> {
    let mut lines = text.lines();
    let header = lines
        .next()
        .ok_or(VaultError::BlobInvalid("empty archive"))?;
    if header.trim() != magic {
        return Err(VaultError::BlobInvalid("unrecognized archive header"));
    }
    let payload_line = lines
        .next()
        .ok_or(VaultError::BlobInvalid("archive payload missing"))?;
    from_hex(payload_line.trim()).ok_or(VaultError::BlobInvalid("archive payload is not hex"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultd_keychain::SealedSecret;

    fn sample_keychain(name: &str) -> KeychainRecord {
        let pubkey = vec![0x03; 33];
        KeychainRecord {
            hash: KeychainRecord::content_hash(&pubkey, 0, 0, 0),
            name: name.to_string(),
            depth: 0,
            parent_fingerprint: 0,
            child_number: 0,
            pubkey,
            chain_code: SealedSecret {
                salt: vec![1u8; 16],
                nonce: [2u8; 12],
                lock_key_digest: Some([3u8; 32]),
                ciphertext: vec![4u8; 48],
            },
            privkey: None,
            parent: None,
        }
    }

    #[test]
    fn keychain_blob_roundtrip() {
        let record = sample_keychain("vacation");
        let text = encode_keychain_blob(&record);
        assert!(text.starts_with(KEYCHAIN_MAGIC));
        assert_eq!(decode_keychain_blob(&text).expect("decode"), record);
    }

    #[test]
    fn account_blob_roundtrip() {
        let keychain = sample_keychain("member");
        let account = AccountRecord {
            hash: AccountRecord::content_hash(1, &[keychain.hash]),
            name: "joint".to_string(),
            min_sigs: 1,
            keychain_hashes: vec![keychain.hash],
            unused_pool_size: 10,
            time_created: 99,
            bin_count: 2,
        };
        let bins = vec![
            BinRecord {
                account: account.hash,
                name: "@change".to_string(),
                bin_index: 0,
                next_script_index: 3,
            },
            BinRecord {
                account: account.hash,
                name: "@default".to_string(),
                bin_index: 1,
                next_script_index: 5,
            },
        ];
        let text = encode_account_blob(&account, &[keychain.clone()], &bins);
        let (decoded_account, decoded_keychains, decoded_bins) =
            decode_account_blob(&text).expect("decode");
        assert_eq!(decoded_account, account);
        assert_eq!(decoded_keychains, vec![keychain]);
        assert_eq!(decoded_bins, bins);
    }

    #[test]
    fn wrong_magic_rejected() {
        let record = sample_keychain("x");
        let text = encode_keychain_blob(&record);
        assert!(matches!(
            decode_account_blob(&text),
            Err(VaultError::BlobInvalid(_))
        ));
    }
}
