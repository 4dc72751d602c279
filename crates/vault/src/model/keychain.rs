//! Keychain rows.

use vaultd_keychain::SealedSecret;
use vaultd_primitives::encoding::{DecodeError, Decoder, Encoder};
use vaultd_primitives::hash::sha256d;
use vaultd_primitives::Hash256;

use super::{read_sealed, write_sealed};

/// An extended key at rest. Public material is cleartext; the chain code
/// and the private key are sealed independently. The content hash covers
/// only the public identity, so it is stable across lock-state changes and
/// private-key upgrades.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeychainRecord {
    pub hash: Hash256,
    pub name: String,
    pub depth: u8,
    pub parent_fingerprint: u32,
    pub child_number: u32,
    pub pubkey: Vec<u8>,
    pub chain_code: SealedSecret,
    pub privkey: Option<SealedSecret>,
    pub parent: Option<Hash256>,
}

impl KeychainRecord {
    pub fn is_private(&self) -> bool {
        self.privkey.is_some()
    }

    pub fn content_hash(
        pubkey: &[u8],
        depth: u8,
        child_number: u32,
        parent_fingerprint: u32,
    ) -> Hash256 {
        let mut encoder = Encoder::new();
        encoder.write_var_bytes(pubkey);
        encoder.write_u8(depth);
        encoder.write_u32_le(child_number);
        encoder.write_u32_le(parent_fingerprint);
        sha256d(&encoder.into_inner())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_hash(&self.hash);
        encoder.write_var_str(&self.name);
        encoder.write_u8(self.depth);
        encoder.write_u32_le(self.parent_fingerprint);
        encoder.write_u32_le(self.child_number);
        encoder.write_var_bytes(&self.pubkey);
        write_sealed(&mut encoder, &self.chain_code);
        match &self.privkey {
            Some(sealed) => {
                encoder.write_bool(true);
                write_sealed(&mut encoder, sealed);
            }
            None => encoder.write_bool(false),
        }
        match &self.parent {
            Some(parent) => {
                encoder.write_bool(true);
                encoder.write_hash(parent);
            }
            None => encoder.write_bool(false),
        }
        encoder.into_inner()
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
        let depth = decoder.read_u8()?;
        let parent_fingerprint = decoder.read_u32_le()?;
        let child_number = decoder.read_u32_le()?;
        let pubkey = decoder.read_var_bytes()?;
        let chain_code = read_sealed(decoder)?;
        let privkey = if decoder.read_bool()? {
            Some(read_sealed(decoder)?)
        } else {
            None
        };
        let parent = if decoder.read_bool()? {
            Some(decoder.read_hash()?)
        } else {
            None
        };
        Ok(Self {
            hash,
            name,
            depth,
            parent_fingerprint,
            child_number,
            pubkey,
            chain_code,
            privkey,
            parent,
        })
    }

    pub(crate) fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.encode());
    }
}
