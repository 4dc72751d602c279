//! Standard 80-byte block header.

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(header)
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_u32_le()?;
        let prev_block = decoder.read_hash()?;
        let merkle_root = decoder.read_hash()?;
        let time = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let nonce = decoder.read_u32_le()?;
        Ok(Self {
            version,
            prev_block,
            merkle_root,
            time,
            bits,
            nonce,
        })
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_80_bytes() {
        let header = BlockHeader {
            version: 4,
            prev_block: [1u8; 32],
            merkle_root: [2u8; 32],
            time: 1_700_000_000,
            bits: 0x1d00_ffff,
            nonce: 42,
        };
        let bytes = header.consensus_encode();
        assert_eq!(bytes.len(), 80);
        assert_eq!(BlockHeader::consensus_decode(&bytes).expect("decode"), header);
    }

    #[test]
    fn hash_changes_with_any_field() {
        let header = BlockHeader {
            version: 4,
            prev_block: [1u8; 32],
            merkle_root: [2u8; 32],
            time: 3,
            bits: 4,
            nonce: 5,
        };
        let mut other = header;
        other.nonce = 6;
        assert_ne!(header.hash(), other.hash());
    }
}
