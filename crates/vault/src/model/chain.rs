//! Block header and merkle block rows.

use vaultd_primitives::encoding::{Decodable, DecodeError, Decoder, Encoder};
use vaultd_primitives::{BlockHeader, Hash256, MerkleBlock, PartialMerkleTree};

/// Blocks whose predecessor is unknown are refused when they are newer than
/// the sync horizon minus this window (in seconds).
pub const TIME_HORIZON_WINDOW: u32 = 6 * 60 * 60;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderRecord {
    pub header: BlockHeader,
    pub height: u32,
}

impl HeaderRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_bytes(&self.header.consensus_encode());
        encoder.write_u32_le(self.height);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header_bytes = decoder.read_bytes(80)?;
        let header = BlockHeader::consensus_decode(&header_bytes)?;
        let height = decoder.read_u32_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { header, height })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleBlockRecord {
    pub merkle: MerkleBlock,
    pub height: u32,
    /// Matched txids extracted from the proof at insertion time.
    pub matched: Vec<Hash256>,
}

impl MerkleBlockRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_bytes(&self.merkle.consensus_encode());
        encoder.write_u32_le(self.height);
        encoder.write_varint(self.matched.len() as u64);
        for hash in &self.matched {
            encoder.write_hash(hash);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header_bytes = decoder.read_bytes(80)?;
        let header = BlockHeader::consensus_decode(&header_bytes)?;
        let tree = PartialMerkleTree::consensus_decode(&mut decoder)?;
        let height = decoder.read_u32_le()?;
        let count = decoder.read_varint()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut matched = Vec::with_capacity(count);
        for _ in 0..count {
            matched.push(decoder.read_hash()?);
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            merkle: MerkleBlock { header, tree },
            height,
            matched,
        })
    }
}

pub fn height_key(height: u32) -> [u8; 4] {
    height.to_be_bytes()
}

pub fn block_tx_key(block_hash: &Hash256, unsigned_hash: &Hash256) -> [u8; 64] {
    let mut key = [0u8; 64];
    key[0..32].copy_from_slice(block_hash);
    key[32..64].copy_from_slice(unsigned_hash);
    key
}
