//! Merkle blocks: a block header plus a partial merkle tree proving which
//! transactions of the block are of interest to the wallet.

use crate::block::BlockHeader;
use crate::encoding::{decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::Hash256;

// An 1 MB block cannot carry more transactions than this.
const MAX_TRANSACTIONS_PER_BLOCK: u32 = 1_000_000 / 60;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartialMerkleTree {
    pub total_transactions: u32,
    pub bits: Vec<bool>,
    pub hashes: Vec<Hash256>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MerkleBlock {
    pub header: BlockHeader,
    pub tree: PartialMerkleTree,
}

impl MerkleBlock {
    pub fn consensus_encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode(bytes)
    }

    /// Matched txids, in block order, provided the proof is well formed and
    /// its computed root equals the header's merkle root.
    pub fn matched_txids(&self) -> Option<Vec<Hash256>> {
        let (root, matched) = self.tree.extract_matches()?;
        if root != self.header.merkle_root {
            return None;
        }
        Some(matched)
    }
}

impl Encodable for MerkleBlock {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.header.encode_into(encoder);
        self.tree.consensus_encode(encoder);
    }
}

impl Decodable for MerkleBlock {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = BlockHeader::decode_from(decoder)?;
        let tree = PartialMerkleTree::consensus_decode(decoder)?;
        Ok(Self { header, tree })
    }
}

impl PartialMerkleTree {
    pub fn from_txids(txids: &[Hash256], matches: &[bool]) -> Result<Self, DecodeError> {
        if txids.len() != matches.len() {
            return Err(DecodeError::InvalidData("txids/matches length mismatch"));
        }
        let total = u32::try_from(txids.len()).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut tree = Self {
            total_transactions: total,
            bits: Vec::new(),
            hashes: Vec::new(),
        };
        tree.build(tree_height(total), 0, txids, matches);
        Ok(tree)
    }

    /// Returns the recomputed merkle root and the matched txids, or `None`
    /// when the proof is malformed.
    pub fn extract_matches(&self) -> Option<(Hash256, Vec<Hash256>)> {
        if self.total_transactions == 0
            || self.total_transactions > MAX_TRANSACTIONS_PER_BLOCK
            || self.hashes.len() > self.total_transactions as usize
            || self.bits.len() < self.hashes.len()
        {
            return None;
        }

        let mut cursor = ProofCursor {
            bits_used: 0,
            hashes_used: 0,
            matched: Vec::new(),
            bad: false,
        };
        let root = self.extract(tree_height(self.total_transactions), 0, &mut cursor);

        if cursor.bad
            || (cursor.bits_used + 7) / 8 != (self.bits.len() + 7) / 8
            || cursor.hashes_used != self.hashes.len()
        {
            return None;
        }
        Some((root, cursor.matched))
    }

    fn build(&mut self, height: u32, pos: u32, txids: &[Hash256], matches: &[bool]) {
        let start = (pos as u64) << height;
        let end = ((pos as u64 + 1) << height).min(self.total_transactions as u64);
        let parent_of_match = (start..end).any(|idx| matches[idx as usize]);

        self.bits.push(parent_of_match);

        if height == 0 || !parent_of_match {
            self.hashes.push(self.subtree_hash(height, pos, txids));
            return;
        }

        self.build(height - 1, pos * 2, txids, matches);
        if pos * 2 + 1 < tree_width(self.total_transactions, height - 1) {
            self.build(height - 1, pos * 2 + 1, txids, matches);
        }
    }

    fn extract(&self, height: u32, pos: u32, cursor: &mut ProofCursor) -> Hash256 {
        if cursor.bits_used >= self.bits.len() {
            cursor.bad = true;
            return [0u8; 32];
        }
        let parent_of_match = self.bits[cursor.bits_used];
        cursor.bits_used += 1;

        if height == 0 || !parent_of_match {
            if cursor.hashes_used >= self.hashes.len() {
                cursor.bad = true;
                return [0u8; 32];
            }
            let hash = self.hashes[cursor.hashes_used];
            cursor.hashes_used += 1;
            if height == 0 && parent_of_match {
                cursor.matched.push(hash);
            }
            return hash;
        }

        let left = self.extract(height - 1, pos * 2, cursor);
        let mut right = left;
        if pos * 2 + 1 < tree_width(self.total_transactions, height - 1) {
            right = self.extract(height - 1, pos * 2 + 1, cursor);
            if right == left {
                cursor.bad = true;
            }
        }
        merkle_hash_pair(&left, &right)
    }

    fn subtree_hash(&self, height: u32, pos: u32, txids: &[Hash256]) -> Hash256 {
        if height == 0 {
            return txids[pos as usize];
        }
        let left = self.subtree_hash(height - 1, pos * 2, txids);
        let right = if pos * 2 + 1 < tree_width(self.total_transactions, height - 1) {
            self.subtree_hash(height - 1, pos * 2 + 1, txids)
        } else {
            left
        };
        merkle_hash_pair(&left, &right)
    }
}

struct ProofCursor {
    bits_used: usize,
    hashes_used: usize,
    matched: Vec<Hash256>,
    bad: bool,
}

impl Encodable for PartialMerkleTree {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.total_transactions);
        encoder.write_varint(self.hashes.len() as u64);
        for hash in &self.hashes {
            encoder.write_hash(hash);
        }
        let mut flag_bytes = vec![0u8; (self.bits.len() + 7) / 8];
        for (idx, bit) in self.bits.iter().copied().enumerate() {
            if bit {
                flag_bytes[idx / 8] |= 1u8 << (idx % 8);
            }
        }
        encoder.write_var_bytes(&flag_bytes);
    }
}

impl Decodable for PartialMerkleTree {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let total_transactions = decoder.read_u32_le()?;
        if total_transactions > MAX_TRANSACTIONS_PER_BLOCK {
            return Err(DecodeError::InvalidData(
                "too many transactions in merkle tree",
            ));
        }

        let hash_count = decoder.read_varint()?;
        let hash_count = usize::try_from(hash_count).map_err(|_| DecodeError::SizeTooLarge)?;
        if hash_count > total_transactions as usize {
            return Err(DecodeError::InvalidData("too many hashes in merkle tree"));
        }
        let mut hashes = Vec::with_capacity(hash_count);
        for _ in 0..hash_count {
            hashes.push(decoder.read_hash()?);
        }

        let flag_bytes = decoder.read_var_bytes()?;
        let max_flag_bytes = (total_transactions as usize).saturating_mul(2).saturating_add(7) / 8;
        if flag_bytes.len() > max_flag_bytes {
            return Err(DecodeError::InvalidData("too many flag bytes in merkle tree"));
        }
        let mut bits = Vec::with_capacity(flag_bytes.len() * 8);
        for byte in &flag_bytes {
            for bit in 0..8 {
                bits.push((byte & (1u8 << bit)) != 0);
            }
        }

        Ok(Self {
            total_transactions,
            bits,
            hashes,
        })
    }
}

fn tree_height(total_transactions: u32) -> u32 {
    let mut height = 0u32;
    while tree_width(total_transactions, height) > 1 {
        height += 1;
    }
    height
}

fn tree_width(total_transactions: u32, height: u32) -> u32 {
    (total_transactions + (1 << height) - 1) >> height
}

fn merkle_hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[0..32].copy_from_slice(left);
    buf[32..64].copy_from_slice(right);
    sha256d(&buf)
}

/// Merkle root over the full txid list; test and proof-construction helper.
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return [0u8; 32];
    }
    let mut layer = txids.to_vec();
    while layer.len() > 1 {
        if layer.len() % 2 == 1 {
            let last = *layer.last().expect("non-empty layer");
            layer.push(last);
        }
        let mut next = Vec::with_capacity(layer.len() / 2);
        for pair in layer.chunks(2) {
            next.push(merkle_hash_pair(&pair[0], &pair[1]));
        }
        layer = next;
    }
    layer[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{decode, encode};

    fn txid(tag: u8) -> Hash256 {
        let mut hash = [0u8; 32];
        hash[0] = tag;
        hash
    }

    #[test]
    fn build_extract_roundtrip() {
        let txids: Vec<Hash256> = (0u8..7).map(txid).collect();
        let matches = vec![false, true, false, true, true, false, false];

        let tree = PartialMerkleTree::from_txids(&txids, &matches).expect("build");
        let (root, extracted) = tree.extract_matches().expect("extract");
        assert_eq!(root, merkle_root(&txids));

        let expected: Vec<Hash256> = txids
            .iter()
            .zip(matches.iter().copied())
            .filter_map(|(txid, matched)| matched.then_some(*txid))
            .collect();
        assert_eq!(extracted, expected);

        let bytes = encode(&tree);
        let decoded: PartialMerkleTree = decode(&bytes).expect("decode");
        assert_eq!(decoded, tree);
    }

    #[test]
    fn single_transaction_block() {
        let txids = vec![txid(9)];
        let tree = PartialMerkleTree::from_txids(&txids, &[true]).expect("build");
        let (root, extracted) = tree.extract_matches().expect("extract");
        assert_eq!(root, txids[0]);
        assert_eq!(extracted, txids);
    }

    #[test]
    fn matched_txids_checks_root() {
        let txids: Vec<Hash256> = (0u8..4).map(txid).collect();
        let tree = PartialMerkleTree::from_txids(&txids, &[false, true, false, false])
            .expect("build");
        let header = BlockHeader {
            version: 4,
            prev_block: [0u8; 32],
            merkle_root: merkle_root(&txids),
            time: 0,
            bits: 0,
            nonce: 0,
        };
        let block = MerkleBlock { header, tree };
        assert_eq!(block.matched_txids().expect("matches"), vec![txid(1)]);

        let mut tampered = block;
        tampered.header.merkle_root = [0xau8; 32];
        assert!(tampered.matched_txids().is_none());
    }
}
