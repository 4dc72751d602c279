//! Wallet transaction wire types.
//!
//! Transactions carry two identities: the signed txid over the full
//! serialization, and the unsigned txid computed with every input script
//! replaced by the empty placeholder. The unsigned txid is stable while
//! signatures are collected.

use crate::encoding::{decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;
use crate::Hash256;

pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_u64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn consensus_encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode(bytes)
    }

    /// Txid over the transaction as currently serialized. Changes whenever
    /// input scripts change.
    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    /// Txid over the normalized form with every input script emptied.
    pub fn unsigned_txid(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(self.version);
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.prevout.consensus_encode(&mut encoder);
            encoder.write_varint(0);
            encoder.write_u32_le(input.sequence);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            output.consensus_encode(&mut encoder);
        }
        encoder.write_u32_le(self.lock_time);
        sha256d(&encoder.into_inner())
    }

    pub fn total_output_value(&self) -> u64 {
        self.outputs
            .iter()
            .fold(0u64, |sum, output| sum.saturating_add(output.value))
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.version);
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.consensus_encode(encoder);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            output.consensus_encode(encoder);
        }
        encoder.write_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_u32_le()?;
        let input_count = decoder.read_varint()?;
        let input_count = usize::try_from(input_count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            inputs.push(TxIn::consensus_decode(decoder)?);
        }
        let output_count = decoder.read_varint()?;
        let output_count = usize::try_from(output_count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            outputs.push(TxOut::consensus_decode(decoder)?);
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint::new([7u8; 32], 1),
                script_sig: vec![0x00, 0x01, 0xab],
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![
                TxOut {
                    value: 50_000,
                    script_pubkey: vec![0xa9, 0x14],
                },
                TxOut {
                    value: 12_345,
                    script_pubkey: vec![0x51],
                },
            ],
            lock_time: 0,
        }
    }

    #[test]
    fn roundtrip() {
        let tx = sample_tx();
        let bytes = tx.consensus_encode();
        let decoded = Transaction::consensus_decode(&bytes).expect("decode");
        assert_eq!(decoded, tx);
    }

    #[test]
    fn unsigned_txid_ignores_input_scripts() {
        let tx = sample_tx();
        let mut resigned = tx.clone();
        resigned.inputs[0].script_sig = vec![0x30, 0x45, 0x01];

        assert_ne!(tx.txid(), resigned.txid());
        assert_eq!(tx.unsigned_txid(), resigned.unsigned_txid());
    }

    #[test]
    fn unsigned_txid_matches_emptied_serialization() {
        let tx = sample_tx();
        let mut emptied = tx.clone();
        emptied.inputs[0].script_sig.clear();
        assert_eq!(tx.unsigned_txid(), emptied.txid());
    }
}
