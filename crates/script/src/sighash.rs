//! Legacy signature hashing.

use vaultd_primitives::encoding::{Encodable, Encoder};
use vaultd_primitives::hash::sha256d;
use vaultd_primitives::{Hash256, Transaction};

pub const SIGHASH_ALL: u32 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SighashError {
    InputIndexOutOfRange,
}

impl std::fmt::Display for SighashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SighashError::InputIndexOutOfRange => write!(f, "input index out of range"),
        }
    }
}

impl std::error::Error for SighashError {}

/// SIGHASH_ALL digest: the transaction with only the signed input carrying
/// `script_code` (its SIGN-form script), every other input script empty, and
/// the sighash type appended.
pub fn signature_hash_all(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
) -> Result<Hash256, SighashError> {
    if input_index >= tx.inputs.len() {
        return Err(SighashError::InputIndexOutOfRange);
    }

    let mut encoder = Encoder::new();
    encoder.write_u32_le(tx.version);
    encoder.write_varint(tx.inputs.len() as u64);
    for (idx, input) in tx.inputs.iter().enumerate() {
        input.prevout.consensus_encode(&mut encoder);
        if idx == input_index {
            encoder.write_var_bytes(script_code);
        } else {
            encoder.write_varint(0);
        }
        encoder.write_u32_le(input.sequence);
    }
    encoder.write_varint(tx.outputs.len() as u64);
    for output in &tx.outputs {
        output.consensus_encode(&mut encoder);
    }
    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(SIGHASH_ALL);

    Ok(sha256d(&encoder.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultd_primitives::{OutPoint, TxIn, TxOut};

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![
                TxIn {
                    prevout: OutPoint::new([1u8; 32], 0),
                    script_sig: vec![0xff; 8],
                    sequence: 0xffff_ffff,
                },
                TxIn {
                    prevout: OutPoint::new([2u8; 32], 1),
                    script_sig: vec![0xee; 8],
                    sequence: 0xffff_ffff,
                },
            ],
            outputs: vec![TxOut {
                value: 1,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn digest_ignores_other_input_scripts() {
        let tx = sample_tx();
        let script_code = vec![0x52, 0xae];
        let digest = signature_hash_all(&tx, 0, &script_code).expect("digest");

        let mut mutated = tx.clone();
        mutated.inputs[1].script_sig = vec![0x99; 30];
        assert_eq!(
            signature_hash_all(&mutated, 0, &script_code).expect("digest"),
            digest
        );
    }

    #[test]
    fn digest_differs_per_input() {
        let tx = sample_tx();
        let script_code = vec![0x52, 0xae];
        let first = signature_hash_all(&tx, 0, &script_code).expect("digest");
        let second = signature_hash_all(&tx, 1, &script_code).expect("digest");
        assert_ne!(first, second);
    }

    #[test]
    fn rejects_out_of_range_index() {
        let tx = sample_tx();
        assert_eq!(
            signature_hash_all(&tx, 2, &[0x51]),
            Err(SighashError::InputIndexOutOfRange)
        );
    }
}
