//! Transaction rows.

use vaultd_primitives::encoding::{DecodeError, Decoder, Encoder};
use vaultd_primitives::{Hash256, OutPoint, Transaction, TxIn, TxOut};

use super::{TxOutStatus, TxStatus};

pub const BLOCK_INDEX_UNKNOWN: u32 = 0xffff_ffff;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxInRecord {
    pub outpoint: OutPoint,
    pub script: Vec<u8>,
    pub sequence: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOutRecord {
    pub value: u64,
    pub script: Vec<u8>,
    pub status: TxOutStatus,
    /// Owning signing script, when this output pays the vault.
    pub signing_script: Option<(Hash256, String, u32)>,
    /// Spending input: `(spender unsigned hash, input index)`. The unsigned
    /// hash is the spender's stable identity across signature merges.
    pub spent_by: Option<(Hash256, u32)>,
    /// Set when the containing tx was sent by a known account but this
    /// output pays a foreign script.
    pub sending_account: Option<Hash256>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxRecord {
    pub unsigned_hash: Hash256,
    pub hash: Hash256,
    pub version: u32,
    pub lock_time: u32,
    pub timestamp: u64,
    pub status: TxStatus,
    /// 0 when any outpoint is unknown (fee indeterminate).
    pub fee: u64,
    pub block_hash: Option<Hash256>,
    pub block_index: u32,
    pub inputs: Vec<TxInRecord>,
    pub outputs: Vec<TxOutRecord>,
}

impl TxRecord {
    pub fn from_wire(tx: &Transaction, timestamp: u64, status: TxStatus) -> Self {
        let inputs = tx
            .inputs
            .iter()
            .map(|input| TxInRecord {
                outpoint: input.prevout,
                script: input.script_sig.clone(),
                sequence: input.sequence,
            })
            .collect();
        let outputs = tx
            .outputs
            .iter()
            .map(|output| TxOutRecord {
                value: output.value,
                script: output.script_pubkey.clone(),
                status: TxOutStatus::Unspent,
                signing_script: None,
                spent_by: None,
                sending_account: None,
            })
            .collect();
        Self {
            unsigned_hash: tx.unsigned_txid(),
            hash: tx.txid(),
            version: tx.version,
            lock_time: tx.lock_time,
            timestamp,
            status,
            fee: 0,
            block_hash: None,
            block_index: BLOCK_INDEX_UNKNOWN,
            inputs,
            outputs,
        }
    }

    pub fn to_wire(&self) -> Transaction {
        Transaction {
            version: self.version,
            inputs: self
                .inputs
                .iter()
                .map(|input| TxIn {
                    prevout: input.outpoint,
                    script_sig: input.script.clone(),
                    sequence: input.sequence,
                })
                .collect(),
            outputs: self
                .outputs
                .iter()
                .map(|output| TxOut {
                    value: output.value,
                    script_pubkey: output.script.clone(),
                })
                .collect(),
            lock_time: self.lock_time,
        }
    }

    /// Input scripts changed; the signed txid must follow.
    pub fn recompute_hash(&mut self) {
        self.hash = self.to_wire().txid();
    }

    pub fn total_output_value(&self) -> u64 {
        self.outputs
            .iter()
            .fold(0u64, |sum, output| sum.saturating_add(output.value))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_hash(&self.unsigned_hash);
        encoder.write_hash(&self.hash);
        encoder.write_u32_le(self.version);
        encoder.write_u32_le(self.lock_time);
        encoder.write_u64_le(self.timestamp);
        encoder.write_u8(self.status as u8);
        encoder.write_u64_le(self.fee);
        match &self.block_hash {
            Some(hash) => {
                encoder.write_bool(true);
                encoder.write_hash(hash);
            }
            None => encoder.write_bool(false),
        }
        encoder.write_u32_le(self.block_index);

        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            encoder.write_hash(&input.outpoint.hash);
            encoder.write_u32_le(input.outpoint.index);
            encoder.write_var_bytes(&input.script);
            encoder.write_u32_le(input.sequence);
        }

        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            encoder.write_u64_le(output.value);
            encoder.write_var_bytes(&output.script);
            encoder.write_u8(output.status as u8);
            match &output.signing_script {
                Some((account, bin, index)) => {
                    encoder.write_bool(true);
                    encoder.write_hash(account);
                    encoder.write_var_str(bin);
                    encoder.write_u32_le(*index);
                }
                None => encoder.write_bool(false),
            }
            match &output.spent_by {
                Some((spender, input_index)) => {
                    encoder.write_bool(true);
                    encoder.write_hash(spender);
                    encoder.write_u32_le(*input_index);
                }
                None => encoder.write_bool(false),
            }
            match &output.sending_account {
                Some(account) => {
                    encoder.write_bool(true);
                    encoder.write_hash(account);
                }
                None => encoder.write_bool(false),
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let unsigned_hash = decoder.read_hash()?;
        let hash = decoder.read_hash()?;
        let version = decoder.read_u32_le()?;
        let lock_time = decoder.read_u32_le()?;
        let timestamp = decoder.read_u64_le()?;
        let status = TxStatus::from_u8(decoder.read_u8()?)?;
        let fee = decoder.read_u64_le()?;
        let block_hash = if decoder.read_bool()? {
            Some(decoder.read_hash()?)
        } else {
            None
        };
        let block_index = decoder.read_u32_le()?;

        let input_count = decoder.read_varint()?;
        let input_count = usize::try_from(input_count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            let hash = decoder.read_hash()?;
            let index = decoder.read_u32_le()?;
            let script = decoder.read_var_bytes()?;
            let sequence = decoder.read_u32_le()?;
            inputs.push(TxInRecord {
                outpoint: OutPoint::new(hash, index),
                script,
                sequence,
            });
        }

        let output_count = decoder.read_varint()?;
        let output_count = usize::try_from(output_count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            let value = decoder.read_u64_le()?;
            let script = decoder.read_var_bytes()?;
            let status = TxOutStatus::from_u8(decoder.read_u8()?)?;
            let signing_script = if decoder.read_bool()? {
                let account = decoder.read_hash()?;
                let bin = decoder.read_var_str()?;
                let index = decoder.read_u32_le()?;
                Some((account, bin, index))
            } else {
                None
            };
            let spent_by = if decoder.read_bool()? {
                let spender = decoder.read_hash()?;
                let input_index = decoder.read_u32_le()?;
                Some((spender, input_index))
            } else {
                None
            };
            let sending_account = if decoder.read_bool()? {
                Some(decoder.read_hash()?)
            } else {
                None
            };
            outputs.push(TxOutRecord {
                value,
                script,
                status,
                signing_script,
                spent_by,
                sending_account,
            });
        }

        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            unsigned_hash,
            hash,
            version,
            lock_time,
            timestamp,
            status,
            fee,
            block_hash,
            block_index,
            inputs,
            outputs,
        })
    }
}
