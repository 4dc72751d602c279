//! Transaction ingestion, creation, signing, and deletion.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::OsRng;
use rand::seq::SliceRandom;

use vaultd_keychain::extkey;
use vaultd_log::log_debug;
use vaultd_primitives::{to_hex, Hash256, OutPoint, Transaction, TxIn, TxOut};
use vaultd_script::{sign_hash, signature_hash_all, InputScript, SIGHASH_ALL};
use vaultd_storage::Column;

use crate::error::VaultError;
use crate::model::{
    block_tx_key, parse_script_key, KeyLocator, ScriptStatus, TxInRecord, TxOutStatus, TxRecord,
    TxStatus, CHANGE_BIN_NAME,
};
use crate::session::Session;

/// Payment destination for `create_tx`.
#[derive(Clone, Debug)]
pub struct Recipient {
    pub txout_script: Vec<u8>,
    pub value: u64,
}

/// What a cosigner still has to provide for a stored transaction.
#[derive(Clone, Debug)]
pub struct SigningRequest {
    pub sigs_needed: u32,
    /// `(keychain name, keychain hash)` of every root keychain that can
    /// still contribute a signature.
    pub keychains: BTreeSet<(String, Hash256)>,
    pub raw_tx: Option<Vec<u8>>,
}

/// UNSIGNED when any input still misses a required signature; otherwise the
/// caller-provided status, floored at UNSENT. Inputs that do not parse as
/// multisig scripts are foreign and count as complete.
pub(crate) fn status_from_scripts(inputs: &[TxInRecord], provided: TxStatus) -> TxStatus {
    let missing = inputs.iter().any(|input| {
        InputScript::parse(&input.script)
            .map(|script| script.sigs_needed() > 0)
            .unwrap_or(false)
    });
    if missing {
        TxStatus::Unsigned
    } else if provided <= TxStatus::Unsigned {
        TxStatus::Unsent
    } else {
        provided
    }
}

impl Session<'_> {
    /// Looks a transaction up by signed or unsigned hash.
    pub fn get_tx_unwrapped(&self, hash: &Hash256) -> Result<Option<TxRecord>, VaultError> {
        if let Some(record) = self.load_tx(hash)? {
            return Ok(Some(record));
        }
        match self.resolve_txid(hash)? {
            Some(unsigned_hash) => self.load_tx(&unsigned_hash),
            None => Ok(None),
        }
    }

    /// Ingests an observed transaction: reconciles duplicates by unsigned
    /// hash, connects outpoints, detects double spends, advances signing
    /// scripts, and attributes accounts. Returns the stored row when the
    /// transaction touched the vault, `None` when it is unrelated (the
    /// caller then skips the commit, rolling everything back).
    pub fn insert_tx_unwrapped(
        &mut self,
        wire: &Transaction,
        provided_status: Option<TxStatus>,
        timestamp: u64,
    ) -> Result<Option<TxRecord>, VaultError> {
        let mut tx = TxRecord::from_wire(
            wire,
            timestamp,
            provided_status.unwrap_or(TxStatus::Unsent),
        );
        tx.status = status_from_scripts(&tx.inputs, tx.status);

        if let Some(stored) = self.load_tx(&tx.unsigned_hash)? {
            log_debug!(
                "Vault::insert_tx - already have unsigned hash {}",
                to_hex(&tx.unsigned_hash)
            );
            return self.reconcile_duplicate(stored, tx);
        }

        // Check inputs: connect outpoints, detect double spends, attribute
        // the sending account.
        let mut conflicts: BTreeSet<Hash256> = BTreeSet::new();
        let mut touched_parents: BTreeMap<Hash256, TxRecord> = BTreeMap::new();
        let mut sent_from_vault = false;
        let mut have_all_outpoints = true;
        let mut input_total = 0u64;
        let mut sending_account: Option<Hash256> = None;

        for (input_index, input) in tx.inputs.iter().enumerate() {
            let Some(parent_unsigned) = self.resolve_txid(&input.outpoint.hash)? else {
                have_all_outpoints = false;
                continue;
            };
            let mut parent = match touched_parents.remove(&parent_unsigned) {
                Some(parent) => parent,
                None => self.load_tx(&parent_unsigned)?.ok_or_else(|| {
                    VaultError::InvariantViolation("dangling tx hash index entry".to_string())
                })?,
            };
            let out_index = input.outpoint.index as usize;
            if out_index >= parent.outputs.len() {
                return Err(VaultError::InvariantViolation(format!(
                    "outpoint index out of range: {}:{}",
                    to_hex(&input.outpoint.hash),
                    input.outpoint.index
                )));
            }

            if let Some((spender, _)) = parent.outputs[out_index].spent_by {
                if spender != tx.unsigned_hash {
                    log_debug!(
                        "Vault::insert_tx - double spend of {}:{} by {}",
                        to_hex(&input.outpoint.hash),
                        input.outpoint.index,
                        to_hex(&tx.unsigned_hash)
                    );
                    conflicts.insert(spender);
                }
            }

            input_total = input_total.saturating_add(parent.outputs[out_index].value);

            if let Some(script_key_bytes) = self
                .txn
                .get(Column::ScriptByOut, &parent.outputs[out_index].script)?
            {
                sent_from_vault = true;
                parent.outputs[out_index].spent_by = Some((tx.unsigned_hash, input_index as u32));
                parent.outputs[out_index].status = TxOutStatus::Spent;
                if sending_account.is_none() {
                    // All inputs are assumed to spend from one account; coin
                    // mixing is unsupported.
                    let (account, _, _) = parse_script_key(&script_key_bytes)?;
                    sending_account = Some(account);
                }
            }
            touched_parents.insert(parent_unsigned, parent);
        }

        // Check outputs: pool hits advance script status and schedule
        // refills; late-arriving parents pick up their existing spenders.
        let mut sent_to_vault = false;
        let mut output_total = 0u64;
        let incoming_txid = tx.hash;
        let unsigned_hash = tx.unsigned_hash;

        for out_index in 0..tx.outputs.len() {
            output_total = output_total.saturating_add(tx.outputs[out_index].value);
            let script_bytes = tx.outputs[out_index].script.clone();
            if let Some(script_key_bytes) = self.txn.get(Column::ScriptByOut, &script_bytes)? {
                sent_to_vault = true;
                let (account_hash, bin_name, script_index) = parse_script_key(&script_key_bytes)?;
                tx.outputs[out_index].signing_script =
                    Some((account_hash, bin_name.clone(), script_index));

                let mut script = self
                    .load_script(&account_hash, &bin_name, script_index)?
                    .ok_or_else(|| {
                        VaultError::InvariantViolation(
                            "dangling txoutscript index entry".to_string(),
                        )
                    })?;
                // UNUSED and ISSUED entries advance when first seen in an
                // output; a vault-originated spend into its own change bin
                // marks the entry CHANGE (the issuance path leaves change
                // scripts ISSUED, ingestion corrects them here).
                if matches!(script.status, ScriptStatus::Unused | ScriptStatus::Issued) {
                    let account = self.load_account_by_hash(&account_hash)?.ok_or_else(|| {
                        VaultError::InvariantViolation(
                            "signing script references a missing account".to_string(),
                        )
                    })?;
                    let mut bin = self.load_bin(&account_hash, &bin_name)?.ok_or_else(|| {
                        VaultError::InvariantViolation(
                            "signing script references a missing bin".to_string(),
                        )
                    })?;
                    script.status = if sent_from_vault && bin.is_change() {
                        ScriptStatus::Change
                    } else {
                        ScriptStatus::Used
                    };
                    self.store_script(&script);
                    match self.refill_bin_pool(&account, &mut bin) {
                        Err(VaultError::AccountChainCodeLocked { .. }) => {
                            log_debug!(
                                "Vault::insert_tx - chain code locked, pool not replenished"
                            );
                        }
                        other => other?,
                    }
                }

                // Out-of-order arrival: a persisted input may already spend
                // this brand-new output.
                let spent_key = OutPoint::new(incoming_txid, out_index as u32).to_key();
                if let Some(spender_bytes) = self.txn.get(Column::SpentIndex, &spent_key)? {
                    let (spender, spender_input) = decode_spent_entry(&spender_bytes)?;
                    if spender != unsigned_hash {
                        tx.outputs[out_index].spent_by = Some((spender, spender_input));
                        tx.outputs[out_index].status = TxOutStatus::Spent;
                    }
                }
            } else if let Some(account) = sending_account {
                tx.outputs[out_index].sending_account = Some(account);
            }
        }

        if !conflicts.is_empty() {
            tx.status = TxStatus::Conflicting;
        }

        if !(sent_from_vault || sent_to_vault) {
            log_debug!("Vault::insert_tx - transaction not inserted");
            return Ok(None);
        }

        if have_all_outpoints {
            tx.fee = input_total.saturating_sub(output_total);
        }
        log_debug!(
            "Vault::insert_tx - inserting, hash {} unsigned {}",
            to_hex(&tx.hash),
            to_hex(&tx.unsigned_hash)
        );

        for parent in touched_parents.values() {
            self.store_tx(parent);
        }
        for spender_unsigned in &conflicts {
            if let Some(mut conflicting) = self.load_tx(spender_unsigned)? {
                if conflicting.status != TxStatus::Confirmed {
                    conflicting.status = TxStatus::Conflicting;
                    self.store_tx(&conflicting);
                }
            }
        }

        self.store_tx(&tx);
        for (input_index, input) in tx.inputs.iter().enumerate() {
            self.txn.put(
                Column::SpentIndex,
                input.outpoint.to_key().to_vec(),
                encode_spent_entry(&tx.unsigned_hash, input_index as u32),
            );
        }

        if tx.status >= TxStatus::Sent {
            self.update_confirmations_unwrapped(Some(tx.hash))?;
            if let Some(fresh) = self.load_tx(&tx.unsigned_hash)? {
                return Ok(Some(fresh));
            }
        }
        Ok(Some(tx))
    }

    /// Reconciliation of a transaction whose unsigned hash is already
    /// stored: replace, merge signatures, promote status, or ignore.
    fn reconcile_duplicate(
        &mut self,
        mut stored: TxRecord,
        tx: TxRecord,
    ) -> Result<Option<TxRecord>, VaultError> {
        if stored.status == TxStatus::Unsigned {
            if tx.status != TxStatus::Unsigned {
                // Signed version of a transaction we hold unsigned.
                log_debug!(
                    "Vault::insert_tx - replacing unsigned transaction with signed version {}",
                    to_hex(&tx.hash)
                );
                for (stored_input, new_input) in stored.inputs.iter_mut().zip(tx.inputs.iter()) {
                    stored_input.script = new_input.script.clone();
                }
                stored.status = tx.status;
                self.rekey_tx(&mut stored)?;
                return Ok(Some(stored));
            }

            // Both unsigned: absorb whatever new signatures the incoming
            // copy carries.
            let mut updated = false;
            for (input_index, (stored_input, new_input)) in stored
                .inputs
                .iter_mut()
                .zip(tx.inputs.iter())
                .enumerate()
            {
                let Ok(mut ours) = InputScript::parse(&stored_input.script) else {
                    continue;
                };
                let Ok(theirs) = InputScript::parse(&new_input.script) else {
                    continue;
                };
                let added = match ours.merge_sigs(&theirs) {
                    Ok(added) => added,
                    Err(_) => {
                        log_debug!(
                            "Vault::insert_tx - input {input_index} scripts do not line up, skipped"
                        );
                        continue;
                    }
                };
                if added > 0 {
                    log_debug!(
                        "Vault::insert_tx - added {added} new signature(s) to input {input_index}"
                    );
                    stored_input.script = ours.edit_script();
                    updated = true;
                }
            }
            if updated {
                stored.status = status_from_scripts(&stored.inputs, stored.status);
                self.rekey_tx(&mut stored)?;
                return Ok(Some(stored));
            }
            return Ok(None);
        }

        if tx.status != TxStatus::Unsigned {
            if tx.status > stored.status {
                log_debug!(
                    "Vault::insert_tx - promoting status {} -> {} for {}",
                    stored.status.as_str(),
                    tx.status.as_str(),
                    to_hex(&stored.hash)
                );
                stored.status = tx.status;
                self.store_tx(&stored);
                return Ok(Some(stored));
            }
            log_debug!(
                "Vault::insert_tx - transaction not updated, hash {}",
                to_hex(&stored.hash)
            );
            return Ok(None);
        }

        // Stored copy is signed, incoming one is not: a regression, ignore.
        log_debug!(
            "Vault::insert_tx - stored transaction already signed, ignoring unsigned copy {}",
            to_hex(&stored.hash)
        );
        Ok(None)
    }

    /// Persists a row whose input scripts changed: the signed txid moved,
    /// so the hash index entry must move with it.
    fn rekey_tx(&mut self, record: &mut TxRecord) -> Result<(), VaultError> {
        let old_hash = record.hash;
        record.recompute_hash();
        if old_hash != record.hash {
            self.txn.delete(Column::TxByHash, old_hash.to_vec());
        }
        self.store_tx(record);
        Ok(())
    }

    /// Coin selection and construction: uniformly shuffled UTXOs, greedy
    /// accumulation, one change output issued from the change bin, shuffled
    /// outputs, UNSIGNED result.
    pub fn create_tx_unwrapped(
        &mut self,
        account_name: &str,
        version: u32,
        lock_time: u32,
        recipients: &[Recipient],
        fee: u64,
        _max_change_outs: u32,
    ) -> Result<Transaction, VaultError> {
        let account = self.get_account_unwrapped(account_name)?;

        let mut desired_total = fee;
        for recipient in recipients {
            desired_total = desired_total.saturating_add(recipient.value);
        }

        let mut utxos = self.unspent_outputs(&account.hash)?;
        utxos.shuffle(&mut OsRng);

        let mut inputs = Vec::new();
        let mut total = 0u64;
        for utxo in &utxos {
            total = total.saturating_add(utxo.value);
            inputs.push(TxIn {
                prevout: OutPoint::new(utxo.txid, utxo.out_index),
                script_sig: utxo.txin_template.clone(),
                sequence: 0xffff_ffff,
            });
            if total >= desired_total {
                break;
            }
        }
        if total < desired_total {
            return Err(VaultError::AccountInsufficientFunds(account.name));
        }
        let change = total - desired_total;

        let mut outputs: Vec<TxOut> = recipients
            .iter()
            .map(|recipient| TxOut {
                value: recipient.value,
                script_pubkey: recipient.txout_script.clone(),
            })
            .collect();
        if change > 0 {
            let (_, mut change_bin) = self.get_bin_unwrapped(account_name, CHANGE_BIN_NAME)?;
            // Issued through the internal path; ingestion corrects the pool
            // entry to CHANGE when the spend comes back.
            let change_script = self.issue_script_in_bin(&account, &mut change_bin, "")?;
            outputs.push(TxOut {
                value: change,
                script_pubkey: change_script.txout_script,
            });
        }
        outputs.shuffle(&mut OsRng);

        Ok(Transaction {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    /// Signs whatever inputs the unlocked keychains can cover. Returns false
    /// when no signature was added.
    pub fn sign_tx_unwrapped(&mut self, unsigned_hash: &Hash256) -> Result<bool, VaultError> {
        let mut record = self
            .load_tx(unsigned_hash)?
            .ok_or(VaultError::TxNotFound(*unsigned_hash))?;
        let wire = record.to_wire();
        let mut sigs_added = 0u32;

        for input_index in 0..record.inputs.len() {
            let Ok(mut script) = InputScript::parse(&record.inputs[input_index].script) else {
                continue;
            };
            if script.sigs_needed() == 0 {
                continue;
            }
            let missing = script.missing_sig_pubkeys();
            if missing.is_empty() {
                continue;
            }

            let digest = signature_hash_all(&wire, input_index, &script.sign_script())?;
            log_debug!(
                "Vault::sign_tx - signing hash {} for input {input_index}",
                to_hex(&digest)
            );

            for pubkey in missing {
                if script.sigs_needed() == 0 {
                    break;
                }
                let Some(locator_bytes) = self.txn.get(Column::KeyByPubkey, &pubkey)? else {
                    continue;
                };
                let locator = KeyLocator::decode(&locator_bytes)?;
                let Some(keychain) = self.load_keychain_by_hash(&locator.keychain)? else {
                    continue;
                };
                if !keychain.is_private() {
                    continue;
                }
                let Some(root_privkey) = self.cached_private_key(&keychain)? else {
                    log_debug!(
                        "Vault::sign_tx - private key locked for keychain {}",
                        keychain.name
                    );
                    continue;
                };
                let Some(root_chain_code) = self.cached_chain_code(&keychain)? else {
                    log_debug!(
                        "Vault::sign_tx - chain code locked for keychain {}",
                        keychain.name
                    );
                    continue;
                };

                let (bin_privkey, bin_chain_code) =
                    extkey::derive_child_privkey(&root_privkey, &root_chain_code, locator.bin_index)?;
                let (child_privkey, _) =
                    extkey::derive_child_privkey(&bin_privkey, &bin_chain_code, locator.script_index)?;
                let child_pubkey = extkey::pubkey_for(&child_privkey)?;
                if child_pubkey != pubkey {
                    return Err(VaultError::KeychainInvalidPrivateKey(keychain.name));
                }

                let mut signature = sign_hash(child_privkey.as_slice(), &digest)?;
                signature.push(SIGHASH_ALL as u8);
                script.add_sig(&pubkey, signature)?;
                log_debug!(
                    "Vault::sign_tx - signed input {input_index} with keychain {}",
                    keychain.name
                );
                sigs_added += 1;
            }

            record.inputs[input_index].script = script.current_script();
        }

        if sigs_added == 0 {
            return Ok(false);
        }

        record.status = status_from_scripts(&record.inputs, record.status);
        self.rekey_tx(&mut record)?;
        Ok(true)
    }

    /// Recursive deletion: the consumed outpoints are unspent, transactions
    /// spending this one are deleted, then the row is erased.
    /// Signing-script statuses are never reverted.
    pub fn delete_tx_unwrapped(&mut self, record: &TxRecord) -> Result<(), VaultError> {
        // Unspend the outpoints our inputs consumed.
        for (input_index, input) in record.inputs.iter().enumerate() {
            if let Some(parent_unsigned) = self.resolve_txid(&input.outpoint.hash)? {
                if let Some(mut parent) = self.load_tx(&parent_unsigned)? {
                    let out_index = input.outpoint.index as usize;
                    if out_index < parent.outputs.len()
                        && parent.outputs[out_index].spent_by
                            == Some((record.unsigned_hash, input_index as u32))
                    {
                        parent.outputs[out_index].spent_by = None;
                        parent.outputs[out_index].status = TxOutStatus::Unspent;
                        self.store_tx(&parent);
                    }
                }
            }
            let spent_key = input.outpoint.to_key();
            if let Some(entry) = self.txn.get(Column::SpentIndex, &spent_key)? {
                let (spender, _) = decode_spent_entry(&entry)?;
                if spender == record.unsigned_hash {
                    self.txn.delete(Column::SpentIndex, spent_key.to_vec());
                }
            }
        }

        // Transactions spending our outputs go first.
        for output in &record.outputs {
            if let Some((spender_unsigned, _)) = output.spent_by {
                if let Some(dependent) = self.load_tx(&spender_unsigned)? {
                    self.delete_tx_unwrapped(&dependent)?;
                }
            }
        }

        self.txn.delete(Column::Tx, record.unsigned_hash.to_vec());
        self.txn.delete(Column::TxByHash, record.hash.to_vec());
        if let Some(block_hash) = record.block_hash {
            self.txn.delete(
                Column::TxByBlock,
                block_tx_key(&block_hash, &record.unsigned_hash).to_vec(),
            );
        }
        Ok(())
    }

    pub fn signing_request_unwrapped(
        &self,
        unsigned_hash: &Hash256,
        include_raw: bool,
    ) -> Result<SigningRequest, VaultError> {
        let record = self
            .load_tx(unsigned_hash)?
            .ok_or(VaultError::TxNotFound(*unsigned_hash))?;

        let mut sigs_needed = 0u32;
        let mut keychains = BTreeSet::new();
        for input in &record.inputs {
            let Ok(script) = InputScript::parse(&input.script) else {
                continue;
            };
            sigs_needed = sigs_needed.max(script.sigs_needed() as u32);
            for pubkey in script.missing_sig_pubkeys() {
                let Some(locator_bytes) = self.txn.get(Column::KeyByPubkey, &pubkey)? else {
                    continue;
                };
                let locator = KeyLocator::decode(&locator_bytes)?;
                if let Some(keychain) = self.load_keychain_by_hash(&locator.keychain)? {
                    keychains.insert((keychain.name, keychain.hash));
                }
            }
        }

        let raw_tx = include_raw.then(|| record.to_wire().consensus_encode());
        Ok(SigningRequest {
            sigs_needed,
            keychains,
            raw_tx,
        })
    }

    fn unspent_outputs(&self, account: &Hash256) -> Result<Vec<UtxoCandidate>, VaultError> {
        let mut utxos = Vec::new();
        for (_, bytes) in self.txn.scan_prefix(Column::Tx, &[])? {
            let record = TxRecord::decode(&bytes)?;
            for (out_index, output) in record.outputs.iter().enumerate() {
                if output.status != TxOutStatus::Unspent || output.spent_by.is_some() {
                    continue;
                }
                let Some((owner, bin_name, script_index)) = &output.signing_script else {
                    continue;
                };
                if owner != account {
                    continue;
                }
                let script = self
                    .load_script(owner, bin_name, *script_index)?
                    .ok_or_else(|| {
                        VaultError::InvariantViolation(
                            "txout references a missing signing script".to_string(),
                        )
                    })?;
                utxos.push(UtxoCandidate {
                    txid: record.hash,
                    out_index: out_index as u32,
                    value: output.value,
                    txin_template: script.txin_script,
                });
            }
        }
        Ok(utxos)
    }
}

struct UtxoCandidate {
    txid: Hash256,
    out_index: u32,
    value: u64,
    txin_template: Vec<u8>,
}

pub(crate) fn encode_spent_entry(unsigned_hash: &Hash256, input_index: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(36);
    out.extend_from_slice(unsigned_hash);
    out.extend_from_slice(&input_index.to_le_bytes());
    out
}

pub(crate) fn decode_spent_entry(bytes: &[u8]) -> Result<(Hash256, u32), VaultError> {
    if bytes.len() != 36 {
        return Err(VaultError::InvariantViolation(
            "malformed spent index entry".to_string(),
        ));
    }
    let hash: Hash256 = bytes[0..32]
        .try_into()
        .expect("spent entry hash slice length");
    let input_index = u32::from_le_bytes(
        bytes[32..36]
            .try_into()
            .expect("spent entry index slice length"),
    );
    Ok((hash, input_index))
}
