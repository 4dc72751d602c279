//! The vault façade.
//!
//! Every public operation acquires the global mutex, opens one store
//! transaction, dispatches to the `_unwrapped` internals, and — for writes —
//! commits before releasing the lock. A failed operation drops the
//! transaction, leaving the store bit-identical to its pre-operation state.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use vaultd_keychain::Secret;
use vaultd_log::log_trace;
use vaultd_primitives::{to_hex, Hash256, MerkleBlock, Transaction};
use vaultd_storage::KeyValueStore;

use crate::error::VaultError;
use crate::model::{ScriptStatus, TxOutStatus, TxStatus};
use crate::queries::{AccountInfo, KeychainInfo, SigningScriptEntry, TxInfo, TxOutEntry};
use crate::session::{current_unix_seconds, RuntimeLocks, Session};
use crate::txs::{Recipient, SigningRequest};

pub struct Vault {
    store: Arc<dyn KeyValueStore>,
    locks: Mutex<RuntimeLocks>,
}

impl Vault {
    pub fn open(store: Arc<dyn KeyValueStore>) -> Self {
        log_trace!("Vault::open()");
        Self {
            store,
            locks: Mutex::new(RuntimeLocks::new()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RuntimeLocks> {
        self.locks.lock().expect("vault mutex")
    }

    ///////////////////////
    // GLOBAL OPERATIONS //
    ///////////////////////

    pub fn horizon_timestamp(&self) -> Result<u32, VaultError> {
        log_trace!("Vault::horizon_timestamp()");
        let mut state = self.lock_state();
        let session = Session::new(self.store.as_ref(), &mut state);
        session.horizon_timestamp_unwrapped()
    }

    pub fn best_height(&self) -> Result<u32, VaultError> {
        log_trace!("Vault::best_height()");
        let mut state = self.lock_state();
        let session = Session::new(self.store.as_ref(), &mut state);
        session.best_height_unwrapped()
    }

    /////////////////////////
    // KEYCHAIN OPERATIONS //
    /////////////////////////

    pub fn keychain_exists(&self, name: &str) -> Result<bool, VaultError> {
        log_trace!("Vault::keychain_exists({name})");
        let mut state = self.lock_state();
        let session = Session::new(self.store.as_ref(), &mut state);
        session.keychain_exists_unwrapped(name)
    }

    pub fn new_keychain(
        &self,
        name: &str,
        entropy: &Secret,
        chain_code_lock_key: &Secret,
        salt: &[u8],
    ) -> Result<KeychainInfo, VaultError> {
        log_trace!("Vault::new_keychain({name}, ...)");
        let mut state = self.lock_state();
        let mut session = Session::new(self.store.as_ref(), &mut state);
        let record = session.new_keychain_unwrapped(name, entropy, chain_code_lock_key, salt)?;
        let info = KeychainInfo::from_record(&record);
        session.commit()?;
        Ok(info)
    }

    pub fn rename_keychain(&self, old: &str, new: &str) -> Result<(), VaultError> {
        log_trace!("Vault::rename_keychain({old}, {new})");
        let mut state = self.lock_state();
        let mut session = Session::new(self.store.as_ref(), &mut state);
        session.rename_keychain_unwrapped(old, new)?;
        session.commit()
    }

    pub fn keychain_info(&self, name: &str) -> Result<KeychainInfo, VaultError> {
        log_trace!("Vault::keychain_info({name})");
        let mut state = self.lock_state();
        let session = Session::new(self.store.as_ref(), &mut state);
        let record = session.get_keychain_unwrapped(name)?;
        Ok(KeychainInfo::from_record(&record))
    }

    pub fn all_keychain_infos(&self) -> Result<Vec<KeychainInfo>, VaultError> {
        log_trace!("Vault::all_keychain_infos()");
        let mut state = self.lock_state();
        let session = Session::new(self.store.as_ref(), &mut state);
        session.all_keychain_infos_unwrapped()
    }

    pub fn unlock_keychain_chain_code(
        &self,
        name: &str,
        unlock_key: &Secret,
    ) -> Result<(), VaultError> {
        log_trace!("Vault::unlock_keychain_chain_code({name}, ?)");
        let mut state = self.lock_state();
        let mut session = Session::new(self.store.as_ref(), &mut state);
        session.unlock_chain_code_unwrapped(name, unlock_key)
    }

    pub fn lock_keychain_chain_code(&self, name: &str) {
        log_trace!("Vault::lock_keychain_chain_code({name})");
        self.lock_state().chain_code_keys.remove(name);
    }

    pub fn lock_all_keychain_chain_codes(&self) {
        log_trace!("Vault::lock_all_keychain_chain_codes()");
        self.lock_state().chain_code_keys.clear();
    }

    pub fn unlock_keychain_private_key(
        &self,
        name: &str,
        unlock_key: &Secret,
    ) -> Result<(), VaultError> {
        log_trace!("Vault::unlock_keychain_private_key({name}, ?)");
        let mut state = self.lock_state();
        let mut session = Session::new(self.store.as_ref(), &mut state);
        session.unlock_private_key_unwrapped(name, unlock_key)
    }

    pub fn lock_keychain_private_key(&self, name: &str) {
        log_trace!("Vault::lock_keychain_private_key({name})");
        self.lock_state().private_keys.remove(name);
    }

    pub fn lock_all_keychain_private_keys(&self) {
        log_trace!("Vault::lock_all_keychain_private_keys()");
        self.lock_state().private_keys.clear();
    }

    pub fn export_keychain(
        &self,
        name: &str,
        path: &Path,
        with_privkeys: bool,
    ) -> Result<(), VaultError> {
        log_trace!("Vault::export_keychain({name}, {}, {with_privkeys})", path.display());
        let mut state = self.lock_state();
        let session = Session::new(self.store.as_ref(), &mut state);
        let text = session.export_keychain_unwrapped(name, with_privkeys)?;
        write_file_atomic(path, text.as_bytes())
    }

    pub fn import_keychain(
        &self,
        path: &Path,
        want_privkeys: bool,
    ) -> Result<KeychainInfo, VaultError> {
        log_trace!("Vault::import_keychain({}, {want_privkeys})", path.display());
        let text = fs::read_to_string(path)?;
        let mut state = self.lock_state();
        let mut session = Session::new(self.store.as_ref(), &mut state);
        let record = session.import_keychain_unwrapped(&text, want_privkeys)?;
        let info = KeychainInfo::from_record(&record);
        session.commit()?;
        Ok(info)
    }

    ////////////////////////
    // ACCOUNT OPERATIONS //
    ////////////////////////

    pub fn account_exists(&self, name: &str) -> Result<bool, VaultError> {
        log_trace!("Vault::account_exists({name})");
        let mut state = self.lock_state();
        let session = Session::new(self.store.as_ref(), &mut state);
        session.account_exists_unwrapped(name)
    }

    pub fn new_account(
        &self,
        name: &str,
        min_sigs: u32,
        keychain_names: &[String],
        unused_pool_size: u32,
        time_created: u32,
    ) -> Result<AccountInfo, VaultError> {
        log_trace!(
            "Vault::new_account({name}, {min_sigs} of {:?}, {unused_pool_size}, {time_created})",
            keychain_names
        );
        let mut state = self.lock_state();
        let mut session = Session::new(self.store.as_ref(), &mut state);
        let account = session.new_account_unwrapped(
            name,
            min_sigs,
            keychain_names,
            unused_pool_size,
            time_created,
        )?;
        let info = session.account_info_unwrapped(&account.name)?;
        session.commit()?;
        Ok(info)
    }

    pub fn rename_account(&self, old: &str, new: &str) -> Result<(), VaultError> {
        log_trace!("Vault::rename_account({old}, {new})");
        let mut state = self.lock_state();
        let mut session = Session::new(self.store.as_ref(), &mut state);
        session.rename_account_unwrapped(old, new)?;
        session.commit()
    }

    pub fn account_info(&self, name: &str) -> Result<AccountInfo, VaultError> {
        log_trace!("Vault::account_info({name})");
        let mut state = self.lock_state();
        let session = Session::new(self.store.as_ref(), &mut state);
        session.account_info_unwrapped(name)
    }

    pub fn all_account_infos(&self) -> Result<Vec<AccountInfo>, VaultError> {
        log_trace!("Vault::all_account_infos()");
        let mut state = self.lock_state();
        let session = Session::new(self.store.as_ref(), &mut state);
        session.all_account_infos_unwrapped()
    }

    pub fn account_balance(
        &self,
        name: &str,
        min_confirmations: u32,
        tx_statuses: &[TxStatus],
    ) -> Result<u64, VaultError> {
        log_trace!("Vault::account_balance({name}, {min_confirmations})");
        let mut state = self.lock_state();
        let session = Session::new(self.store.as_ref(), &mut state);
        session.account_balance_unwrapped(name, min_confirmations, tx_statuses)
    }

    pub fn add_account_bin(&self, account_name: &str, bin_name: &str) -> Result<(), VaultError> {
        log_trace!("Vault::add_account_bin({account_name}, {bin_name})");
        let mut state = self.lock_state();
        let mut session = Session::new(self.store.as_ref(), &mut state);
        session.add_account_bin_unwrapped(account_name, bin_name)?;
        session.commit()
    }

    pub fn issue_signing_script(
        &self,
        account_name: &str,
        bin_name: &str,
        label: &str,
    ) -> Result<SigningScriptEntry, VaultError> {
        log_trace!("Vault::issue_signing_script({account_name}, {bin_name}, {label})");
        let mut state = self.lock_state();
        let mut session = Session::new(self.store.as_ref(), &mut state);
        let script = session.issue_signing_script_unwrapped(account_name, bin_name, label)?;
        let entry = SigningScriptEntry {
            account_name: account_name.to_string(),
            bin_name: script.bin_name.clone(),
            index: script.index,
            status: script.status,
            label: script.label.clone(),
            txin_script: script.txin_script.clone(),
            txout_script: script.txout_script.clone(),
        };
        session.commit()?;
        Ok(entry)
    }

    pub fn refill_account_pool(&self, account_name: &str) -> Result<(), VaultError> {
        log_trace!("Vault::refill_account_pool({account_name})");
        let mut state = self.lock_state();
        let mut session = Session::new(self.store.as_ref(), &mut state);
        session.refill_account_pool_unwrapped(account_name)?;
        session.commit()
    }

    pub fn signing_script_entries(
        &self,
        account_name: &str,
        bin_name: &str,
        statuses: &[ScriptStatus],
    ) -> Result<Vec<SigningScriptEntry>, VaultError> {
        log_trace!("Vault::signing_script_entries({account_name}, {bin_name})");
        let mut state = self.lock_state();
        let session = Session::new(self.store.as_ref(), &mut state);
        session.signing_script_entries_unwrapped(account_name, bin_name, statuses)
    }

    pub fn tx_out_entries(
        &self,
        account_name: &str,
        bin_name: &str,
        txout_statuses: &[TxOutStatus],
        tx_statuses: &[TxStatus],
    ) -> Result<Vec<TxOutEntry>, VaultError> {
        log_trace!("Vault::tx_out_entries({account_name}, {bin_name})");
        let mut state = self.lock_state();
        let session = Session::new(self.store.as_ref(), &mut state);
        session.tx_out_entries_unwrapped(account_name, bin_name, txout_statuses, tx_statuses)
    }

    pub fn export_account(
        &self,
        account_name: &str,
        path: &Path,
        chain_code_lock_key: &Secret,
        salt: &[u8],
        with_privkeys: bool,
    ) -> Result<(), VaultError> {
        log_trace!(
            "Vault::export_account({account_name}, {}, {with_privkeys})",
            path.display()
        );
        let mut state = self.lock_state();
        let mut session = Session::new(self.store.as_ref(), &mut state);
        let text = session.export_account_unwrapped(
            account_name,
            chain_code_lock_key,
            salt,
            with_privkeys,
        )?;
        write_file_atomic(path, text.as_bytes())
    }

    /// Returns the imported account's info and the number of private keys
    /// imported.
    pub fn import_account(
        &self,
        path: &Path,
        chain_code_key: &Secret,
        want_privkeys: bool,
    ) -> Result<(AccountInfo, u32), VaultError> {
        log_trace!("Vault::import_account({}, {want_privkeys})", path.display());
        let text = fs::read_to_string(path)?;
        let mut state = self.lock_state();
        let mut session = Session::new(self.store.as_ref(), &mut state);
        let (account, privkeys_imported) =
            session.import_account_unwrapped(&text, chain_code_key, want_privkeys)?;
        let info = session.account_info_unwrapped(&account.name)?;
        session.commit()?;
        Ok((info, privkeys_imported))
    }

    ////////////////////////////
    // TRANSACTION OPERATIONS //
    ////////////////////////////

    /// Looks a transaction up by signed or unsigned hash.
    pub fn get_tx(&self, hash: &Hash256) -> Result<TxInfo, VaultError> {
        log_trace!("Vault::get_tx({})", to_hex(hash));
        let mut state = self.lock_state();
        let session = Session::new(self.store.as_ref(), &mut state);
        let record = session
            .get_tx_unwrapped(hash)?
            .ok_or(VaultError::TxNotFound(*hash))?;
        session.tx_info(&record)
    }

    /// Ingests an externally observed transaction. Returns `None` when the
    /// transaction does not touch this vault (nothing is persisted).
    pub fn insert_tx(
        &self,
        tx: &Transaction,
        status: Option<TxStatus>,
    ) -> Result<Option<TxInfo>, VaultError> {
        log_trace!(
            "Vault::insert_tx(hash {}, unsigned {})",
            to_hex(&tx.txid()),
            to_hex(&tx.unsigned_txid())
        );
        let mut state = self.lock_state();
        let mut session = Session::new(self.store.as_ref(), &mut state);
        let inserted = session.insert_tx_unwrapped(tx, status, current_unix_seconds())?;
        match inserted {
            Some(record) => {
                let info = session.tx_info(&record)?;
                session.commit()?;
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }

    /// Builds (and optionally inserts) a spend from `account`.
    #[allow(clippy::too_many_arguments)]
    pub fn create_tx(
        &self,
        account_name: &str,
        version: u32,
        lock_time: u32,
        recipients: &[Recipient],
        fee: u64,
        max_change_outs: u32,
        insert: bool,
    ) -> Result<TxInfo, VaultError> {
        log_trace!(
            "Vault::create_tx({account_name}, {version}, {lock_time}, {} recipient(s), {fee}, {insert})",
            recipients.len()
        );
        let mut state = self.lock_state();
        let mut session = Session::new(self.store.as_ref(), &mut state);
        let wire = session.create_tx_unwrapped(
            account_name,
            version,
            lock_time,
            recipients,
            fee,
            max_change_outs,
        )?;
        if insert {
            let inserted = session
                .insert_tx_unwrapped(&wire, None, current_unix_seconds())?
                .ok_or_else(|| {
                    VaultError::InvariantViolation(
                        "created transaction does not touch its own vault".to_string(),
                    )
                })?;
            let info = session.tx_info(&inserted)?;
            session.commit()?;
            return Ok(info);
        }
        Ok(TxInfo {
            hash: wire.txid(),
            unsigned_hash: wire.unsigned_txid(),
            status: TxStatus::Unsigned,
            fee: 0,
            timestamp: current_unix_seconds(),
            block_hash: None,
            height: None,
            raw: wire.consensus_encode(),
        })
    }

    /// Adds whatever signatures the unlocked keychains can contribute.
    /// Returns false when no signature was added; persists only when
    /// `update` is set.
    pub fn sign_tx(&self, unsigned_hash: &Hash256, update: bool) -> Result<bool, VaultError> {
        log_trace!("Vault::sign_tx({}, {update})", to_hex(unsigned_hash));
        let mut state = self.lock_state();
        let mut session = Session::new(self.store.as_ref(), &mut state);
        let signed = session.sign_tx_unwrapped(unsigned_hash)?;
        if signed && update {
            session.commit()?;
        }
        Ok(signed)
    }

    /// Deletes a transaction and, recursively, everything spending it.
    pub fn delete_tx(&self, hash: &Hash256) -> Result<(), VaultError> {
        log_trace!("Vault::delete_tx({})", to_hex(hash));
        let mut state = self.lock_state();
        let mut session = Session::new(self.store.as_ref(), &mut state);
        let record = session
            .get_tx_unwrapped(hash)?
            .ok_or(VaultError::TxNotFound(*hash))?;
        session.delete_tx_unwrapped(&record)?;
        session.commit()
    }

    pub fn signing_request(
        &self,
        unsigned_hash: &Hash256,
        include_raw: bool,
    ) -> Result<SigningRequest, VaultError> {
        log_trace!("Vault::signing_request({})", to_hex(unsigned_hash));
        let mut state = self.lock_state();
        let session = Session::new(self.store.as_ref(), &mut state);
        session.signing_request_unwrapped(unsigned_hash, include_raw)
    }

    ///////////////////////////
    // BLOCKCHAIN OPERATIONS //
    ///////////////////////////

    /// Connects a merkle block at `height`, reorganizing away any stored
    /// suffix at or above it. Returns false when the block was refused.
    pub fn insert_merkle_block(
        &self,
        merkle_block: &MerkleBlock,
        height: u32,
    ) -> Result<bool, VaultError> {
        log_trace!(
            "Vault::insert_merkle_block({}, {height})",
            to_hex(&merkle_block.header.hash())
        );
        let mut state = self.lock_state();
        let mut session = Session::new(self.store.as_ref(), &mut state);
        let inserted = session.insert_merkle_block_unwrapped(merkle_block, height)?;
        if inserted {
            session.commit()?;
        }
        Ok(inserted)
    }
}

fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<(), VaultError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    if fs::rename(&tmp, path).is_err() {
        let _ = fs::remove_file(path);
        fs::rename(&tmp, path)?;
    }
    Ok(())
}
