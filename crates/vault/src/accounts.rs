//! Account, bin, and address-pool operations.

use std::collections::HashMap;

use vaultd_keychain::{extkey, SealedSecret, Secret};
use vaultd_log::log_debug;
use vaultd_primitives::Hash256;
use vaultd_script::{multisig_redeem_script, InputScript};
use vaultd_storage::Column;

use crate::blob;
use crate::error::VaultError;
use crate::model::{
    script_key, AccountRecord, BinRecord, KeyLocator, ScriptKeyRef, ScriptStatus,
    SigningScriptRecord, CHANGE_BIN_NAME, DEFAULT_BIN_NAME,
};
use crate::session::Session;

impl Session<'_> {
    pub fn account_exists_unwrapped(&self, name: &str) -> Result<bool, VaultError> {
        Ok(self.txn.get(Column::AccountName, name.as_bytes())?.is_some())
    }

    pub fn get_account_unwrapped(&self, name: &str) -> Result<AccountRecord, VaultError> {
        let hash = self
            .txn
            .get(Column::AccountName, name.as_bytes())?
            .ok_or_else(|| VaultError::AccountNotFound(name.to_string()))?;
        let hash: Hash256 = hash.as_slice().try_into().map_err(|_| {
            VaultError::InvariantViolation("malformed account name index entry".to_string())
        })?;
        self.load_account_by_hash(&hash)?
            .ok_or_else(|| VaultError::AccountNotFound(name.to_string()))
    }

    pub fn get_bin_unwrapped(
        &self,
        account_name: &str,
        bin_name: &str,
    ) -> Result<(AccountRecord, BinRecord), VaultError> {
        let account = self.get_account_unwrapped(account_name)?;
        let bin = self
            .load_bin(&account.hash, bin_name)?
            .ok_or_else(|| VaultError::AccountBinNotFound {
                account: account_name.to_string(),
                bin: bin_name.to_string(),
            })?;
        Ok((account, bin))
    }

    pub fn scan_bins(&self, account: &Hash256) -> Result<Vec<BinRecord>, VaultError> {
        let mut bins = Vec::new();
        for (_, bytes) in self.txn.scan_prefix(Column::Bin, account)? {
            bins.push(BinRecord::decode(&bytes)?);
        }
        bins.sort_by_key(|bin| bin.bin_index);
        Ok(bins)
    }

    pub fn scan_bin_scripts(
        &self,
        account: &Hash256,
        bin_name: &str,
    ) -> Result<Vec<SigningScriptRecord>, VaultError> {
        let prefix = crate::model::script_prefix(account, bin_name);
        let mut scripts = Vec::new();
        for (_, bytes) in self.txn.scan_prefix(Column::Script, &prefix)? {
            scripts.push(SigningScriptRecord::decode(&bytes)?);
        }
        Ok(scripts)
    }

    pub fn count_unused_scripts(
        &self,
        account: &Hash256,
        bin_name: &str,
    ) -> Result<u32, VaultError> {
        let mut count = 0u32;
        for script in self.scan_bin_scripts(account, bin_name)? {
            if script.status == ScriptStatus::Unused {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn new_account_unwrapped(
        &mut self,
        name: &str,
        min_sigs: u32,
        keychain_names: &[String],
        unused_pool_size: u32,
        time_created: u32,
    ) -> Result<AccountRecord, VaultError> {
        if self.account_exists_unwrapped(name)? {
            return Err(VaultError::AccountAlreadyExists(name.to_string()));
        }

        let mut keychain_hashes = Vec::with_capacity(keychain_names.len());
        for keychain_name in keychain_names {
            keychain_hashes.push(self.get_keychain_unwrapped(keychain_name)?.hash);
        }
        keychain_hashes.sort();
        keychain_hashes.dedup();
        if min_sigs == 0 || min_sigs as usize > keychain_hashes.len() {
            return Err(VaultError::InvariantViolation(format!(
                "invalid signature policy {min_sigs} of {}",
                keychain_hashes.len()
            )));
        }

        let mut account = AccountRecord {
            hash: AccountRecord::content_hash(min_sigs, &keychain_hashes),
            name: name.to_string(),
            min_sigs,
            keychain_hashes,
            unused_pool_size,
            time_created,
            bin_count: 0,
        };
        let chain_codes = self.unlock_account_chain_codes(&account)?;
        self.store_account(&account);

        // The change bin must exist before any external issuance can run;
        // it is always bin 0, the default bin is bin 1.
        let mut change_bin = create_bin(&mut account, CHANGE_BIN_NAME);
        let mut default_bin = create_bin(&mut account, DEFAULT_BIN_NAME);

        for _ in 0..unused_pool_size {
            self.generate_signing_script(
                &account,
                &mut change_bin,
                &chain_codes,
                ScriptStatus::Unused,
            )?;
            self.generate_signing_script(
                &account,
                &mut default_bin,
                &chain_codes,
                ScriptStatus::Unused,
            )?;
        }
        self.store_bin(&change_bin);
        self.store_bin(&default_bin);
        self.store_account(&account);
        Ok(account)
    }

    pub fn rename_account_unwrapped(&mut self, old: &str, new: &str) -> Result<(), VaultError> {
        let mut account = self.get_account_unwrapped(old)?;
        if old == new {
            return Ok(());
        }
        if self.account_exists_unwrapped(new)? {
            return Err(VaultError::AccountAlreadyExists(new.to_string()));
        }
        self.txn.delete(Column::AccountName, old.as_bytes().to_vec());
        account.name = new.to_string();
        self.store_account(&account);
        Ok(())
    }

    pub fn add_account_bin_unwrapped(
        &mut self,
        account_name: &str,
        bin_name: &str,
    ) -> Result<BinRecord, VaultError> {
        if bin_name.is_empty() || bin_name.starts_with('@') || bin_name.len() > 255 {
            return Err(VaultError::AccountBinInvalidName(bin_name.to_string()));
        }
        let mut account = self.get_account_unwrapped(account_name)?;
        if self.load_bin(&account.hash, bin_name)?.is_some() {
            return Err(VaultError::AccountBinAlreadyExists {
                account: account_name.to_string(),
                bin: bin_name.to_string(),
            });
        }
        let chain_codes = self.unlock_account_chain_codes(&account)?;

        let mut bin = create_bin(&mut account, bin_name);
        for _ in 0..account.unused_pool_size {
            self.generate_signing_script(&account, &mut bin, &chain_codes, ScriptStatus::Unused)?;
        }
        self.store_bin(&bin);
        self.store_account(&account);
        Ok(bin)
    }

    /// Tops the bin's UNUSED pool back up to the account's target depth.
    /// Requires every member chain code to be unlockable.
    pub fn refill_bin_pool(
        &mut self,
        account: &AccountRecord,
        bin: &mut BinRecord,
    ) -> Result<(), VaultError> {
        let chain_codes = self.unlock_account_chain_codes(account)?;
        let unused = self.count_unused_scripts(&account.hash, &bin.name)?;
        for _ in unused..account.unused_pool_size {
            self.generate_signing_script(account, bin, &chain_codes, ScriptStatus::Unused)?;
        }
        self.store_bin(bin);
        Ok(())
    }

    pub fn refill_account_pool_unwrapped(&mut self, account_name: &str) -> Result<(), VaultError> {
        let account = self.get_account_unwrapped(account_name)?;
        for mut bin in self.scan_bins(&account.hash)? {
            self.refill_bin_pool(&account, &mut bin)?;
        }
        Ok(())
    }

    pub fn issue_signing_script_unwrapped(
        &mut self,
        account_name: &str,
        bin_name: &str,
        label: &str,
    ) -> Result<SigningScriptRecord, VaultError> {
        let (account, mut bin) = self.get_bin_unwrapped(account_name, bin_name)?;
        if bin.is_change() {
            return Err(VaultError::AccountCannotIssueChangeScript(account.name));
        }
        self.issue_script_in_bin(&account, &mut bin, label)
    }

    /// Issues the smallest-index UNUSED script of the bin. The pool refill
    /// is best effort: a locked chain code is absorbed, the bin just keeps
    /// handing out what it has.
    pub fn issue_script_in_bin(
        &mut self,
        account: &AccountRecord,
        bin: &mut BinRecord,
        label: &str,
    ) -> Result<SigningScriptRecord, VaultError> {
        match self.refill_bin_pool(account, bin) {
            Err(VaultError::AccountChainCodeLocked { .. }) => {
                log_debug!(
                    "Vault::issue_signing_script({}::{}) - chain code locked, pool not replenished",
                    account.name,
                    bin.name
                );
            }
            other => other?,
        }

        let mut script = self
            .scan_bin_scripts(&account.hash, &bin.name)?
            .into_iter()
            .find(|script| script.status == ScriptStatus::Unused)
            .ok_or_else(|| VaultError::AccountBinOutOfScripts {
                account: account.name.clone(),
                bin: bin.name.clone(),
            })?;
        script.label = label.to_string();
        script.status = ScriptStatus::Issued;
        self.store_script(&script);
        self.store_bin(bin);
        Ok(script)
    }

    /// Derives the next pool entry of `bin`: one child key per account
    /// keychain at `(bin_index, next_script_index)`, sorted-pubkey multisig
    /// redeem script, P2SH txoutscript, placeholder txinscript template.
    pub fn generate_signing_script(
        &mut self,
        account: &AccountRecord,
        bin: &mut BinRecord,
        chain_codes: &HashMap<Hash256, Secret>,
        status: ScriptStatus,
    ) -> Result<SigningScriptRecord, VaultError> {
        let index = bin.next_script_index;
        let mut keys = Vec::with_capacity(account.keychain_hashes.len());
        for keychain_hash in &account.keychain_hashes {
            let keychain = self.load_keychain_by_hash(keychain_hash)?.ok_or_else(|| {
                VaultError::InvariantViolation(format!(
                    "account {} references a missing keychain",
                    account.name
                ))
            })?;
            let chain_code = chain_codes.get(keychain_hash).ok_or_else(|| {
                VaultError::InvariantViolation(format!(
                    "no chain code available for keychain {}",
                    keychain.name
                ))
            })?;
            let (bin_pubkey, bin_chain_code) =
                extkey::derive_child_pubkey(&keychain.pubkey, chain_code, bin.bin_index)?;
            let (script_pubkey, _) =
                extkey::derive_child_pubkey(&bin_pubkey, &bin_chain_code, index)?;
            keys.push(ScriptKeyRef {
                pubkey: script_pubkey,
                keychain: *keychain_hash,
            });
        }
        keys.sort_by(|a, b| a.pubkey.cmp(&b.pubkey));

        let pubkeys: Vec<Vec<u8>> = keys.iter().map(|key| key.pubkey.clone()).collect();
        let redeem = multisig_redeem_script(account.min_sigs as usize, &pubkeys)?;
        let template = InputScript::from_redeem_script(&redeem)?;

        let record = SigningScriptRecord {
            account: account.hash,
            bin_name: bin.name.clone(),
            index,
            status,
            label: String::new(),
            txin_script: template.edit_script(),
            txout_script: template.txout_script(),
            keys: keys.clone(),
        };
        self.store_script(&record);
        self.txn.put(
            Column::ScriptByOut,
            record.txout_script.clone(),
            script_key(&account.hash, &bin.name, index),
        );
        for key in &keys {
            let locator = KeyLocator {
                keychain: key.keychain,
                bin_index: bin.bin_index,
                script_index: index,
            };
            self.txn
                .put(Column::KeyByPubkey, key.pubkey.clone(), locator.encode());
        }

        bin.next_script_index += 1;
        Ok(record)
    }

    pub fn export_account_unwrapped(
        &mut self,
        account_name: &str,
        chain_code_lock_key: &Secret,
        salt: &[u8],
        with_privkeys: bool,
    ) -> Result<String, VaultError> {
        let account = self.get_account_unwrapped(account_name)?;
        let chain_codes = self.unlock_account_chain_codes(&account)?;

        // Every member chain code is re-sealed under the single archive lock
        // key; the stored records are left untouched.
        let mut keychains = Vec::with_capacity(account.keychain_hashes.len());
        for keychain_hash in &account.keychain_hashes {
            let mut keychain = self.load_keychain_by_hash(keychain_hash)?.ok_or_else(|| {
                VaultError::InvariantViolation(format!(
                    "account {} references a missing keychain",
                    account.name
                ))
            })?;
            let chain_code = chain_codes.get(keychain_hash).ok_or_else(|| {
                VaultError::InvariantViolation("chain code missing after unlock".to_string())
            })?;
            keychain.chain_code =
                SealedSecret::seal_with_salt(chain_code, chain_code_lock_key, salt)?;
            if !with_privkeys {
                keychain.privkey = None;
            }
            keychains.push(keychain);
        }

        let bins = self.scan_bins(&account.hash)?;
        Ok(blob::encode_account_blob(&account, &keychains, &bins))
    }

    /// Imports an account archive: reuses stored keychains by content hash
    /// (absorbing private material where the archive carries it), then
    /// re-derives every pool entry per bin — indices below
    /// `next_script_index` with their issued/change status plus the UNUSED
    /// lookahead.
    pub fn import_account_unwrapped(
        &mut self,
        text: &str,
        chain_code_key: &Secret,
        want_privkeys: bool,
    ) -> Result<(AccountRecord, u32), VaultError> {
        let (mut account, keychains, bins) = blob::decode_account_blob(text)?;

        if let Some(stored) = self.load_account_by_hash(&account.hash)? {
            return Err(VaultError::AccountAlreadyExists(stored.name));
        }
        let base_name = account.name.clone();
        let mut append_num = 1u32;
        while self.account_exists_unwrapped(&account.name)? {
            account.name = format!("{base_name}{append_num}");
            append_num += 1;
        }

        let mut privkeys_imported = 0u32;
        let mut chain_codes: HashMap<Hash256, Secret> = HashMap::new();
        for mut keychain in keychains {
            let chain_code = keychain
                .chain_code
                .unseal(chain_code_key)
                .map_err(|_| VaultError::KeychainChainCodeUnlockFailed(keychain.name.clone()))?;
            chain_codes.insert(keychain.hash, chain_code.clone());

            if want_privkeys {
                if keychain.is_private() {
                    privkeys_imported += 1;
                }
            } else {
                keychain.privkey = None;
            }

            if let Some(mut stored) = self.load_keychain_by_hash(&keychain.hash)? {
                // Reuse the stored keychain; re-seal its chain code under
                // the supplied key and upgrade to private if the archive
                // carries what the store lacks.
                stored.chain_code = SealedSecret::seal(&chain_code, chain_code_key)?;
                if keychain.is_private() && !stored.is_private() {
                    stored.privkey = keychain.privkey.clone();
                }
                self.store_keychain(&stored);
                continue;
            }

            let keychain_base = keychain.name.clone();
            let mut keychain_num = 1u32;
            while self.keychain_exists_unwrapped(&keychain.name)? {
                keychain.name = format!("{keychain_base}{keychain_num}");
                keychain_num += 1;
            }
            self.store_keychain(&keychain);
        }

        account.bin_count = bins.len() as u32;
        self.store_account(&account);

        for bin in bins {
            let issued_status = if bin.is_change() {
                ScriptStatus::Change
            } else {
                ScriptStatus::Issued
            };
            let mut rebuilt = BinRecord {
                account: account.hash,
                name: bin.name.clone(),
                bin_index: bin.bin_index,
                next_script_index: 0,
            };
            for _ in 0..bin.next_script_index {
                self.generate_signing_script(&account, &mut rebuilt, &chain_codes, issued_status)?;
            }
            for _ in 0..account.unused_pool_size {
                self.generate_signing_script(
                    &account,
                    &mut rebuilt,
                    &chain_codes,
                    ScriptStatus::Unused,
                )?;
            }
            self.store_bin(&rebuilt);
        }
        self.store_account(&account);
        Ok((account, privkeys_imported))
    }
}

fn create_bin(account: &mut AccountRecord, bin_name: &str) -> BinRecord {
    let bin = BinRecord {
        account: account.hash,
        name: bin_name.to_string(),
        bin_index: account.bin_count,
        next_script_index: 0,
    };
    account.bin_count += 1;
    bin
}
