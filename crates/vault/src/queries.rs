//! The logical query views the façade exposes: balances, signing-script and
//! txout listings, and row summaries.

use std::collections::HashMap;

use vaultd_primitives::Hash256;
use vaultd_storage::Column;

use crate::error::VaultError;
use crate::model::{
    AccountRecord, HeaderRecord, KeychainRecord, ScriptStatus, SigningScriptRecord, TxOutStatus,
    TxRecord, TxStatus, ALL_WILDCARD,
};
use crate::session::Session;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeychainInfo {
    pub name: String,
    pub hash: Hash256,
    pub is_private: bool,
    pub depth: u8,
    pub child_number: u32,
    pub parent_fingerprint: u32,
}

impl KeychainInfo {
    pub(crate) fn from_record(record: &KeychainRecord) -> Self {
        Self {
            name: record.name.clone(),
            hash: record.hash,
            is_private: record.is_private(),
            depth: record.depth,
            child_number: record.child_number,
            parent_fingerprint: record.parent_fingerprint,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountInfo {
    pub name: String,
    pub hash: Hash256,
    pub min_sigs: u32,
    pub keychain_names: Vec<String>,
    pub unused_pool_size: u32,
    pub time_created: u32,
    pub bin_names: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningScriptEntry {
    pub account_name: String,
    pub bin_name: String,
    pub index: u32,
    pub status: ScriptStatus,
    pub label: String,
    pub txin_script: Vec<u8>,
    pub txout_script: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOutEntry {
    pub receiving_account: Option<String>,
    pub sending_account: Option<String>,
    pub bin_name: Option<String>,
    pub value: u64,
    pub script: Vec<u8>,
    pub status: TxOutStatus,
    pub tx_status: TxStatus,
    pub txid: Hash256,
    pub unsigned_hash: Hash256,
    pub height: Option<u32>,
    pub timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxInfo {
    pub hash: Hash256,
    pub unsigned_hash: Hash256,
    pub status: TxStatus,
    pub fee: u64,
    pub timestamp: u64,
    pub block_hash: Option<Hash256>,
    pub height: Option<u32>,
    pub raw: Vec<u8>,
}

impl Session<'_> {
    pub fn all_keychain_infos_unwrapped(&self) -> Result<Vec<KeychainInfo>, VaultError> {
        let mut infos = Vec::new();
        for (_, bytes) in self.txn.scan_prefix(Column::Keychain, &[])? {
            infos.push(KeychainInfo::from_record(&KeychainRecord::decode(&bytes)?));
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    pub fn account_info_unwrapped(&self, name: &str) -> Result<AccountInfo, VaultError> {
        let account = self.get_account_unwrapped(name)?;
        self.account_info_for(&account)
    }

    pub fn all_account_infos_unwrapped(&self) -> Result<Vec<AccountInfo>, VaultError> {
        let mut infos = Vec::new();
        for (_, bytes) in self.txn.scan_prefix(Column::Account, &[])? {
            let account = AccountRecord::decode(&bytes)?;
            infos.push(self.account_info_for(&account)?);
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    fn account_info_for(&self, account: &AccountRecord) -> Result<AccountInfo, VaultError> {
        let mut keychain_names = Vec::with_capacity(account.keychain_hashes.len());
        for hash in &account.keychain_hashes {
            let keychain = self.load_keychain_by_hash(hash)?.ok_or_else(|| {
                VaultError::InvariantViolation(format!(
                    "account {} references a missing keychain",
                    account.name
                ))
            })?;
            keychain_names.push(keychain.name);
        }
        let bin_names = self
            .scan_bins(&account.hash)?
            .into_iter()
            .map(|bin| bin.name)
            .collect();
        Ok(AccountInfo {
            name: account.name.clone(),
            hash: account.hash,
            min_sigs: account.min_sigs,
            keychain_names,
            unused_pool_size: account.unused_pool_size,
            time_created: account.time_created,
            bin_names,
        })
    }

    /// Sum of UNSPENT output values received by `account` over transactions
    /// whose status is in `tx_statuses`, optionally restricted to outputs
    /// with at least `min_confirmations` confirmations.
    pub fn account_balance_unwrapped(
        &self,
        account_name: &str,
        min_confirmations: u32,
        tx_statuses: &[TxStatus],
    ) -> Result<u64, VaultError> {
        let account = self.get_account_unwrapped(account_name)?;
        let best_height = if min_confirmations > 0 {
            let best = self.best_height_unwrapped()?;
            if min_confirmations > best {
                return Ok(0);
            }
            Some(best)
        } else {
            None
        };

        let mut balance = 0u64;
        for (_, bytes) in self.txn.scan_prefix(Column::Tx, &[])? {
            let record = TxRecord::decode(&bytes)?;
            if !tx_statuses.contains(&record.status) {
                continue;
            }
            if let Some(best) = best_height {
                let Some(height) = self.tx_height(&record)? else {
                    continue;
                };
                if height > best + 1 - min_confirmations {
                    continue;
                }
            }
            for output in &record.outputs {
                if output.status != TxOutStatus::Unspent {
                    continue;
                }
                let Some((owner, _, _)) = &output.signing_script else {
                    continue;
                };
                if *owner == account.hash {
                    balance = balance.saturating_add(output.value);
                }
            }
        }
        Ok(balance)
    }

    /// `SigningScriptView`: account/bin filters (`@all` wildcard), status
    /// set, ordered by `(account, bin, status DESC, index ASC)`.
    pub fn signing_script_entries_unwrapped(
        &self,
        account_name: &str,
        bin_name: &str,
        statuses: &[ScriptStatus],
    ) -> Result<Vec<SigningScriptEntry>, VaultError> {
        let accounts = self.filter_accounts(account_name)?;
        let mut entries = Vec::new();
        for account in &accounts {
            let scripts: Vec<SigningScriptRecord> = if bin_name == ALL_WILDCARD {
                let mut all = Vec::new();
                for (_, bytes) in self.txn.scan_prefix(Column::Script, &account.hash)? {
                    all.push(SigningScriptRecord::decode(&bytes)?);
                }
                all
            } else {
                self.scan_bin_scripts(&account.hash, bin_name)?
            };
            for script in scripts {
                if !statuses.contains(&script.status) {
                    continue;
                }
                entries.push(SigningScriptEntry {
                    account_name: account.name.clone(),
                    bin_name: script.bin_name,
                    index: script.index,
                    status: script.status,
                    label: script.label,
                    txin_script: script.txin_script,
                    txout_script: script.txout_script,
                });
            }
        }
        entries.sort_by(|a, b| {
            a.account_name
                .cmp(&b.account_name)
                .then_with(|| a.bin_name.cmp(&b.bin_name))
                .then_with(|| b.status.cmp(&a.status))
                .then_with(|| a.index.cmp(&b.index))
        });
        Ok(entries)
    }

    /// `TxOutView`: vault-related outputs with account/bin/status filters,
    /// newest first.
    pub fn tx_out_entries_unwrapped(
        &self,
        account_name: &str,
        bin_name: &str,
        txout_statuses: &[TxOutStatus],
        tx_statuses: &[TxStatus],
    ) -> Result<Vec<TxOutEntry>, VaultError> {
        let mut account_names: HashMap<Hash256, String> = HashMap::new();
        let mut entries = Vec::new();

        for (_, bytes) in self.txn.scan_prefix(Column::Tx, &[])? {
            let record = TxRecord::decode(&bytes)?;
            if !tx_statuses.contains(&record.status) {
                continue;
            }
            let height = self.tx_height(&record)?;
            for output in &record.outputs {
                if !txout_statuses.contains(&output.status) {
                    continue;
                }
                let receiving = match &output.signing_script {
                    Some((owner, _, _)) => {
                        Some(self.account_name_cached(owner, &mut account_names)?)
                    }
                    None => None,
                };
                let sending = match &output.sending_account {
                    Some(owner) => Some(self.account_name_cached(owner, &mut account_names)?),
                    None => None,
                };
                if receiving.is_none() && sending.is_none() {
                    continue;
                }

                if account_name != ALL_WILDCARD {
                    let matches = receiving.as_deref() == Some(account_name)
                        || sending.as_deref() == Some(account_name);
                    if !matches {
                        continue;
                    }
                }
                let out_bin = output
                    .signing_script
                    .as_ref()
                    .map(|(_, bin, _)| bin.clone());
                if bin_name != ALL_WILDCARD && out_bin.as_deref() != Some(bin_name) {
                    continue;
                }

                entries.push(TxOutEntry {
                    receiving_account: receiving,
                    sending_account: sending,
                    bin_name: out_bin,
                    value: output.value,
                    script: output.script.clone(),
                    status: output.status,
                    tx_status: record.status,
                    txid: record.hash,
                    unsigned_hash: record.unsigned_hash,
                    height,
                    timestamp: record.timestamp,
                });
            }
        }

        entries.sort_by(|a, b| {
            let height_a = a.height.unwrap_or(u32::MAX);
            let height_b = b.height.unwrap_or(u32::MAX);
            height_b
                .cmp(&height_a)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
                .then_with(|| b.unsigned_hash.cmp(&a.unsigned_hash))
        });
        Ok(entries)
    }

    pub fn tx_info(&self, record: &TxRecord) -> Result<TxInfo, VaultError> {
        Ok(TxInfo {
            hash: record.hash,
            unsigned_hash: record.unsigned_hash,
            status: record.status,
            fee: record.fee,
            timestamp: record.timestamp,
            block_hash: record.block_hash,
            height: self.tx_height(record)?,
            raw: record.to_wire().consensus_encode(),
        })
    }

    fn tx_height(&self, record: &TxRecord) -> Result<Option<u32>, VaultError> {
        let Some(block_hash) = record.block_hash else {
            return Ok(None);
        };
        match self.txn.get(Column::Header, &block_hash)? {
            Some(bytes) => Ok(Some(HeaderRecord::decode(&bytes)?.height)),
            None => Ok(None),
        }
    }

    fn filter_accounts(&self, account_name: &str) -> Result<Vec<AccountRecord>, VaultError> {
        if account_name == ALL_WILDCARD {
            let mut accounts = Vec::new();
            for (_, bytes) in self.txn.scan_prefix(Column::Account, &[])? {
                accounts.push(AccountRecord::decode(&bytes)?);
            }
            accounts.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(accounts)
        } else {
            Ok(vec![self.get_account_unwrapped(account_name)?])
        }
    }

    fn account_name_cached(
        &self,
        hash: &Hash256,
        cache: &mut HashMap<Hash256, String>,
    ) -> Result<String, VaultError> {
        if let Some(name) = cache.get(hash) {
            return Ok(name.clone());
        }
        let account = self.load_account_by_hash(hash)?.ok_or_else(|| {
            VaultError::InvariantViolation("txout references a missing account".to_string())
        })?;
        cache.insert(*hash, account.name.clone());
        Ok(account.name)
    }
}
