//! One logical operation's view of the vault: a store transaction plus the
//! process-wide unlock maps, both held under the global mutex.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use vaultd_keychain::Secret;
use vaultd_storage::{Column, KeyValueStore};

use crate::error::VaultError;
use crate::model::{
    bin_key, script_key, AccountRecord, BinRecord, KeychainRecord, SigningScriptRecord, TxRecord,
};
use crate::txn::StoreTxn;
use vaultd_primitives::Hash256;

/// In-memory unlock key caches. Populated by unlock calls, cleared by lock
/// calls or process exit; never persisted.
#[derive(Default)]
pub(crate) struct RuntimeLocks {
    pub chain_code_keys: HashMap<String, Secret>,
    pub private_keys: HashMap<String, Secret>,
}

impl RuntimeLocks {
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) struct Session<'a> {
    pub txn: StoreTxn<'a>,
    pub locks: &'a mut RuntimeLocks,
}

impl<'a> Session<'a> {
    pub fn new(store: &'a dyn KeyValueStore, locks: &'a mut RuntimeLocks) -> Self {
        Self {
            txn: StoreTxn::new(store),
            locks,
        }
    }

    pub fn commit(self) -> Result<(), VaultError> {
        self.txn.commit()?;
        Ok(())
    }

    pub fn load_keychain_by_hash(
        &self,
        hash: &Hash256,
    ) -> Result<Option<KeychainRecord>, VaultError> {
        match self.txn.get(Column::Keychain, hash)? {
            Some(bytes) => Ok(Some(KeychainRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn store_keychain(&mut self, record: &KeychainRecord) {
        self.txn
            .put(Column::Keychain, record.hash.to_vec(), record.encode());
        self.txn.put(
            Column::KeychainName,
            record.name.as_bytes().to_vec(),
            record.hash.to_vec(),
        );
    }

    pub fn load_account_by_hash(
        &self,
        hash: &Hash256,
    ) -> Result<Option<AccountRecord>, VaultError> {
        match self.txn.get(Column::Account, hash)? {
            Some(bytes) => Ok(Some(AccountRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn store_account(&mut self, record: &AccountRecord) {
        self.txn
            .put(Column::Account, record.hash.to_vec(), record.encode());
        self.txn.put(
            Column::AccountName,
            record.name.as_bytes().to_vec(),
            record.hash.to_vec(),
        );
    }

    pub fn load_bin(
        &self,
        account: &Hash256,
        bin_name: &str,
    ) -> Result<Option<BinRecord>, VaultError> {
        match self.txn.get(Column::Bin, &bin_key(account, bin_name))? {
            Some(bytes) => Ok(Some(BinRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn store_bin(&mut self, record: &BinRecord) {
        self.txn.put(
            Column::Bin,
            bin_key(&record.account, &record.name),
            record.encode(),
        );
    }

    pub fn load_script(
        &self,
        account: &Hash256,
        bin_name: &str,
        index: u32,
    ) -> Result<Option<SigningScriptRecord>, VaultError> {
        match self
            .txn
            .get(Column::Script, &script_key(account, bin_name, index))?
        {
            Some(bytes) => Ok(Some(SigningScriptRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn store_script(&mut self, record: &SigningScriptRecord) {
        self.txn.put(
            Column::Script,
            script_key(&record.account, &record.bin_name, record.index),
            record.encode(),
        );
    }

    pub fn load_tx(&self, unsigned_hash: &Hash256) -> Result<Option<TxRecord>, VaultError> {
        match self.txn.get(Column::Tx, unsigned_hash)? {
            Some(bytes) => Ok(Some(TxRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Resolves a signed txid to its row's unsigned-hash key.
    pub fn resolve_txid(&self, txid: &Hash256) -> Result<Option<Hash256>, VaultError> {
        match self.txn.get(Column::TxByHash, txid)? {
            Some(bytes) => {
                let hash: Hash256 = bytes.as_slice().try_into().map_err(|_| {
                    VaultError::InvariantViolation("malformed tx hash index entry".to_string())
                })?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    pub fn store_tx(&mut self, record: &TxRecord) {
        self.txn
            .put(Column::Tx, record.unsigned_hash.to_vec(), record.encode());
        self.txn.put(
            Column::TxByHash,
            record.hash.to_vec(),
            record.unsigned_hash.to_vec(),
        );
    }
}

pub(crate) fn current_unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
