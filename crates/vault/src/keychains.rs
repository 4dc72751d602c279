//! Keychain operations.

use std::collections::{BTreeSet, HashMap};

use vaultd_keychain::{extkey, SealedSecret, Secret};
use vaultd_log::log_debug;
use vaultd_primitives::Hash256;
use vaultd_storage::Column;

use crate::blob;
use crate::error::VaultError;
use crate::model::{AccountRecord, KeychainRecord};
use crate::session::Session;

impl Session<'_> {
    pub fn keychain_exists_unwrapped(&self, name: &str) -> Result<bool, VaultError> {
        Ok(self.txn.get(Column::KeychainName, name.as_bytes())?.is_some())
    }

    pub fn get_keychain_unwrapped(&self, name: &str) -> Result<KeychainRecord, VaultError> {
        let hash = self
            .txn
            .get(Column::KeychainName, name.as_bytes())?
            .ok_or_else(|| VaultError::KeychainNotFound(name.to_string()))?;
        let hash: Hash256 = hash.as_slice().try_into().map_err(|_| {
            VaultError::InvariantViolation("malformed keychain name index entry".to_string())
        })?;
        self.load_keychain_by_hash(&hash)?
            .ok_or_else(|| VaultError::KeychainNotFound(name.to_string()))
    }

    pub fn new_keychain_unwrapped(
        &mut self,
        name: &str,
        entropy: &Secret,
        chain_code_lock_key: &Secret,
        salt: &[u8],
    ) -> Result<KeychainRecord, VaultError> {
        if self.keychain_exists_unwrapped(name)? {
            return Err(VaultError::KeychainAlreadyExists(name.to_string()));
        }

        let (privkey, chain_code) = extkey::master_from_entropy(entropy)?;
        let pubkey = extkey::pubkey_for(&privkey)?;
        let sealed_chain_code =
            SealedSecret::seal_with_salt(&chain_code, chain_code_lock_key, salt)?;
        // The private key starts out sealed under the same lock key; its
        // seal is independent and stays valid if the chain-code key is ever
        // rotated.
        let sealed_privkey = SealedSecret::seal(&privkey, chain_code_lock_key)?;

        let record = KeychainRecord {
            hash: KeychainRecord::content_hash(&pubkey, 0, 0, 0),
            name: name.to_string(),
            depth: 0,
            parent_fingerprint: 0,
            child_number: 0,
            pubkey,
            chain_code: sealed_chain_code,
            privkey: Some(sealed_privkey),
            parent: None,
        };
        self.store_keychain(&record);
        Ok(record)
    }

    pub fn rename_keychain_unwrapped(&mut self, old: &str, new: &str) -> Result<(), VaultError> {
        let mut record = self.get_keychain_unwrapped(old)?;
        if old == new {
            return Ok(());
        }
        if self.keychain_exists_unwrapped(new)? {
            return Err(VaultError::KeychainAlreadyExists(new.to_string()));
        }
        self.txn.delete(Column::KeychainName, old.as_bytes().to_vec());
        record.name = new.to_string();
        self.store_keychain(&record);
        Ok(())
    }

    pub fn unlock_chain_code_unwrapped(
        &mut self,
        name: &str,
        unlock_key: &Secret,
    ) -> Result<(), VaultError> {
        let record = self.get_keychain_unwrapped(name)?;
        record
            .chain_code
            .unseal(unlock_key)
            .map_err(|_| VaultError::KeychainChainCodeUnlockFailed(name.to_string()))?;
        self.locks
            .chain_code_keys
            .insert(name.to_string(), unlock_key.clone());
        Ok(())
    }

    pub fn unlock_private_key_unwrapped(
        &mut self,
        name: &str,
        unlock_key: &Secret,
    ) -> Result<(), VaultError> {
        let record = self.get_keychain_unwrapped(name)?;
        let sealed = record
            .privkey
            .as_ref()
            .ok_or_else(|| VaultError::KeychainIsNotPrivate(name.to_string()))?;
        sealed
            .unseal(unlock_key)
            .map_err(|_| VaultError::KeychainPrivateKeyUnlockFailed(name.to_string()))?;
        self.locks
            .private_keys
            .insert(name.to_string(), unlock_key.clone());
        Ok(())
    }

    /// Chain-code plaintext through the unlock cache. `Ok(None)` when no key
    /// is cached; a cached key that no longer decrypts is an error.
    pub fn cached_chain_code(
        &mut self,
        record: &KeychainRecord,
    ) -> Result<Option<Secret>, VaultError> {
        let Some(unlock_key) = self.locks.chain_code_keys.get(&record.name) else {
            return Ok(None);
        };
        match record.chain_code.unseal(unlock_key) {
            Ok(chain_code) => Ok(Some(chain_code)),
            Err(_) => Err(VaultError::KeychainChainCodeUnlockFailed(
                record.name.clone(),
            )),
        }
    }

    /// Private-key plaintext through the unlock cache, same contract as
    /// `cached_chain_code`.
    pub fn cached_private_key(
        &mut self,
        record: &KeychainRecord,
    ) -> Result<Option<Secret>, VaultError> {
        let Some(sealed) = record.privkey.as_ref() else {
            return Ok(None);
        };
        let Some(unlock_key) = self.locks.private_keys.get(&record.name) else {
            return Ok(None);
        };
        match sealed.unseal(unlock_key) {
            Ok(privkey) => Ok(Some(privkey)),
            Err(_) => Err(VaultError::KeychainPrivateKeyUnlockFailed(
                record.name.clone(),
            )),
        }
    }

    /// Unseals every member keychain's chain code via the unlock cache.
    /// Cached keys that fail to decrypt are dropped from the cache and the
    /// keychain counts as locked.
    pub fn unlock_account_chain_codes(
        &mut self,
        account: &AccountRecord,
    ) -> Result<HashMap<Hash256, Secret>, VaultError> {
        let mut chain_codes = HashMap::new();
        let mut locked = BTreeSet::new();
        for keychain_hash in &account.keychain_hashes {
            let record = self.load_keychain_by_hash(keychain_hash)?.ok_or_else(|| {
                VaultError::InvariantViolation(format!(
                    "account {} references a missing keychain",
                    account.name
                ))
            })?;
            let cached_key = self.locks.chain_code_keys.get(&record.name).cloned();
            match cached_key {
                None => {
                    locked.insert(record.name.clone());
                }
                Some(unlock_key) => match record.chain_code.unseal(&unlock_key) {
                    Ok(chain_code) => {
                        chain_codes.insert(*keychain_hash, chain_code);
                    }
                    Err(_) => {
                        self.locks.chain_code_keys.remove(&record.name);
                        locked.insert(record.name.clone());
                    }
                },
            }
        }
        if !locked.is_empty() {
            return Err(VaultError::AccountChainCodeLocked {
                account: account.name.clone(),
                locked,
            });
        }
        Ok(chain_codes)
    }

    pub fn export_keychain_unwrapped(
        &self,
        name: &str,
        with_privkeys: bool,
    ) -> Result<String, VaultError> {
        let mut record = self.get_keychain_unwrapped(name)?;
        if with_privkeys && !record.is_private() {
            return Err(VaultError::KeychainIsNotPrivate(name.to_string()));
        }
        if !with_privkeys {
            record.privkey = None;
        }
        Ok(blob::encode_keychain_blob(&record))
    }

    /// Imports a keychain archive. An existing keychain with the same
    /// content hash absorbs private material from a private archive (the
    /// private-key upgrade); any other collision is an error. Name clashes
    /// resolve by numeric suffix.
    pub fn import_keychain_unwrapped(
        &mut self,
        text: &str,
        want_privkeys: bool,
    ) -> Result<KeychainRecord, VaultError> {
        let mut incoming = blob::decode_keychain_blob(text)?;
        if !want_privkeys {
            incoming.privkey = None;
        }

        if let Some(mut stored) = self.load_keychain_by_hash(&incoming.hash)? {
            if incoming.is_private() && !stored.is_private() {
                log_debug!(
                    "Vault::import_keychain - upgrading keychain {} to private",
                    stored.name
                );
                stored.privkey = incoming.privkey;
                self.store_keychain(&stored);
                return Ok(stored);
            }
            return Err(VaultError::KeychainAlreadyExists(stored.name));
        }

        let base_name = incoming.name.clone();
        let mut append_num = 1u32;
        while self.keychain_exists_unwrapped(&incoming.name)? {
            incoming.name = format!("{base_name}{append_num}");
            append_num += 1;
        }

        self.store_keychain(&incoming);
        Ok(incoming)
    }
}
