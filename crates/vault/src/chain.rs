//! Block header chain maintenance: merkle-block insertion, reorgs, and
//! confirmation backfill.

use vaultd_log::log_debug;
use vaultd_primitives::{to_hex, Hash256, MerkleBlock};
use vaultd_storage::Column;

use crate::error::VaultError;
use crate::model::{
    block_tx_key, height_key, HeaderRecord, MerkleBlockRecord, TxStatus, BLOCK_INDEX_UNKNOWN,
    TIME_HORIZON_WINDOW,
};
use crate::session::Session;

impl Session<'_> {
    pub fn best_height_unwrapped(&self) -> Result<u32, VaultError> {
        let entries = self.txn.scan_prefix(Column::HeaderHeight, &[])?;
        let Some((key, _)) = entries.last() else {
            return Ok(0);
        };
        let bytes: [u8; 4] = key.as_slice().try_into().map_err(|_| {
            VaultError::InvariantViolation("malformed height index key".to_string())
        })?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Earliest block timestamp among persisted transactions; `0xffffffff`
    /// when no transaction is confirmed yet, so the first block is always
    /// accepted.
    pub fn horizon_timestamp_unwrapped(&self) -> Result<u32, VaultError> {
        let mut horizon = u32::MAX;
        for (_, bytes) in self.txn.scan_prefix(Column::Tx, &[])? {
            let record = crate::model::TxRecord::decode(&bytes)?;
            let Some(block_hash) = record.block_hash else {
                continue;
            };
            if let Some(header_bytes) = self.txn.get(Column::Header, &block_hash)? {
                let header = HeaderRecord::decode(&header_bytes)?;
                horizon = horizon.min(header.header.time);
            }
        }
        Ok(horizon)
    }

    /// Orphan-horizon refusal, duplicate refusal, reorg of everything at or
    /// above the new height, then connection and confirmation backfill.
    /// Returns false when the block was refused.
    pub fn insert_merkle_block_unwrapped(
        &mut self,
        merkle_block: &MerkleBlock,
        height: u32,
    ) -> Result<bool, VaultError> {
        let block_hash = merkle_block.header.hash();

        let have_prev = self
            .txn
            .get(Column::Header, &merkle_block.header.prev_block)?
            .is_some();
        if !have_prev {
            let horizon = self.horizon_timestamp_unwrapped()? as u64;
            if merkle_block.header.time as u64 + TIME_HORIZON_WINDOW as u64 > horizon {
                return Ok(false);
            }
        }

        if self.txn.get(Column::Header, &block_hash)?.is_some() {
            log_debug!(
                "Vault::insert_merkle_block - already have block {} at height {height}",
                to_hex(&block_hash)
            );
            return Ok(false);
        }

        let Some(matched) = merkle_block.matched_txids() else {
            log_debug!(
                "Vault::insert_merkle_block - invalid merkle proof for {}",
                to_hex(&block_hash)
            );
            return Ok(false);
        };

        // Any stored block at or above the new height means a reorg:
        // disconnect the stale suffix of the chain.
        let stale: Vec<(u32, Hash256)> = self
            .txn
            .scan_prefix(Column::HeaderHeight, &[])?
            .into_iter()
            .filter_map(|(key, value)| {
                let stored_height = u32::from_be_bytes(key.as_slice().try_into().ok()?);
                let stored_hash: Hash256 = value.as_slice().try_into().ok()?;
                (stored_height >= height).then_some((stored_height, stored_hash))
            })
            .collect();
        if !stale.is_empty() {
            log_debug!(
                "Vault::insert_merkle_block - reorganization at height {height}, hash {}",
                to_hex(&block_hash)
            );
            for (stale_height, stale_hash) in stale {
                self.disconnect_block(stale_height, &stale_hash)?;
            }
        }

        log_debug!(
            "Vault::insert_merkle_block - inserting {} at height {height}",
            to_hex(&block_hash)
        );
        let header_record = HeaderRecord {
            header: merkle_block.header,
            height,
        };
        self.txn
            .put(Column::Header, block_hash.to_vec(), header_record.encode());
        self.txn.put(
            Column::HeaderHeight,
            height_key(height).to_vec(),
            block_hash.to_vec(),
        );
        let merkle_record = MerkleBlockRecord {
            merkle: merkle_block.clone(),
            height,
            matched: matched.clone(),
        };
        self.txn
            .put(Column::MerkleBlk, block_hash.to_vec(), merkle_record.encode());

        for txid in &matched {
            self.txn
                .put(Column::MerkleTx, txid.to_vec(), block_hash.to_vec());
            if let Some(unsigned_hash) = self.resolve_txid(txid)? {
                if let Some(mut record) = self.load_tx(&unsigned_hash)? {
                    log_debug!(
                        "Vault::insert_merkle_block - confirming transaction {}",
                        to_hex(txid)
                    );
                    self.connect_tx_to_block(&mut record, &block_hash)?;
                }
            }
        }

        let count = self.update_confirmations_unwrapped(None)?;
        if count > 0 {
            log_debug!("Vault::insert_merkle_block - {count} transaction(s) confirmed");
        }
        Ok(true)
    }

    /// Links every stored transaction without a block to the connected
    /// block that includes it. Covers reconnection after a reorg. Scoped to
    /// one signed txid when `only` is given.
    pub fn update_confirmations_unwrapped(
        &mut self,
        only: Option<Hash256>,
    ) -> Result<u32, VaultError> {
        let mut count = 0u32;
        let candidates: Vec<crate::model::TxRecord> = match only {
            Some(txid) => match self.resolve_txid(&txid)? {
                Some(unsigned_hash) => self.load_tx(&unsigned_hash)?.into_iter().collect(),
                None => Vec::new(),
            },
            None => {
                let mut records = Vec::new();
                for (_, bytes) in self.txn.scan_prefix(Column::Tx, &[])? {
                    records.push(crate::model::TxRecord::decode(&bytes)?);
                }
                records
            }
        };

        for mut record in candidates {
            if record.block_hash.is_some() {
                continue;
            }
            let Some(block_bytes) = self.txn.get(Column::MerkleTx, &record.hash)? else {
                continue;
            };
            let block_hash: Hash256 = block_bytes.as_slice().try_into().map_err(|_| {
                VaultError::InvariantViolation("malformed merkle tx index entry".to_string())
            })?;
            if self.txn.get(Column::Header, &block_hash)?.is_none() {
                continue;
            }
            log_debug!(
                "Vault::update_confirmations - transaction {} confirmed in block {}",
                to_hex(&record.hash),
                to_hex(&block_hash)
            );
            self.connect_tx_to_block(&mut record, &block_hash)?;
            count += 1;
        }
        Ok(count)
    }

    fn connect_tx_to_block(
        &mut self,
        record: &mut crate::model::TxRecord,
        block_hash: &Hash256,
    ) -> Result<(), VaultError> {
        record.block_hash = Some(*block_hash);
        // The merkle-branch position is not computed; the sentinel marks it
        // as unknown.
        record.block_index = BLOCK_INDEX_UNKNOWN;
        record.status = TxStatus::Confirmed;
        self.store_tx(record);
        self.txn.put(
            Column::TxByBlock,
            block_tx_key(block_hash, &record.unsigned_hash).to_vec(),
            Vec::new(),
        );
        Ok(())
    }

    fn disconnect_block(&mut self, height: u32, block_hash: &Hash256) -> Result<(), VaultError> {
        if let Some(bytes) = self.txn.get(Column::MerkleBlk, block_hash)? {
            let record = MerkleBlockRecord::decode(&bytes)?;
            for txid in &record.matched {
                self.txn.delete(Column::MerkleTx, txid.to_vec());
            }
        }
        self.txn.delete(Column::MerkleBlk, block_hash.to_vec());

        for (key, _) in self.txn.scan_prefix(Column::TxByBlock, block_hash)? {
            if key.len() != 64 {
                return Err(VaultError::InvariantViolation(
                    "malformed block tx index key".to_string(),
                ));
            }
            let unsigned_hash: Hash256 = key[32..64]
                .try_into()
                .expect("block tx index key slice length");
            if let Some(mut record) = self.load_tx(&unsigned_hash)? {
                record.block_hash = None;
                record.block_index = BLOCK_INDEX_UNKNOWN;
                if record.status == TxStatus::Confirmed {
                    record.status = TxStatus::Propagated;
                }
                self.store_tx(&record);
            }
            self.txn.delete(Column::TxByBlock, key);
        }

        self.txn.delete(Column::Header, block_hash.to_vec());
        self.txn
            .delete(Column::HeaderHeight, height_key(height).to_vec());
        Ok(())
    }
}
