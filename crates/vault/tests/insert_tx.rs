use std::sync::Arc;

use vaultd_core::{
    ScriptStatus, Secret, TxOutStatus, TxStatus, Vault, VaultError, ALL_WILDCARD, CHANGE_BIN_NAME,
    DEFAULT_BIN_NAME,
};
use vaultd_primitives::{Hash256, OutPoint, Transaction, TxIn, TxOut};
use vaultd_storage::memory::MemoryStore;

fn open_vault() -> Vault {
    Vault::open(Arc::new(MemoryStore::new()))
}

fn setup_account(vault: &Vault, account: &str, pool_size: u32) {
    let entropy = Secret::from_slice(&[0x21; 32]);
    let lock_key = Secret::from_slice(b"unit test lock key");
    vault
        .new_keychain("signer", &entropy, &lock_key, &[0x5a; 16])
        .expect("new keychain");
    vault
        .unlock_keychain_chain_code("signer", &lock_key)
        .expect("unlock chain code");
    vault
        .new_account(account, 1, &["signer".to_string()], pool_size, 0)
        .expect("new account");
}

/// A transaction with one foreign (unparseable, hence "complete") input
/// paying `script`.
fn foreign_funding(script: &[u8], value: u64, seed: u8) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint::new([seed; 32], 0),
            script_sig: vec![0x6a],
            sequence: 0xffff_ffff,
        }],
        outputs: vec![TxOut {
            value,
            script_pubkey: script.to_vec(),
        }],
        lock_time: 0,
    }
}

fn spend(
    outpoint: OutPoint,
    txin_template: &[u8],
    outputs: Vec<(Vec<u8>, u64)>,
) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: outpoint,
            script_sig: txin_template.to_vec(),
            sequence: 0xffff_ffff,
        }],
        outputs: outputs
            .into_iter()
            .map(|(script_pubkey, value)| TxOut {
                value,
                script_pubkey,
            })
            .collect(),
        lock_time: 0,
    }
}

fn unused_count(vault: &Vault, account: &str, bin: &str) -> usize {
    vault
        .signing_script_entries(account, bin, &[ScriptStatus::Unused])
        .expect("entries")
        .len()
}

#[test]
fn change_detection_and_fee() {
    let vault = open_vault();
    setup_account(&vault, "spending", 5);

    let external = vault
        .issue_signing_script("spending", DEFAULT_BIN_NAME, "rent")
        .expect("issue");
    let funding = foreign_funding(&external.txout_script, 100_000, 0xaa);
    let funding_info = vault
        .insert_tx(&funding, None)
        .expect("insert")
        .expect("related");
    // Outpoint unknown, fee indeterminate.
    assert_eq!(funding_info.fee, 0);
    assert_eq!(
        vault
            .account_balance("spending", 0, &TxStatus::ALL)
            .expect("balance"),
        100_000
    );

    let second = vault
        .issue_signing_script("spending", DEFAULT_BIN_NAME, "savings")
        .expect("issue");
    let change_entry = vault
        .signing_script_entries("spending", CHANGE_BIN_NAME, &[ScriptStatus::Unused])
        .expect("entries")
        .into_iter()
        .find(|entry| entry.index == 0)
        .expect("change script 0");

    let spend_tx = spend(
        OutPoint::new(funding_info.hash, 0),
        &external.txin_script,
        vec![
            (second.txout_script.clone(), 50_000),
            (change_entry.txout_script.clone(), 40_000),
        ],
    );
    let spend_info = vault
        .insert_tx(&spend_tx, None)
        .expect("insert")
        .expect("related");
    assert_eq!(spend_info.fee, 10_000);

    // External scripts are USED, the change-bin entry is CHANGE.
    let used = vault
        .signing_script_entries("spending", DEFAULT_BIN_NAME, &[ScriptStatus::Used])
        .expect("entries");
    assert_eq!(used.len(), 2);
    let change = vault
        .signing_script_entries("spending", CHANGE_BIN_NAME, &[ScriptStatus::Change])
        .expect("entries");
    assert_eq!(change.len(), 1);
    assert_eq!(change[0].index, 0);

    // Both pools are back at their target depth.
    assert_eq!(unused_count(&vault, "spending", CHANGE_BIN_NAME), 5);
    assert_eq!(unused_count(&vault, "spending", DEFAULT_BIN_NAME), 5);

    // Funding output spent, spend outputs unspent.
    assert_eq!(
        vault
            .account_balance("spending", 0, &TxStatus::ALL)
            .expect("balance"),
        90_000
    );
}

#[test]
fn double_spend_marks_both_conflicting() {
    let vault = open_vault();
    setup_account(&vault, "conflicted", 3);

    let script = vault
        .issue_signing_script("conflicted", DEFAULT_BIN_NAME, "")
        .expect("issue");
    let funding = foreign_funding(&script.txout_script, 80_000, 0xbb);
    let funding_info = vault
        .insert_tx(&funding, None)
        .expect("insert")
        .expect("related");

    let outpoint = OutPoint::new(funding_info.hash, 0);
    let first = spend(outpoint, &script.txin_script, vec![(vec![0x51], 70_000)]);
    let first_info = vault
        .insert_tx(&first, None)
        .expect("insert")
        .expect("related");
    assert_ne!(first_info.status, TxStatus::Conflicting);

    let second = spend(outpoint, &script.txin_script, vec![(vec![0x52], 60_000)]);
    let second_info = vault
        .insert_tx(&second, None)
        .expect("insert")
        .expect("related");
    assert_eq!(second_info.status, TxStatus::Conflicting);
    assert_eq!(
        vault
            .get_tx(&first_info.unsigned_hash)
            .expect("get")
            .status,
        TxStatus::Conflicting
    );
}

#[test]
fn confirmed_transaction_survives_double_spend() {
    let vault = open_vault();
    setup_account(&vault, "settled", 3);

    let script = vault
        .issue_signing_script("settled", DEFAULT_BIN_NAME, "")
        .expect("issue");
    let funding = foreign_funding(&script.txout_script, 80_000, 0xcc);
    let funding_info = vault
        .insert_tx(&funding, None)
        .expect("insert")
        .expect("related");

    let outpoint = OutPoint::new(funding_info.hash, 0);
    let first = spend(outpoint, &script.txin_script, vec![(vec![0x51], 70_000)]);
    let first_info = vault
        .insert_tx(&first, Some(TxStatus::Propagated))
        .expect("insert")
        .expect("related");

    // Confirm the first spend.
    let block = build_merkle_block([0u8; 32], 1_600_000_000, &[first_info.hash], &[true]);
    assert!(vault.insert_merkle_block(&block, 1).expect("connect"));
    assert_eq!(
        vault.get_tx(&first_info.unsigned_hash).expect("get").status,
        TxStatus::Confirmed
    );

    let second = spend(outpoint, &script.txin_script, vec![(vec![0x52], 60_000)]);
    let second_info = vault
        .insert_tx(&second, None)
        .expect("insert")
        .expect("related");
    assert_eq!(second_info.status, TxStatus::Conflicting);
    // The confirmed spend is left alone.
    assert_eq!(
        vault.get_tx(&first_info.unsigned_hash).expect("get").status,
        TxStatus::Confirmed
    );
}

#[test]
fn out_of_order_ingestion_links_spender() {
    let vault = open_vault();
    setup_account(&vault, "ooo", 3);

    let parent_script = vault
        .issue_signing_script("ooo", DEFAULT_BIN_NAME, "")
        .expect("issue");
    let child_script = vault
        .issue_signing_script("ooo", DEFAULT_BIN_NAME, "")
        .expect("issue");

    let parent = foreign_funding(&parent_script.txout_script, 90_000, 0xdd);
    let parent_txid = parent.txid();

    // The child arrives first, referencing the parent's future txid.
    let child = spend(
        OutPoint::new(parent_txid, 0),
        &parent_script.txin_script,
        vec![(child_script.txout_script.clone(), 80_000)],
    );
    let child_info = vault
        .insert_tx(&child, None)
        .expect("insert")
        .expect("related");

    let parent_info = vault
        .insert_tx(&parent, None)
        .expect("insert")
        .expect("related");

    // The parent's output is immediately marked spent by the child.
    let spent = vault
        .tx_out_entries("ooo", ALL_WILDCARD, &[TxOutStatus::Spent], &TxStatus::ALL)
        .expect("entries");
    assert_eq!(spent.len(), 1);
    assert_eq!(spent[0].txid, parent_info.hash);

    // Only the child's output contributes to the balance.
    assert_eq!(
        vault.account_balance("ooo", 0, &TxStatus::ALL).expect("balance"),
        80_000
    );
    assert_eq!(child_info.status, TxStatus::Unsigned);
}

#[test]
fn delete_tx_cascades_and_unspends() {
    let vault = open_vault();
    setup_account(&vault, "janitor", 3);

    let script = vault
        .issue_signing_script("janitor", DEFAULT_BIN_NAME, "")
        .expect("issue");
    let funding = foreign_funding(&script.txout_script, 50_000, 0xee);
    let funding_info = vault
        .insert_tx(&funding, None)
        .expect("insert")
        .expect("related");

    let child = spend(
        OutPoint::new(funding_info.hash, 0),
        &script.txin_script,
        vec![(vec![0x51], 45_000)],
    );
    let child_info = vault
        .insert_tx(&child, None)
        .expect("insert")
        .expect("related");

    // Deleting the spender restores the outpoint.
    vault.delete_tx(&child_info.unsigned_hash).expect("delete child");
    assert!(matches!(
        vault.get_tx(&child_info.unsigned_hash),
        Err(VaultError::TxNotFound(_))
    ));
    let unspent = vault
        .tx_out_entries(
            "janitor",
            ALL_WILDCARD,
            &[TxOutStatus::Unspent],
            &TxStatus::ALL,
        )
        .expect("entries");
    assert_eq!(unspent.len(), 1);
    assert_eq!(unspent[0].txid, funding_info.hash);

    // Reinsert the child, then delete the parent: both rows must go.
    vault.insert_tx(&child, None).expect("insert").expect("related");
    vault
        .delete_tx(&funding_info.unsigned_hash)
        .expect("delete parent");
    assert!(matches!(
        vault.get_tx(&funding_info.unsigned_hash),
        Err(VaultError::TxNotFound(_))
    ));
    assert!(matches!(
        vault.get_tx(&child.unsigned_txid()),
        Err(VaultError::TxNotFound(_))
    ));
    assert_eq!(
        vault
            .account_balance("janitor", 0, &TxStatus::ALL)
            .expect("balance"),
        0
    );
}

#[test]
fn unrelated_transaction_is_not_persisted() {
    let vault = open_vault();
    setup_account(&vault, "bystander", 2);

    let stranger = foreign_funding(&[0x51], 10_000, 0x99);
    assert!(vault.insert_tx(&stranger, None).expect("insert").is_none());
    assert!(matches!(
        vault.get_tx(&stranger.unsigned_txid()),
        Err(VaultError::TxNotFound(_))
    ));
}

#[test]
fn duplicate_status_promotion() {
    let vault = open_vault();
    setup_account(&vault, "promoter", 2);

    let script = vault
        .issue_signing_script("promoter", DEFAULT_BIN_NAME, "")
        .expect("issue");
    let funding = foreign_funding(&script.txout_script, 30_000, 0x77);

    let first = vault
        .insert_tx(&funding, Some(TxStatus::Unsent))
        .expect("insert")
        .expect("related");
    assert_eq!(first.status, TxStatus::Unsent);

    // Higher caller-provided status promotes the stored row.
    let promoted = vault
        .insert_tx(&funding, Some(TxStatus::Propagated))
        .expect("insert")
        .expect("updated");
    assert_eq!(promoted.status, TxStatus::Propagated);

    // Re-inserting at a lower status is a no-op.
    assert!(vault
        .insert_tx(&funding, Some(TxStatus::Sent))
        .expect("insert")
        .is_none());
    assert_eq!(
        vault.get_tx(&funding.unsigned_txid()).expect("get").status,
        TxStatus::Propagated
    );
}

// Helpers for the confirmation test.

use vaultd_primitives::merkleblock::merkle_root;
use vaultd_primitives::{BlockHeader, MerkleBlock, PartialMerkleTree};

fn build_merkle_block(
    prev_block: Hash256,
    time: u32,
    txids: &[Hash256],
    matches: &[bool],
) -> MerkleBlock {
    let tree = PartialMerkleTree::from_txids(txids, matches).expect("tree");
    MerkleBlock {
        header: BlockHeader {
            version: 4,
            prev_block,
            merkle_root: merkle_root(txids),
            time,
            bits: 0x1d00_ffff,
            nonce: 0,
        },
        tree,
    }
}
