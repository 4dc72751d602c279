use std::sync::Arc;

use vaultd_core::{Secret, TxStatus, Vault, DEFAULT_BIN_NAME};
use vaultd_primitives::merkleblock::merkle_root;
use vaultd_primitives::{
    BlockHeader, Hash256, MerkleBlock, OutPoint, PartialMerkleTree, Transaction, TxIn, TxOut,
};
use vaultd_storage::memory::MemoryStore;

const BASE_TIME: u32 = 1_600_000_000;

fn open_vault() -> Vault {
    Vault::open(Arc::new(MemoryStore::new()))
}

fn setup_account(vault: &Vault) {
    let entropy = Secret::from_slice(&[0x33; 32]);
    let lock_key = Secret::from_slice(b"chain test lock key");
    vault
        .new_keychain("watcher", &entropy, &lock_key, &[0x5a; 16])
        .expect("new keychain");
    vault
        .unlock_keychain_chain_code("watcher", &lock_key)
        .expect("unlock chain code");
    vault
        .new_account("watched", 1, &["watcher".to_string()], 3, 0)
        .expect("new account");
}

fn fund_account(vault: &Vault, seed: u8) -> vaultd_core::TxInfo {
    let script = vault
        .issue_signing_script("watched", DEFAULT_BIN_NAME, "")
        .expect("issue");
    let funding = Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint::new([seed; 32], 0),
            script_sig: vec![0x6a],
            sequence: 0xffff_ffff,
        }],
        outputs: vec![TxOut {
            value: 10_000,
            script_pubkey: script.txout_script.clone(),
        }],
        lock_time: 0,
    };
    vault
        .insert_tx(&funding, Some(TxStatus::Propagated))
        .expect("insert")
        .expect("related")
}

fn noise_txid(height: u32) -> Hash256 {
    let mut txid = [0xa0u8; 32];
    txid[0] = height as u8;
    txid
}

fn build_block(prev_block: Hash256, time: u32, txids: &[Hash256], matches: &[bool]) -> MerkleBlock {
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

/// Connects heights 1..=count; the block at `tx_height` includes `txid`.
fn connect_chain(vault: &Vault, count: u32, txid: Hash256, tx_height: u32) -> Vec<Hash256> {
    let mut hashes = Vec::new();
    let mut prev = [0u8; 32];
    for height in 1..=count {
        let block = if height == tx_height {
            build_block(prev, BASE_TIME + height * 600, &[txid], &[true])
        } else {
            build_block(
                prev,
                BASE_TIME + height * 600,
                &[noise_txid(height)],
                &[false],
            )
        };
        assert!(
            vault.insert_merkle_block(&block, height).expect("connect"),
            "block at height {height} refused"
        );
        prev = block.header.hash();
        hashes.push(prev);
    }
    hashes
}

#[test]
fn reorg_disconnects_and_reconnects() {
    let vault = open_vault();
    setup_account(&vault);
    let funding = fund_account(&vault, 0x10);

    let hashes = connect_chain(&vault, 10, funding.hash, 7);
    assert_eq!(vault.best_height().expect("height"), 10);
    let confirmed = vault.get_tx(&funding.unsigned_hash).expect("get");
    assert_eq!(confirmed.status, TxStatus::Confirmed);
    assert_eq!(confirmed.height, Some(7));

    // A competing block at height 7 whose parent is block 6.
    let fork = build_block(
        hashes[5],
        BASE_TIME + 7 * 600 + 30,
        &[noise_txid(77)],
        &[false],
    );
    assert!(vault.insert_merkle_block(&fork, 7).expect("reorg"));

    assert_eq!(vault.best_height().expect("height"), 7);
    let disconnected = vault.get_tx(&funding.unsigned_hash).expect("get");
    assert_eq!(disconnected.status, TxStatus::Propagated);
    assert_eq!(disconnected.height, None);
    assert_eq!(disconnected.block_hash, None);

    // The transaction reconfirms when a new block includes it.
    let reconnect = build_block(
        fork.header.hash(),
        BASE_TIME + 8 * 600,
        &[funding.hash],
        &[true],
    );
    assert!(vault.insert_merkle_block(&reconnect, 8).expect("connect"));
    let reconfirmed = vault.get_tx(&funding.unsigned_hash).expect("get");
    assert_eq!(reconfirmed.status, TxStatus::Confirmed);
    assert_eq!(reconfirmed.height, Some(8));
}

#[test]
fn duplicate_blocks_are_refused() {
    let vault = open_vault();
    setup_account(&vault);
    let funding = fund_account(&vault, 0x11);

    let block = build_block([0u8; 32], BASE_TIME, &[funding.hash], &[true]);
    assert!(vault.insert_merkle_block(&block, 1).expect("connect"));
    assert!(!vault.insert_merkle_block(&block, 1).expect("duplicate"));
    assert_eq!(vault.best_height().expect("height"), 1);
}

#[test]
fn recent_orphans_are_refused_after_horizon_is_established() {
    let vault = open_vault();
    setup_account(&vault);
    let funding = fund_account(&vault, 0x12);

    connect_chain(&vault, 3, funding.hash, 2);
    let horizon = vault.horizon_timestamp().expect("horizon");
    assert_eq!(horizon, BASE_TIME + 2 * 600);

    // Unknown predecessor and a timestamp inside the horizon window.
    let orphan = build_block([0x42u8; 32], horizon, &[noise_txid(42)], &[false]);
    assert!(!vault.insert_merkle_block(&orphan, 9).expect("refused"));
    assert_eq!(vault.best_height().expect("height"), 3);
}

#[test]
fn confirmation_backfill_on_scoped_insert() {
    let vault = open_vault();
    setup_account(&vault);

    // Build the funding transaction but do not insert it yet.
    let script = vault
        .issue_signing_script("watched", DEFAULT_BIN_NAME, "")
        .expect("issue");
    let funding = Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint::new([0x13; 32], 0),
            script_sig: vec![0x6a],
            sequence: 0xffff_ffff,
        }],
        outputs: vec![TxOut {
            value: 5_000,
            script_pubkey: script.txout_script.clone(),
        }],
        lock_time: 0,
    };
    let txid = funding.txid();

    // Its block connects first.
    let block = build_block([0u8; 32], BASE_TIME, &[txid], &[true]);
    assert!(vault.insert_merkle_block(&block, 1).expect("connect"));

    // Inserting the transaction at SENT-or-above backfills the link.
    let info = vault
        .insert_tx(&funding, Some(TxStatus::Sent))
        .expect("insert")
        .expect("related");
    assert_eq!(info.status, TxStatus::Confirmed);
    assert_eq!(info.height, Some(1));

    assert_eq!(
        vault
            .account_balance("watched", 1, &TxStatus::ALL)
            .expect("balance"),
        5_000
    );
    // Deeper confirmation requirements exclude it.
    assert_eq!(
        vault
            .account_balance("watched", 2, &TxStatus::ALL)
            .expect("balance"),
        0
    );
}

#[test]
fn empty_vault_reports_sentinel_horizon_and_zero_height() {
    let vault = open_vault();
    assert_eq!(vault.best_height().expect("height"), 0);
    assert_eq!(vault.horizon_timestamp().expect("horizon"), u32::MAX);
}
