use std::sync::Arc;

use vaultd_core::{Recipient, Secret, TxStatus, Vault, DEFAULT_BIN_NAME};
use vaultd_primitives::{OutPoint, Transaction, TxIn, TxOut};
use vaultd_storage::memory::MemoryStore;

fn open_vault() -> Vault {
    Vault::open(Arc::new(MemoryStore::new()))
}

struct Cosigner {
    name: &'static str,
    lock_key: Secret,
}

/// Creates three private keychains with unlocked chain codes (private keys
/// stay locked) and a 2-of-3 account around them.
fn setup_two_of_three(vault: &Vault) -> Vec<Cosigner> {
    let mut cosigners = Vec::new();
    for (index, name) in ["north", "east", "south"].into_iter().enumerate() {
        let entropy = Secret::from_slice(&[0x40 + index as u8; 32]);
        let lock_key = Secret::from_slice(format!("key-{name}").as_bytes());
        vault
            .new_keychain(name, &entropy, &lock_key, &[0x5a; 16])
            .expect("new keychain");
        vault
            .unlock_keychain_chain_code(name, &lock_key)
            .expect("unlock chain code");
        cosigners.push(Cosigner {
            name,
            lock_key,
        });
    }
    vault
        .new_account(
            "board",
            2,
            &["north".to_string(), "east".to_string(), "south".to_string()],
            2,
            0,
        )
        .expect("new account");
    cosigners
}

fn fund_account(vault: &Vault, value: u64) {
    let script = vault
        .issue_signing_script("board", DEFAULT_BIN_NAME, "funding")
        .expect("issue");
    let funding = Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint::new([0xf0; 32], 0),
            script_sig: vec![0x6a],
            sequence: 0xffff_ffff,
        }],
        outputs: vec![TxOut {
            value,
            script_pubkey: script.txout_script.clone(),
        }],
        lock_time: 0,
    };
    vault
        .insert_tx(&funding, Some(TxStatus::Propagated))
        .expect("insert")
        .expect("related");
}

#[test]
fn partial_signing_two_of_three() {
    let vault = open_vault();
    let cosigners = setup_two_of_three(&vault);
    fund_account(&vault, 100_000);

    let created = vault
        .create_tx(
            "board",
            1,
            0,
            &[Recipient {
                txout_script: vec![0x51],
                value: 60_000,
            }],
            10_000,
            1,
            true,
        )
        .expect("create");
    assert_eq!(created.status, TxStatus::Unsigned);
    let unsigned_hash = created.unsigned_hash;

    // Round-trip law: the stored raw transaction is byte-identical.
    let fetched = vault.get_tx(&unsigned_hash).expect("get");
    assert_eq!(fetched.raw, created.raw);

    let request = vault
        .signing_request(&unsigned_hash, true)
        .expect("request");
    assert_eq!(request.sigs_needed, 2);
    assert_eq!(request.keychains.len(), 3);
    assert_eq!(request.raw_tx.as_deref(), Some(created.raw.as_slice()));

    // All private keys locked: nothing to add.
    assert!(!vault.sign_tx(&unsigned_hash, true).expect("sign"));

    // First cosigner.
    vault
        .unlock_keychain_private_key(cosigners[0].name, &cosigners[0].lock_key)
        .expect("unlock");
    assert!(vault.sign_tx(&unsigned_hash, true).expect("sign"));
    let after_one = vault.get_tx(&unsigned_hash).expect("get");
    assert_eq!(after_one.status, TxStatus::Unsigned);
    assert_eq!(after_one.unsigned_hash, unsigned_hash);
    assert_ne!(after_one.hash, created.hash);
    assert_eq!(
        vault
            .signing_request(&unsigned_hash, false)
            .expect("request")
            .sigs_needed,
        1
    );

    // Second cosigner completes the policy.
    vault.lock_keychain_private_key(cosigners[0].name);
    vault
        .unlock_keychain_private_key(cosigners[1].name, &cosigners[1].lock_key)
        .expect("unlock");
    assert!(vault.sign_tx(&unsigned_hash, true).expect("sign"));
    let after_two = vault.get_tx(&unsigned_hash).expect("get");
    assert_eq!(after_two.status, TxStatus::Unsent);
    assert_eq!(after_two.unsigned_hash, unsigned_hash);
    assert_eq!(
        vault
            .signing_request(&unsigned_hash, false)
            .expect("request")
            .sigs_needed,
        0
    );

    // Re-signing a complete transaction is a no-op.
    vault
        .unlock_keychain_private_key(cosigners[2].name, &cosigners[2].lock_key)
        .expect("unlock");
    assert!(!vault.sign_tx(&unsigned_hash, true).expect("sign"));
    assert_eq!(
        vault.get_tx(&unsigned_hash).expect("get").hash,
        after_two.hash
    );
}

#[test]
fn sign_without_update_discards_signatures() {
    let vault = open_vault();
    let cosigners = setup_two_of_three(&vault);
    fund_account(&vault, 50_000);

    let created = vault
        .create_tx(
            "board",
            1,
            0,
            &[Recipient {
                txout_script: vec![0x52],
                value: 30_000,
            }],
            5_000,
            1,
            true,
        )
        .expect("create");

    vault
        .unlock_keychain_private_key(cosigners[0].name, &cosigners[0].lock_key)
        .expect("unlock");
    assert!(vault.sign_tx(&created.unsigned_hash, false).expect("sign"));

    // Nothing was persisted: the stored copy still carries zero signatures.
    let stored = vault.get_tx(&created.unsigned_hash).expect("get");
    assert_eq!(stored.hash, created.hash);
    assert_eq!(stored.status, TxStatus::Unsigned);
    assert_eq!(
        vault
            .signing_request(&created.unsigned_hash, false)
            .expect("request")
            .sigs_needed,
        2
    );
}

#[test]
fn create_tx_adds_change_and_insufficient_funds_is_reported() {
    let vault = open_vault();
    setup_two_of_three(&vault);
    fund_account(&vault, 100_000);

    let created = vault
        .create_tx(
            "board",
            1,
            0,
            &[Recipient {
                txout_script: vec![0x53],
                value: 60_000,
            }],
            10_000,
            1,
            true,
        )
        .expect("create");
    // Recipient output plus one change output.
    let raw = Transaction::consensus_decode(&created.raw).expect("decode raw");
    assert_eq!(raw.outputs.len(), 2);
    let change_value: u64 = raw
        .outputs
        .iter()
        .filter(|output| output.script_pubkey != vec![0x53])
        .map(|output| output.value)
        .sum();
    assert_eq!(change_value, 30_000);
    assert_eq!(created.fee, 10_000);

    // Remaining balance is already locked up by the pending spend.
    let err = vault
        .create_tx(
            "board",
            1,
            0,
            &[Recipient {
                txout_script: vec![0x54],
                value: 50_000,
            }],
            0,
            1,
            true,
        )
        .expect_err("insufficient");
    assert!(matches!(
        err,
        vaultd_core::VaultError::AccountInsufficientFunds(_)
    ));
}
