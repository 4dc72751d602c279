use vaultd_primitives::encoding::DecodeError;
use vaultd_primitives::{BlockHeader, OutPoint, Transaction, TxIn, TxOut};

fn two_input_tx() -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![
            TxIn {
                prevout: OutPoint::new([0x11u8; 32], 0),
                script_sig: vec![0x00, 0x00, 0x00],
                sequence: 0xffff_ffff,
            },
            TxIn {
                prevout: OutPoint::new([0x22u8; 32], 3),
                script_sig: Vec::new(),
                sequence: 0xffff_fffe,
            },
        ],
        outputs: vec![TxOut {
            value: 1_000_000,
            script_pubkey: vec![0xa9, 0x14, 0x33],
        }],
        lock_time: 101,
    }
}

#[test]
fn transaction_byte_roundtrip() {
    let tx = two_input_tx();
    let bytes = tx.consensus_encode();
    let decoded = Transaction::consensus_decode(&bytes).expect("decode");
    assert_eq!(decoded, tx);
    assert_eq!(decoded.consensus_encode(), bytes);
}

#[test]
fn transaction_rejects_trailing_bytes() {
    let mut bytes = two_input_tx().consensus_encode();
    bytes.push(0x00);
    assert_eq!(
        Transaction::consensus_decode(&bytes),
        Err(DecodeError::TrailingBytes)
    );
}

#[test]
fn unsigned_txid_stable_while_signing() {
    let tx = two_input_tx();
    let unsigned = tx.unsigned_txid();

    let mut partially_signed = tx.clone();
    partially_signed.inputs[0].script_sig = vec![0x30, 0x44, 0x02, 0x20];
    let mut fully_signed = partially_signed.clone();
    fully_signed.inputs[1].script_sig = vec![0x30, 0x45, 0x02, 0x21];

    assert_eq!(partially_signed.unsigned_txid(), unsigned);
    assert_eq!(fully_signed.unsigned_txid(), unsigned);
    assert_ne!(tx.txid(), partially_signed.txid());
    assert_ne!(partially_signed.txid(), fully_signed.txid());
}

#[test]
fn header_hash_changes_with_nonce() {
    let header = BlockHeader {
        version: 4,
        prev_block: [5u8; 32],
        merkle_root: [6u8; 32],
        time: 1_650_000_000,
        bits: 0x1f07_ffff,
        nonce: 7,
    };
    let mut other = header;
    other.nonce = 8;
    assert_ne!(header.hash(), other.hash());
}
