use vaultd_storage::memory::MemoryStore;
use vaultd_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn put_get_delete() {
    let store = MemoryStore::new();
    store.put(Column::Tx, b"key", b"value").expect("put");
    assert_eq!(
        store.get(Column::Tx, b"key").expect("get"),
        Some(b"value".to_vec())
    );
    // Columns are disjoint namespaces.
    assert_eq!(store.get(Column::Header, b"key").expect("get"), None);

    store.delete(Column::Tx, b"key").expect("delete");
    assert_eq!(store.get(Column::Tx, b"key").expect("get"), None);
}

#[test]
fn scan_prefix_is_ordered_and_bounded() {
    let store = MemoryStore::new();
    store.put(Column::Script, b"acct1/3", b"c").expect("put");
    store.put(Column::Script, b"acct1/1", b"a").expect("put");
    store.put(Column::Script, b"acct1/2", b"b").expect("put");
    store.put(Column::Script, b"acct2/1", b"x").expect("put");

    let results = store.scan_prefix(Column::Script, b"acct1/").expect("scan");
    let keys: Vec<&[u8]> = results.iter().map(|(key, _)| key.as_slice()).collect();
    assert_eq!(keys, vec![&b"acct1/1"[..], b"acct1/2", b"acct1/3"]);
}

#[test]
fn batch_applies_puts_and_deletes_together() {
    let store = MemoryStore::new();
    store.put(Column::Tx, b"stale", b"old").expect("put");

    let mut batch = WriteBatch::new();
    batch.put(Column::Tx, b"fresh".to_vec(), b"new".to_vec());
    batch.delete(Column::Tx, b"stale".to_vec());
    store.write_batch(&batch).expect("batch");

    assert_eq!(store.get(Column::Tx, b"stale").expect("get"), None);
    assert_eq!(
        store.get(Column::Tx, b"fresh").expect("get"),
        Some(b"new".to_vec())
    );
}
