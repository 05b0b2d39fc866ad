use bytes::Bytes;
use tempfile::TempDir;

use super::*;
use crate::Error;
use crate::StorageError;

fn open_db(dir: &TempDir) -> sled::Db {
    sled::Config::default()
        .path(dir.path().join("kv"))
        .open()
        .unwrap()
}

fn open_store(db: &sled::Db) -> Store {
    let keys = db.open_tree("keys").unwrap();
    let meta = db.open_tree("meta").unwrap();
    Store::open(Backend::new(keys, meta)).unwrap()
}

fn setup_store() -> (Store, sled::Db, TempDir) {
    let tempdir = tempfile::tempdir().unwrap();
    let db = open_db(&tempdir);
    let store = open_store(&db);
    (store, db, tempdir)
}

fn put(store: &Store, key: &'static str, value: &'static str) -> i64 {
    store
        .put(Bytes::from_static(key.as_bytes()), Bytes::from_static(value.as_bytes()), 0)
        .unwrap()
}

#[test]
fn test_fresh_store_sits_at_revision_one() {
    let (store, _db, _dir) = setup_store();
    assert_eq!(store.rev(), 1);
    assert_eq!(store.compact_rev(), 0);
}

#[test]
fn test_put_assigns_monotone_revisions() {
    let (store, _db, _dir) = setup_store();
    assert_eq!(put(&store, "a", "1"), 2);
    assert_eq!(put(&store, "b", "2"), 3);
    assert_eq!(put(&store, "a", "3"), 4);
    assert_eq!(store.rev(), 4);
}

#[test]
fn test_put_versions_and_create_revision() {
    let (store, _db, _dir) = setup_store();
    put(&store, "a", "1");
    let first = store.take_changes().remove(0);
    assert_eq!(first.create_revision, 2);
    assert_eq!(first.mod_revision, 2);
    assert_eq!(first.version, 1);

    put(&store, "a", "2");
    let second = store.take_changes().remove(0);
    assert_eq!(second.create_revision, 2);
    assert_eq!(second.mod_revision, 3);
    assert_eq!(second.version, 2);
}

#[test]
fn test_delete_single_key() {
    let (store, _db, _dir) = setup_store();
    put(&store, "a", "1");
    store.take_changes();

    let (n, rev) = store.delete_range(b"a", b"").unwrap();
    assert_eq!((n, rev), (1, 3));

    let change = store.take_changes().remove(0);
    assert!(change.is_tombstone());
    assert_eq!(change.mod_revision, 3);
    assert!(change.value.is_empty());
}

#[test]
fn test_delete_missing_key_commits_nothing() {
    let (store, _db, _dir) = setup_store();
    put(&store, "a", "1");

    let (n, rev) = store.delete_range(b"zzz", b"").unwrap();
    assert_eq!(n, 0);
    assert_eq!(rev, 2);
    assert_eq!(store.rev(), 2);
    assert!(store.take_changes().is_empty());
}

#[test]
fn test_delete_range_is_half_open() {
    let (store, _db, _dir) = setup_store();
    put(&store, "a", "1");
    put(&store, "b", "2");
    put(&store, "c", "3");
    store.take_changes();

    let (n, rev) = store.delete_range(b"a", b"c").unwrap();
    assert_eq!((n, rev), (2, 5));

    let changes = store.take_changes();
    let keys: Vec<&[u8]> = changes.iter().map(|kv| kv.key.as_ref()).collect();
    assert_eq!(keys, vec![b"a".as_ref(), b"b".as_ref()]);
}

#[test]
fn test_delete_then_reput_starts_new_life() {
    let (store, _db, _dir) = setup_store();
    put(&store, "a", "1");
    store.delete_range(b"a", b"").unwrap();
    store.take_changes();

    let rev = put(&store, "a", "2");
    let change = store.take_changes().remove(0);
    assert_eq!(change.create_revision, rev);
    assert_eq!(change.version, 1);
}

#[test]
fn test_txn_commits_under_one_revision() {
    let (store, _db, _dir) = setup_store();
    put(&store, "c", "0");
    store.take_changes();

    let id = store.txn_begin().unwrap();
    assert_eq!(store.txn_put(id, Bytes::from_static(b"a"), Bytes::from_static(b"1"), 0).unwrap(), 3);
    assert_eq!(store.txn_put(id, Bytes::from_static(b"b"), Bytes::from_static(b"2"), 0).unwrap(), 3);
    let (n, rev) = store.txn_delete_range(id, b"c", b"d").unwrap();
    assert_eq!((n, rev), (1, 3));
    assert_eq!(store.txn_end(id).unwrap(), 3);
    assert_eq!(store.rev(), 3);

    let changes = store.take_changes();
    assert_eq!(changes.len(), 3);
    assert!(changes.iter().all(|kv| kv.mod_revision == 3));
    assert!(changes[2].is_tombstone());
}

#[test]
fn test_txn_id_mismatch() {
    let (store, _db, _dir) = setup_store();
    let id = store.txn_begin().unwrap();
    let err = store
        .txn_put(id + 1, Bytes::from_static(b"a"), Bytes::from_static(b"1"), 0)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Storage(StorageError::TxnIdMismatch { .. })
    ));
    store.txn_end(id).unwrap();
}

#[test]
fn test_txn_op_without_txn() {
    let (store, _db, _dir) = setup_store();
    assert!(matches!(
        store.txn_end(1).unwrap_err(),
        Error::Storage(StorageError::NoTxn)
    ));
}

#[test]
fn test_standalone_mutation_during_txn_rejected() {
    let (store, _db, _dir) = setup_store();
    let id = store.txn_begin().unwrap();
    assert!(matches!(
        store
            .put(Bytes::from_static(b"a"), Bytes::from_static(b"1"), 0)
            .unwrap_err(),
        Error::Storage(StorageError::TxnInProgress(_))
    ));
    assert!(matches!(
        store.delete_range(b"a", b"").unwrap_err(),
        Error::Storage(StorageError::TxnInProgress(_))
    ));
    store.txn_end(id).unwrap();
}

#[test]
fn test_empty_txn_commits_nothing() {
    let (store, _db, _dir) = setup_store();
    let id = store.txn_begin().unwrap();
    assert_eq!(store.txn_end(id).unwrap(), 1);
    assert_eq!(store.rev(), 1);
}

#[test]
fn test_compact_bounds() {
    let (store, _db, _dir) = setup_store();
    put(&store, "a", "1");

    assert!(matches!(
        store.compact(5).unwrap_err(),
        Error::Storage(StorageError::FutureRevision { .. })
    ));
    store.compact(2).unwrap();
    assert_eq!(store.compact_rev(), 2);
    assert!(matches!(
        store.compact(1).unwrap_err(),
        Error::Storage(StorageError::Compacted { .. })
    ));
}

#[test]
fn test_compact_discards_history_keeps_live_records() {
    let (store, _db, _dir) = setup_store();
    put(&store, "a", "1"); // rev 2
    put(&store, "a", "2"); // rev 3
    put(&store, "b", "1"); // rev 4
    put(&store, "a", "3"); // rev 5

    store.compact(5).unwrap();

    // records below the floor are gone, except b's live version at rev 4
    let raw = store.scan_revisions(2, 6).unwrap();
    let revs: Vec<i64> = raw
        .iter()
        .map(|(k, _)| Revision::from_bytes(k).unwrap().main)
        .collect();
    assert_eq!(revs, vec![4, 5]);
}

#[test]
fn test_scan_revisions_half_open() {
    let (store, _db, _dir) = setup_store();
    put(&store, "a", "1"); // rev 2
    put(&store, "a", "2"); // rev 3
    put(&store, "a", "3"); // rev 4

    let raw = store.scan_revisions(3, 4).unwrap();
    assert_eq!(raw.len(), 1);
    assert_eq!(Revision::from_bytes(&raw[0].0).unwrap().main, 3);
}

#[test]
fn test_restore_recovers_revision_and_index() {
    let tempdir = tempfile::tempdir().unwrap();
    let db = open_db(&tempdir);
    {
        let store = open_store(&db);
        put(&store, "a", "1"); // rev 2
        put(&store, "b", "2"); // rev 3
        store.delete_range(b"a", b"").unwrap(); // rev 4
        store.close().unwrap();
    }

    let store = open_store(&db);
    assert_eq!(store.rev(), 4);

    // "a" is gone: deleting it again is a no-op
    let (n, _) = store.delete_range(b"a", b"").unwrap();
    assert_eq!(n, 0);
    // "b" survived with its version intact
    store.take_changes();
    let rev = put(&store, "b", "3");
    let change = store.take_changes().remove(0);
    assert_eq!(rev, 5);
    assert_eq!(change.create_revision, 3);
    assert_eq!(change.version, 2);
}
