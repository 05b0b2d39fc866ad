use std::collections::BTreeMap;
use std::collections::HashSet;
use std::ops::Bound;

use bytes::Bytes;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use sled::IVec;
use tracing::debug;
use tracing::info;

use crate::Backend;
use crate::KeyValue;
use crate::Result;
use crate::Revision;
use crate::StorageError;

/// Bookkeeping for the most recent version of a live key.
#[derive(Debug, Clone, Copy)]
struct KeyMeta {
    create_rev: i64,
    mod_rev: Revision,
    version: i64,
}

/// Volatile store state, guarded by the store mutex.
struct StoreState {
    /// `main` is the last committed revision; `sub` counts the mutations
    /// staged for the commit in flight.
    current_rev: Revision,
    /// Floor below which history has been discarded.
    compact_rev: i64,
    /// Live keys and their current version metadata.
    index: BTreeMap<Bytes, KeyMeta>,
    /// Records staged for the commit in flight.
    pending: Vec<(Vec<u8>, Vec<u8>)>,
    /// KVs mutated by the most recent committed operation.
    changes: Vec<KeyValue>,
    /// Open transaction id, if any.
    txn: Option<i64>,
    txn_seq: i64,
}

/// A plain MVCC store over the revision bucket.
///
/// Transactions are not internally serialized against standalone
/// mutations: the caller (the watchable facade) serializes them under its
/// own lock. A standalone mutation observed while a transaction is open
/// surfaces [`StorageError::TxnInProgress`].
pub struct Store {
    state: Mutex<StoreState>,
    backend: Backend,
}

impl Store {
    /// Opens the store, rebuilding the live-key index and the current
    /// revision from the bucket.
    ///
    /// # Panics
    /// If a bucket record fails to decode (on-disk corruption).
    pub fn open(backend: Backend) -> Result<Self> {
        let compact_rev = backend.load_compact_rev()?;
        let mut index = BTreeMap::new();
        // a fresh store sits at revision 1; the first commit gets 2
        let mut current_main = 1i64;

        for (key, value) in backend.scan_all()? {
            let rev = Revision::from_bytes(&key)
                .unwrap_or_else(|e| panic!("CRITICAL: corrupted revision key in bucket: {e}"));
            let kv = KeyValue::decode(&value)
                .unwrap_or_else(|e| panic!("CRITICAL: corrupted record in revision bucket: {e}"));
            if crate::is_tombstone(&key) {
                index.remove(&kv.key);
            } else {
                index.insert(
                    kv.key.clone(),
                    KeyMeta {
                        create_rev: kv.create_revision,
                        mod_rev: rev,
                        version: kv.version,
                    },
                );
            }
            current_main = rev.main;
        }

        info!(
            current_rev = current_main,
            compact_rev,
            live_keys = index.len(),
            "store opened"
        );

        Ok(Self {
            state: Mutex::new(StoreState {
                current_rev: Revision::new(current_main, 0),
                compact_rev,
                index,
                pending: Vec::new(),
                changes: Vec::new(),
                txn: None,
                txn_seq: 0,
            }),
            backend,
        })
    }

    /// Writes `key` with an implicit single-operation commit.
    pub fn put(&self, key: Bytes, value: Bytes, lease: i64) -> Result<i64> {
        let mut state = self.lock();
        if let Some(id) = state.txn {
            return Err(StorageError::TxnInProgress(id).into());
        }
        state.changes.clear();
        Self::stage_put(&mut state, key, value, lease)?;
        Self::commit(&mut state, &self.backend)
    }

    /// Deletes `key` alone (empty `end`) or the half-open range
    /// `[key, end)`, with an implicit commit. Deleting nothing commits
    /// nothing and leaves the revision untouched.
    pub fn delete_range(&self, key: &[u8], end: &[u8]) -> Result<(usize, i64)> {
        let mut state = self.lock();
        if let Some(id) = state.txn {
            return Err(StorageError::TxnInProgress(id).into());
        }
        state.changes.clear();
        let n = Self::stage_delete_range(&mut state, key, end)?;
        let rev = Self::commit(&mut state, &self.backend)?;
        Ok((n, rev))
    }

    pub fn txn_begin(&self) -> Result<i64> {
        let mut state = self.lock();
        if let Some(id) = state.txn {
            return Err(StorageError::TxnInProgress(id).into());
        }
        state.txn_seq += 1;
        let id = state.txn_seq;
        state.txn = Some(id);
        state.changes.clear();
        debug!(txn_id = id, "transaction begun");
        Ok(id)
    }

    pub fn txn_put(&self, id: i64, key: Bytes, value: Bytes, lease: i64) -> Result<i64> {
        let mut state = self.lock();
        Self::check_txn(&state, id)?;
        Self::stage_put(&mut state, key, value, lease)
    }

    pub fn txn_delete_range(&self, id: i64, key: &[u8], end: &[u8]) -> Result<(usize, i64)> {
        let mut state = self.lock();
        Self::check_txn(&state, id)?;
        let n = Self::stage_delete_range(&mut state, key, end)?;
        let rev = if n == 0 {
            state.current_rev.main
        } else {
            state.current_rev.main + 1
        };
        Ok((n, rev))
    }

    /// Commits every mutation staged since [`Store::txn_begin`] under one
    /// revision.
    pub fn txn_end(&self, id: i64) -> Result<i64> {
        let mut state = self.lock();
        Self::check_txn(&state, id)?;
        state.txn = None;
        let rev = Self::commit(&mut state, &self.backend)?;
        debug!(txn_id = id, rev, "transaction committed");
        Ok(rev)
    }

    /// Drains the KVs mutated by the most recent committed operation.
    pub(crate) fn take_changes(&self) -> Vec<KeyValue> {
        std::mem::take(&mut self.lock().changes)
    }

    /// The latest committed revision.
    pub fn rev(&self) -> i64 {
        self.lock().current_rev.main
    }

    /// The compaction floor.
    pub fn compact_rev(&self) -> i64 {
        self.lock().compact_rev
    }

    /// Snapshot of `(current revision, compaction floor)` under one lock
    /// acquisition.
    pub(crate) fn revs(&self) -> (i64, i64) {
        let state = self.lock();
        (state.current_rev.main, state.compact_rev)
    }

    /// Discards history below `rev`, keeping each live key's current
    /// record so a reopened store still sees every live key.
    pub fn compact(&self, rev: i64) -> Result<()> {
        let mut state = self.lock();
        if rev <= state.compact_rev {
            return Err(StorageError::Compacted {
                requested: rev,
                floor: state.compact_rev,
            }
            .into());
        }
        if rev > state.current_rev.main {
            return Err(StorageError::FutureRevision {
                requested: rev,
                current: state.current_rev.main,
            }
            .into());
        }

        state.compact_rev = rev;
        self.backend.save_compact_rev(rev)?;

        let keep: HashSet<Vec<u8>> = state
            .index
            .values()
            .filter(|meta| meta.mod_rev.main < rev)
            .map(|meta| meta.mod_rev.to_bytes().to_vec())
            .collect();
        let floor = Revision::new(rev, 0).to_bytes();
        let removed = self.backend.purge_below(&floor, &keep)?;
        info!(rev, removed, "store compacted");
        Ok(())
    }

    /// Scans the bucket for revisions in `[min_main, max_main)` under the
    /// store mutex.
    pub(crate) fn scan_revisions(&self, min_main: i64, max_main: i64) -> Result<Vec<(IVec, IVec)>> {
        let _state = self.lock();
        self.backend.range(
            &Revision::new(min_main, 0).to_bytes(),
            &Revision::new(max_main, 0).to_bytes(),
            0,
        )
    }

    pub fn close(&self) -> Result<()> {
        self.backend.flush()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock()
    }

    fn check_txn(state: &StoreState, id: i64) -> Result<()> {
        match state.txn {
            Some(open) if open == id => Ok(()),
            Some(open) => Err(StorageError::TxnIdMismatch {
                expected: open,
                got: id,
            }
            .into()),
            None => Err(StorageError::NoTxn.into()),
        }
    }

    fn stage_put(state: &mut StoreState, key: Bytes, value: Bytes, lease: i64) -> Result<i64> {
        let main = state.current_rev.main + 1;
        let rev = Revision::new(main, state.current_rev.sub);
        let (create_rev, version) = match state.index.get(&key) {
            Some(meta) => (meta.create_rev, meta.version + 1),
            None => (main, 1),
        };
        let kv = KeyValue {
            key: key.clone(),
            value,
            create_revision: create_rev,
            mod_revision: main,
            version,
            lease,
        };
        state.pending.push((rev.to_bytes().to_vec(), kv.encode()?));
        state.index.insert(
            key,
            KeyMeta {
                create_rev,
                mod_rev: rev,
                version,
            },
        );
        state.changes.push(kv);
        state.current_rev.sub += 1;
        Ok(main)
    }

    fn stage_delete_range(state: &mut StoreState, key: &[u8], end: &[u8]) -> Result<usize> {
        let targets: Vec<Bytes> = if end.is_empty() {
            state.index.get_key_value(key).map(|(k, _)| k.clone()).into_iter().collect()
        } else {
            state
                .index
                .range::<[u8], _>((Bound::Included(key), Bound::Excluded(end)))
                .map(|(k, _)| k.clone())
                .collect()
        };

        let main = state.current_rev.main + 1;
        let n = targets.len();
        for key in targets {
            let rev = Revision::new(main, state.current_rev.sub);
            let kv = KeyValue {
                key: key.clone(),
                value: Bytes::new(),
                create_revision: 0,
                mod_revision: main,
                version: 0,
                lease: 0,
            };
            state
                .pending
                .push((rev.to_tombstone_bytes().to_vec(), kv.encode()?));
            state.index.remove(&key);
            state.changes.push(kv);
            state.current_rev.sub += 1;
        }
        Ok(n)
    }

    /// Flushes staged records and advances the committed revision. A
    /// commit with nothing staged is a no-op.
    fn commit(state: &mut StoreState, backend: &Backend) -> Result<i64> {
        if state.current_rev.sub == 0 {
            return Ok(state.current_rev.main);
        }
        backend.append(std::mem::take(&mut state.pending))?;
        state.current_rev.main += 1;
        state.current_rev.sub = 0;
        Ok(state.current_rev.main)
    }
}
