use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use crate::config::WatchConfig;
use crate::constants::KEY_BUCKET_TREE;
use crate::constants::STORE_META_TREE;
use crate::lease::Lessor;
use crate::lease::RangeDeleter;
use crate::metrics::PENDING_EVENTS_GAUGE;
use crate::metrics::SLOW_WATCHER_GAUGE;
use crate::metrics::WATCHER_GAUGE;
use crate::storage::watcher::CancelFn;
use crate::storage::watcher::Watcher;
use crate::Backend;
use crate::Event;
use crate::EventType;
use crate::KeyValue;
use crate::Result;
use crate::Store;
use crate::WatchId;
use crate::WatchResponse;
use crate::WatchStream;

/// Watchers bucketed by watch key. Prefix watchers live under their
/// prefix; the bucket map never holds an empty bucket.
pub(crate) type WatcherBuckets = HashMap<Bytes, HashMap<u64, Arc<Watcher>>>;

#[derive(Default)]
struct Registry {
    /// Watchers caught up with the store, served inline by the notifier.
    synced: WatcherBuckets,
    /// Watchers with history left to replay, served by the sync loop.
    unsynced: HashMap<u64, Arc<Watcher>>,
}

/// An MVCC store that fans committed mutations out to watch streams.
///
/// Every mutating operation commits through the inner [`Store`] and then
/// notifies matching synced watchers inline, under the registry mutex.
/// Lagging watchers are caught up from the revision bucket by a
/// background loop. Lock order is registry mutex first, store mutex
/// beneath it; no code path acquires them in reverse.
pub struct WatchableStore {
    registry: Mutex<Registry>,
    store: Store,
    watcher_seq: AtomicU64,
    config: WatchConfig,
    stop_tx: watch::Sender<()>,
    sync_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WatchableStore {
    /// Opens the store over `db` and spawns the catch-up loop. Must be
    /// called from within a tokio runtime.
    ///
    /// With a lessor present, the store registers itself as the lessor's
    /// range deleter so lease revocations surface as DELETE events.
    pub fn open(
        db: &sled::Db,
        lessor: Option<&Arc<Lessor>>,
        config: WatchConfig,
    ) -> Result<Arc<Self>> {
        let keys = db.open_tree(KEY_BUCKET_TREE)?;
        let meta = db.open_tree(STORE_META_TREE)?;
        let store = Store::open(Backend::new(keys, meta))?;

        let (stop_tx, stop_rx) = watch::channel(());
        let s = Arc::new(Self {
            registry: Mutex::new(Registry::default()),
            store,
            watcher_seq: AtomicU64::new(1),
            config,
            stop_tx,
            sync_handle: Mutex::new(None),
        });

        if let Some(lessor) = lessor {
            let deleter: Arc<dyn RangeDeleter> = s.clone();
            let deleter: Weak<dyn RangeDeleter> = Arc::downgrade(&deleter);
            lessor.set_range_deleter(deleter);
        }

        let handle = tokio::spawn(Self::sync_watchers_loop(
            Arc::downgrade(&s),
            stop_rx,
            s.config.sync_interval(),
        ));
        *s.sync_handle.lock() = Some(handle);

        Ok(s)
    }

    /// Writes `key` and notifies matching synced watchers inline.
    pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>, lease: i64) -> Result<i64> {
        let mut registry = self.lock_registry();
        let rev = self.store.put(key.into(), value.into(), lease)?;
        let changes = self.store.take_changes();
        assert_eq!(
            changes.len(),
            1,
            "CRITICAL: put produced {} changes",
            changes.len()
        );
        let events: Vec<Event> = changes
            .into_iter()
            .map(|kv| Event {
                event_type: EventType::Put,
                kv,
            })
            .collect();
        self.notify(&mut registry, rev, &events);
        Ok(rev)
    }

    /// Deletes `key` alone (empty `end`) or the range `[key, end)`, and
    /// notifies matching synced watchers inline.
    pub fn delete_range(&self, key: &[u8], end: &[u8]) -> Result<(usize, i64)> {
        let mut registry = self.lock_registry();
        let (n, rev) = self.store.delete_range(key, end)?;
        let changes = self.store.take_changes();
        assert_eq!(
            changes.len(),
            n,
            "CRITICAL: delete_range produced {} changes for {} deletions",
            changes.len(),
            n
        );
        if n == 0 {
            return Ok((0, rev));
        }
        let events: Vec<Event> = changes
            .into_iter()
            .map(|kv| Event {
                event_type: EventType::Delete,
                kv,
            })
            .collect();
        self.notify(&mut registry, rev, &events);
        Ok((n, rev))
    }

    /// Begins a transaction. The returned guard holds the registry lock
    /// for its whole life, serializing concurrent mutation and watch
    /// registration against the open transaction; watchers are notified
    /// once, at [`Txn::end`], with the whole batch under one revision.
    pub fn txn_begin(&self) -> Result<Txn<'_>> {
        let registry = self.lock_registry();
        let id = self.store.txn_begin()?;
        Ok(Txn {
            owner: self,
            registry: Some(registry),
            id,
            done: false,
        })
    }

    /// The latest committed revision.
    pub fn rev(&self) -> i64 {
        self.store.rev()
    }

    /// Discards history below `rev`. Lagging watchers whose next needed
    /// revision falls below the floor are evicted with a compacted
    /// terminal response on their stream.
    pub fn compact(&self, rev: i64) -> Result<()> {
        self.store.compact(rev)
    }

    /// Creates a stream on which watchers share one bounded response
    /// channel.
    pub fn new_watch_stream(self: &Arc<Self>) -> WatchStream {
        WatchStream::new(Arc::clone(self), self.config.channel_capacity)
    }

    /// Stops the catch-up loop and closes the inner store. In-flight
    /// deliveries complete or no-op; no new notifications are produced.
    pub async fn close(&self) -> Result<()> {
        let _ = self.stop_tx.send(());
        let handle = self.sync_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(?e, "sync loop task failed");
            }
        }
        self.store.close()
    }

    /// Registers a watcher and returns its cancel handle. Cancellation is
    /// idempotent: the handle removes the watcher from whichever
    /// partition still holds it.
    pub(crate) fn register(
        self: &Arc<Self>,
        key: Bytes,
        prefix: bool,
        start_rev: i64,
        id: WatchId,
        ch: mpsc::Sender<WatchResponse>,
    ) -> CancelFn {
        let mut registry = self.lock_registry();
        let seq = self.watcher_seq.fetch_add(1, Ordering::Relaxed);
        let watcher = Arc::new(Watcher::new(key.clone(), prefix, start_rev, id, seq, ch));

        let current_rev = self.store.rev();
        if start_rev <= 0 || start_rev > current_rev {
            // nothing to replay: future revisions arrive via the notifier
            add_synced(&mut registry.synced, watcher);
        } else {
            registry.unsynced.insert(seq, watcher);
            SLOW_WATCHER_GAUGE.inc();
        }
        WATCHER_GAUGE.inc();
        drop(registry);
        trace!(watch_id = id, seq, start_rev, "watcher registered");

        let store = Arc::downgrade(self);
        Box::new(move || {
            if let Some(store) = store.upgrade() {
                store.cancel_watcher(&key, seq);
            }
        })
    }

    fn cancel_watcher(&self, key: &Bytes, seq: u64) {
        let mut registry = self.lock_registry();
        if registry.unsynced.remove(&seq).is_some() {
            SLOW_WATCHER_GAUGE.dec();
            WATCHER_GAUGE.dec();
            return;
        }
        if remove_synced(&mut registry.synced, key, seq) {
            WATCHER_GAUGE.dec();
        }
        // Not found: the watcher already finished (evicted, or cancelled
        // twice).
    }

    /// Hot path: fans `events` out to matching synced watchers. A watcher
    /// whose channel cannot accept the batch is demoted to unsynced with
    /// its resume revision set to `rev`; the sync loop redelivers from
    /// there. Writers never block on slow consumers.
    fn notify(&self, registry: &mut Registry, rev: i64, events: &[Event]) {
        let current_rev = self.store.rev();
        for (seq, watcher, batch) in watcher_batches(&registry.synced, events) {
            let len = batch.len();
            let resp = WatchResponse {
                watch_id: watcher.id,
                events: batch,
                revision: current_rev,
                compact_revision: 0,
            };
            match watcher.ch.try_send(resp) {
                Ok(()) => PENDING_EVENTS_GAUGE.add(len as i64),
                Err(_) => {
                    // demotion precedes any observable delivery of `rev`,
                    // so the cold path may resume from `rev` inclusive
                    watcher.set_cur(rev);
                    remove_synced(&mut registry.synced, &watcher.key, seq);
                    registry.unsynced.insert(seq, watcher);
                    SLOW_WATCHER_GAUGE.inc();
                    trace!(seq, rev, "slow watcher demoted to unsynced");
                }
            }
        }
    }

    async fn sync_watchers_loop(
        store: Weak<WatchableStore>,
        mut stop_rx: watch::Receiver<()>,
        interval: Duration,
    ) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => {
                    debug!("watch sync loop stopped");
                    return;
                }
                _ = tick.tick() => {
                    let Some(store) = store.upgrade() else { return };
                    if let Err(e) = store.sync_watchers() {
                        warn!("unsynced watcher pass failed: {e}");
                    }
                }
            }
        }
    }

    /// Cold path: one catch-up pass over the unsynced set.
    ///
    /// The pass anchors a single bucket scan at the minimum resume
    /// revision across all lagging watchers, so its cost is bounded by
    /// the revisions scanned rather than watchers times revisions;
    /// per-event filtering makes irrelevant rows cheap. A failed scan
    /// aborts the pass with no watcher state mutated.
    fn sync_watchers(&self) -> Result<()> {
        let mut registry = self.lock_registry();
        if registry.unsynced.is_empty() {
            return Ok(());
        }

        let (current_rev, compact_rev) = self.store.revs();

        let mut min_rev = i64::MAX;
        let mut buckets: WatcherBuckets = HashMap::new();
        let mut prefixes: HashSet<Bytes> = HashSet::new();
        let mut below_floor: Vec<u64> = Vec::new();

        for (seq, w) in registry.unsynced.iter() {
            let cur = w.cur();
            assert!(
                cur <= current_rev,
                "CRITICAL: unsynced watcher at revision {cur} ahead of store revision {current_rev}"
            );
            if cur < compact_rev {
                below_floor.push(*seq);
                continue;
            }
            min_rev = min_rev.min(cur);
            buckets
                .entry(w.key.clone())
                .or_default()
                .insert(*seq, Arc::clone(w));
            if w.prefix {
                prefixes.insert(w.key.clone());
            }
        }

        let raw = if min_rev == i64::MAX {
            Vec::new()
        } else {
            self.store.scan_revisions(min_rev, current_rev + 1)?
        };

        for seq in below_floor {
            let Some(w) = registry.unsynced.remove(&seq) else {
                continue;
            };
            let resp = WatchResponse {
                watch_id: w.id,
                events: Vec::new(),
                revision: current_rev,
                compact_revision: compact_rev,
            };
            if w.ch.try_send(resp).is_err() {
                warn!(seq, "dropping compacted signal: watcher channel unavailable");
            }
            SLOW_WATCHER_GAUGE.dec();
            WATCHER_GAUGE.dec();
            debug!(seq, compact_rev, "watcher evicted below compaction floor");
        }

        let mut events = Vec::with_capacity(raw.len());
        for (key, value) in &raw {
            let kv = KeyValue::decode(value)
                .unwrap_or_else(|e| panic!("CRITICAL: corrupted record in revision bucket: {e}"));
            if !buckets.contains_key(&kv.key) && !match_prefix(&kv.key, &prefixes) {
                continue;
            }
            let event_type = if crate::is_tombstone(key) {
                EventType::Delete
            } else {
                EventType::Put
            };
            events.push(Event { event_type, kv });
        }

        for (seq, watcher, batch) in watcher_batches(&buckets, &events) {
            let len = batch.len();
            let resp = WatchResponse {
                watch_id: watcher.id,
                events: batch,
                revision: current_rev,
                compact_revision: 0,
            };
            match watcher.ch.try_send(resp) {
                Ok(()) => {
                    PENDING_EVENTS_GAUGE.add(len as i64);
                    registry.unsynced.remove(&seq);
                    add_synced(&mut registry.synced, watcher);
                    trace!(seq, "watcher caught up, promoted to synced");
                }
                Err(_) => {
                    // still congested; the next pass retries from the
                    // same resume revision
                    trace!(seq, "watcher channel full, retrying next pass");
                }
            }
        }

        SLOW_WATCHER_GAUGE.set(registry.unsynced.len() as i64);
        Ok(())
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock()
    }
}

impl RangeDeleter for WatchableStore {
    fn delete_range(&self, key: &[u8], end: &[u8]) -> Result<(usize, i64)> {
        WatchableStore::delete_range(self, key, end)
    }
}

/// A transaction over the watchable store. Holds the registry lock from
/// begin to end; dropping an unfinished transaction commits it
/// best-effort.
pub struct Txn<'a> {
    owner: &'a WatchableStore,
    registry: Option<MutexGuard<'a, Registry>>,
    id: i64,
    done: bool,
}

impl Txn<'_> {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn put(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>, lease: i64) -> Result<i64> {
        self.owner.store.txn_put(self.id, key.into(), value.into(), lease)
    }

    pub fn delete_range(&mut self, key: &[u8], end: &[u8]) -> Result<(usize, i64)> {
        self.owner.store.txn_delete_range(self.id, key, end)
    }

    /// Commits the batch and notifies watchers once, with every event
    /// stamped with the single commit revision.
    pub fn end(mut self) -> Result<i64> {
        self.finish()
    }

    fn finish(&mut self) -> Result<i64> {
        self.done = true;
        let rev = self.owner.store.txn_end(self.id)?;
        let changes = self.owner.store.take_changes();
        if changes.is_empty() {
            return Ok(rev);
        }
        let events: Vec<Event> = changes
            .into_iter()
            .map(|kv| Event {
                event_type: if kv.is_tombstone() {
                    EventType::Delete
                } else {
                    EventType::Put
                },
                kv,
            })
            .collect();
        let registry = self.registry.as_mut().expect("txn registry guard present");
        self.owner.notify(&mut *registry, rev, &events);
        Ok(rev)
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(e) = self.finish() {
            error!(?e, "failed to commit dropped transaction");
        }
    }
}

/// Inserts `watcher` into its synced bucket.
///
/// # Panics
/// If the same watcher identity is already present under that key.
pub(crate) fn add_synced(synced: &mut WatcherBuckets, watcher: Arc<Watcher>) {
    let bucket = synced.entry(watcher.key.clone()).or_default();
    if bucket.insert(watcher.seq, watcher).is_some() {
        panic!("CRITICAL: watcher registered twice under one key");
    }
}

/// Removes identity `seq` from the bucket at `key`, pruning the bucket
/// when it empties. Returns whether anything was removed.
pub(crate) fn remove_synced(synced: &mut WatcherBuckets, key: &Bytes, seq: u64) -> bool {
    let Some(bucket) = synced.get_mut(key) else {
        return false;
    };
    let removed = bucket.remove(&seq).is_some();
    if bucket.is_empty() {
        synced.remove(key);
    }
    removed
}

/// Builds per-watcher event batches from `buckets`.
///
/// For an event key `K`, every prefix `K[0..i]` addresses one bucket:
/// exact watchers match only at `i == len(K)`, prefix watchers match
/// unconditionally. This costs O(len(K)) bucket lookups per event
/// instead of a scan over every watcher. Events below a watcher's next
/// needed revision are excluded, which keeps the shared minimum-revision
/// scan of the cold path from re-delivering history to watchers that
/// resumed above the scan anchor.
pub(crate) fn watcher_batches(
    buckets: &WatcherBuckets,
    events: &[Event],
) -> Vec<(u64, Arc<Watcher>, Vec<Event>)> {
    let mut map: HashMap<u64, (Arc<Watcher>, Vec<Event>)> = HashMap::new();
    for ev in events {
        let key = &ev.kv.key;
        for i in 0..=key.len() {
            let Some(bucket) = buckets.get(&key[0..i]) else {
                continue;
            };
            for (seq, w) in bucket {
                if !w.prefix && i != key.len() {
                    continue;
                }
                if ev.revision() < w.cur() {
                    continue;
                }
                map.entry(*seq)
                    .or_insert_with(|| (Arc::clone(w), Vec::new()))
                    .1
                    .push(ev.clone());
            }
        }
    }
    map.into_iter()
        .map(|(seq, (watcher, batch))| (seq, watcher, batch))
        .collect()
}

/// Returns true if `key` starts with any prefix in `prefixes`.
pub(crate) fn match_prefix(key: &[u8], prefixes: &HashSet<Bytes>) -> bool {
    prefixes.iter().any(|p| key.starts_with(p))
}
