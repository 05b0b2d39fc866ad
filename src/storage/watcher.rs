use std::collections::HashMap;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::metrics::PENDING_EVENTS_GAUGE;
use crate::metrics::WATCH_STREAM_GAUGE;
use crate::Event;
use crate::WatchableStore;

/// Identifier of a watcher within its stream.
pub type WatchId = i64;

/// A batch of events delivered to one watcher.
///
/// Events are in ascending revision order; events carrying the same
/// revision were committed together and appear in commit order.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchResponse {
    pub watch_id: WatchId,
    /// Empty only for a compacted terminal response.
    pub events: Vec<Event>,
    /// Store revision at delivery time.
    pub revision: i64,
    /// When non-zero this response is terminal: the watcher asked for
    /// history below this compaction floor and has been evicted.
    pub compact_revision: i64,
}

impl WatchResponse {
    pub fn is_compacted(&self) -> bool {
        self.compact_revision != 0
    }
}

/// A registered subscription.
pub(crate) struct Watcher {
    /// The exact key, or the prefix when `prefix` is set.
    pub(crate) key: Bytes,
    pub(crate) prefix: bool,
    /// Next revision this watcher still needs to see. Mutated only under
    /// the watch registry mutex; atomic for interior mutability behind
    /// `Arc`.
    cur: AtomicI64,
    pub(crate) id: WatchId,
    /// Registry-wide identity; the key of both partitions.
    pub(crate) seq: u64,
    /// Outbound channel, shared with every watcher of the same stream.
    pub(crate) ch: mpsc::Sender<WatchResponse>,
}

impl Watcher {
    pub(crate) fn new(
        key: Bytes,
        prefix: bool,
        cur: i64,
        id: WatchId,
        seq: u64,
        ch: mpsc::Sender<WatchResponse>,
    ) -> Self {
        Self {
            key,
            prefix,
            cur: AtomicI64::new(cur),
            id,
            seq,
            ch,
        }
    }

    pub(crate) fn cur(&self) -> i64 {
        self.cur.load(Ordering::Relaxed)
    }

    pub(crate) fn set_cur(&self, rev: i64) {
        self.cur.store(rev, Ordering::Relaxed);
    }
}

pub(crate) type CancelFn = Box<dyn FnOnce() + Send>;

/// A client-side aggregate of watchers sharing one bounded outbound
/// channel. Responses carry the [`WatchId`] so the reader can
/// demultiplex.
pub struct WatchStream {
    watchable: Arc<WatchableStore>,
    tx: mpsc::Sender<WatchResponse>,
    rx: mpsc::Receiver<WatchResponse>,
    cancels: HashMap<WatchId, CancelFn>,
    next_id: WatchId,
    closed: bool,
}

impl WatchStream {
    pub(crate) fn new(watchable: Arc<WatchableStore>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        WATCH_STREAM_GAUGE.inc();
        Self {
            watchable,
            tx,
            rx,
            cancels: HashMap::new(),
            next_id: 0,
            closed: false,
        }
    }

    /// Registers a watcher on `key` and returns its id within this
    /// stream.
    ///
    /// `start_rev == 0` subscribes from the next write. A positive
    /// `start_rev` replays history from that revision inclusive, subject
    /// to the compaction floor: a floor above `start_rev` terminates the
    /// watcher with a compacted response instead.
    pub fn watch(&mut self, key: impl Into<Bytes>, prefix: bool, start_rev: i64) -> WatchId {
        let id = self.next_id;
        self.next_id += 1;
        let cancel = self
            .watchable
            .register(key.into(), prefix, start_rev, id, self.tx.clone());
        self.cancels.insert(id, cancel);
        id
    }

    /// Cancels watcher `id`. Unknown or already-cancelled ids are a
    /// no-op.
    pub fn cancel(&mut self, id: WatchId) {
        if let Some(cancel) = self.cancels.remove(&id) {
            cancel();
        }
    }

    /// Receives the next response batch. Returns `None` once the stream
    /// is closed and drained.
    pub async fn recv(&mut self) -> Option<WatchResponse> {
        let resp = self.rx.recv().await;
        if let Some(resp) = &resp {
            PENDING_EVENTS_GAUGE.sub(resp.events.len() as i64);
        }
        resp
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<WatchResponse> {
        let resp = self.rx.try_recv().ok();
        if let Some(resp) = &resp {
            PENDING_EVENTS_GAUGE.sub(resp.events.len() as i64);
        }
        resp
    }

    /// Cancels every outstanding watcher and closes the channel. Already
    /// enqueued responses remain receivable.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for (_, cancel) in self.cancels.drain() {
            cancel();
        }
        self.rx.close();
        WATCH_STREAM_GAUGE.dec();
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        self.close();
    }
}
