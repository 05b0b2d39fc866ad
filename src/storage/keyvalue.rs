use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;
use crate::StorageError;

/// A revisioned key-value record as persisted in the backend bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Bytes,
    pub value: Bytes,
    /// Revision at which the key was created (first put of its current
    /// life; a deleted and re-put key starts a new life).
    pub create_revision: i64,
    /// Revision of the commit that produced this record.
    pub mod_revision: i64,
    /// Number of puts since creation. 0 marks a tombstone record.
    pub version: i64,
    /// Lease attached to the key, or [`NO_LEASE`](crate::lease::NO_LEASE).
    pub lease: i64,
}

impl KeyValue {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| StorageError::Bincode(e).into())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| StorageError::Bincode(e).into())
    }

    /// Tombstone records mark deletions. The mark is carried in the
    /// record itself (`version == 0`), independent of value emptiness.
    pub fn is_tombstone(&self) -> bool {
        self.version == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// A single mutation observed by a watcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: EventType,
    pub kv: KeyValue,
}

impl Event {
    /// The revision of the commit that produced this event.
    pub fn revision(&self) -> i64 {
        self.kv.mod_revision
    }
}
