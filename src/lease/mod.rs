//! Minimal lease bookkeeping.
//!
//! Leases here carry just enough state for revocation to delete every
//! attached key through the watchable store, so that revocations surface
//! as DELETE events on watch streams. TTL tracking, keep-alives, and
//! checkpointing are deliberately absent.


use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Weak;

use bytes::Bytes;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use tracing::debug;

use crate::LeaseError;
use crate::Result;

/// Lease identifier.
pub type LeaseId = i64;

/// Marks a record with no lease attached.
pub const NO_LEASE: LeaseId = 0;

/// Deletes key ranges on behalf of the lessor. Implemented by the
/// watchable store, so revocations flow through its notifier.
pub trait RangeDeleter: Send + Sync {
    /// Deletes `key` alone (empty `end`) or the range `[key, end)`.
    fn delete_range(&self, key: &[u8], end: &[u8]) -> Result<(usize, i64)>;
}

#[derive(Default)]
struct LessorState {
    leases: HashMap<LeaseId, BTreeSet<Bytes>>,
    deleter: Option<Weak<dyn RangeDeleter>>,
}

/// Grants leases, tracks their attached keys, and deletes those keys on
/// revocation through the registered [`RangeDeleter`].
#[derive(Default)]
pub struct Lessor {
    state: Mutex<LessorState>,
}

impl Lessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the watchable store at open time. The deleter is held
    /// weakly; revoking after the store is gone surfaces
    /// [`LeaseError::NoDeleter`].
    pub fn set_range_deleter(&self, deleter: Weak<dyn RangeDeleter>) {
        self.lock().deleter = Some(deleter);
    }

    pub fn grant(&self, id: LeaseId) -> Result<()> {
        let mut state = self.lock();
        if state.leases.contains_key(&id) {
            return Err(LeaseError::AlreadyExists(id).into());
        }
        state.leases.insert(id, BTreeSet::new());
        debug!(lease_id = id, "lease granted");
        Ok(())
    }

    /// Attaches `key` to the lease `id`.
    pub fn attach(&self, id: LeaseId, key: impl Into<Bytes>) -> Result<()> {
        let mut state = self.lock();
        let items = state
            .leases
            .get_mut(&id)
            .ok_or(LeaseError::NotFound(id))?;
        items.insert(key.into());
        Ok(())
    }

    /// Revokes `id`, deleting every attached key. The deletions run
    /// outside the lessor lock and notify watchers as any other
    /// deletion would.
    pub fn revoke(&self, id: LeaseId) -> Result<()> {
        let (items, deleter) = {
            let mut state = self.lock();
            let deleter = state
                .deleter
                .as_ref()
                .and_then(Weak::upgrade)
                .ok_or(LeaseError::NoDeleter)?;
            let items = state.leases.remove(&id).ok_or(LeaseError::NotFound(id))?;
            (items, deleter)
        };
        for key in &items {
            deleter.delete_range(key, &[])?;
        }
        debug!(lease_id = id, keys = items.len(), "lease revoked");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, LessorState> {
        self.state.lock()
    }
}
