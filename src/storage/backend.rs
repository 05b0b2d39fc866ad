use std::collections::HashSet;

use sled::Batch;
use sled::IVec;
use sled::Tree;
use tracing::error;
use tracing::info;
use tracing::trace;

use crate::constants::STORE_META_KEY_COMPACT_REV;
use crate::ConvertError;
use crate::Result;

/// The revision bucket and its metadata tree.
///
/// Every committed mutation lands in the bucket under its encoded revision
/// key, so a lexicographic range scan walks history in revision order.
pub struct Backend {
    keys: Tree,
    meta: Tree,
}

impl Backend {
    /// # Panics
    /// If the bucket and metadata use the same tree
    pub fn new(keys: Tree, meta: Tree) -> Self {
        assert!(
            keys.name() != meta.name(),
            "CRITICAL: bucket and metadata must use different trees"
        );
        Self { keys, meta }
    }

    /// Writes one commit's records in a single batch.
    pub fn append(&self, records: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        trace!("append {} records to revision bucket", records.len());
        let mut batch = Batch::default();
        for (key, value) in records {
            batch.insert(key, value);
        }
        self.keys.apply_batch(batch)?;
        Ok(())
    }

    /// Scans `[min, max)` in revision order. `limit == 0` means unlimited.
    pub fn range(&self, min: &[u8], max: &[u8], limit: usize) -> Result<Vec<(IVec, IVec)>> {
        let mut out = Vec::new();
        for item in self.keys.range(min..max) {
            let (key, value) = item?;
            out.push((key, value));
            if limit != 0 && out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Scans the whole bucket in revision order.
    pub fn scan_all(&self) -> Result<Vec<(IVec, IVec)>> {
        let mut out = Vec::new();
        for item in self.keys.iter() {
            let (key, value) = item?;
            out.push((key, value));
        }
        Ok(out)
    }

    /// Removes every record strictly below `floor`, except those whose
    /// bucket key appears in `keep`.
    pub fn purge_below(&self, floor: &[u8], keep: &HashSet<Vec<u8>>) -> Result<usize> {
        let mut batch = Batch::default();
        let mut removed = 0;
        for item in self.keys.range::<&[u8], _>(..floor) {
            let (key, _) = item?;
            if keep.contains(key.as_ref()) {
                continue;
            }
            batch.remove(key);
            removed += 1;
        }
        self.keys.apply_batch(batch)?;
        Ok(removed)
    }

    pub fn save_compact_rev(&self, rev: i64) -> Result<()> {
        self.meta
            .insert(STORE_META_KEY_COMPACT_REV, &rev.to_be_bytes()[..])?;
        self.meta.flush()?;
        Ok(())
    }

    pub fn load_compact_rev(&self) -> Result<i64> {
        match self.meta.get(STORE_META_KEY_COMPACT_REV)? {
            Some(ivec) => {
                let bytes: [u8; 8] = ivec
                    .as_ref()
                    .try_into()
                    .map_err(|_| ConvertError::InvalidLength(ivec.len()))?;
                Ok(i64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    pub fn flush(&self) -> Result<()> {
        trace!("backend flush");
        self.keys.flush()?;
        self.meta.flush()?;
        Ok(())
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        match self.flush() {
            Ok(_) => info!("backend flushed on drop"),
            Err(e) => error!(?e, "failed to flush backend on drop"),
        }
    }
}
