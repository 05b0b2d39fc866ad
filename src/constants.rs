// -
// Database namespaces

/// Sled tree holding revision-keyed key-value records.
pub(crate) const KEY_BUCKET_TREE: &str = "_kv_key_bucket";
/// Sled tree holding store metadata.
pub(crate) const STORE_META_TREE: &str = "_kv_store_meta";

/// Store metadata entry keys
pub(crate) const STORE_META_KEY_COMPACT_REV: &str = "_kv_compact_main_rev";

// -
// Watch layer defaults

/// Default capacity of a watch stream's outbound response channel.
pub const DEFAULT_WATCH_CHANNEL_CAPACITY: usize = 1024;

/// Default interval between catch-up passes over lagging watchers, in
/// milliseconds.
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 100;
