use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_SYNC_INTERVAL_MS;
use crate::constants::DEFAULT_WATCH_CHANNEL_CAPACITY;
use crate::Error;
use crate::Result;

/// Watch layer tunables.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatchConfig {
    /// Interval between catch-up passes over lagging watchers, in
    /// milliseconds. A worst-case catch-up bound, not a correctness knob.
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    /// Capacity of each watch stream's outbound response channel. The
    /// only bound on queued responses per stream; a full channel demotes
    /// the watcher instead of blocking the writer.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: default_sync_interval_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl WatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sync_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "watch.sync_interval_ms cannot be 0".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(Error::InvalidConfig(
                "watch.channel_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

fn default_sync_interval_ms() -> u64 {
    DEFAULT_SYNC_INTERVAL_MS
}

fn default_channel_capacity() -> usize {
    DEFAULT_WATCH_CHANNEL_CAPACITY
}
