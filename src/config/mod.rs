//! Configuration management for the store and its watch layer.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Environment variable overrides
//! - Configuration file support
//! - Component-wise validation
mod watch;
pub use watch::*;


use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Main configuration container.
///
/// Combines all subsystem configurations with hierarchical override
/// support:
/// 1. Default values from code implementation
/// 2. Configuration file specified by `CONFIG_PATH`
/// 3. Environment variables (highest priority)
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct WatchKvConfig {
    /// Storage paths and backend settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Watch layer tunables
    #[serde(default)]
    pub watch: WatchConfig,
}

impl WatchKvConfig {
    /// Creates a new configuration with hierarchical override support.
    ///
    /// Configuration sources are merged in the following order (later
    /// sources override earlier ones):
    /// 1. Type defaults (lowest priority)
    /// 2. Configuration file from `CONFIG_PATH` environment variable
    /// 3. Environment variables with `WATCHKV__` prefix (highest priority)
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder();
        if let Ok(path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&path));
        }
        let settings = builder
            .add_source(Environment::with_prefix("WATCHKV").separator("__"))
            .build()?;

        let config: WatchKvConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validates all subsystem configurations
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.watch.validate()?;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root directory of the sled database
    #[serde(default = "default_db_root_path")]
    pub db_root_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_root_path: default_db_root_path(),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        if self.db_root_path.is_empty() {
            return Err(Error::InvalidConfig(
                "storage.db_root_path cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

fn default_db_root_path() -> String {
    "./db".to_string()
}
