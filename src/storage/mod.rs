mod backend;
mod keyvalue;
mod revision;
mod store;
mod watchable_store;
mod watcher;

pub use backend::*;
pub use keyvalue::*;
pub use revision::*;
pub use store::*;
pub use watchable_store::*;
pub use watcher::*;

#[cfg(test)]
mod store_test;

use std::path::Path;

use tracing::debug;

use crate::Result;

/// Opens the sled database backing a store.
pub fn init_sled_kv_db(db_root_path: impl AsRef<Path> + std::fmt::Debug) -> Result<sled::Db> {
    debug!("init_sled_kv_db from path: {:?}", &db_root_path);

    let path = db_root_path.as_ref().join("kv");
    Ok(sled::Config::default().path(path).open()?)
}
