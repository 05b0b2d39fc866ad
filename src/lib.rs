//! # watchkv
//!
//! A revisioned key-value store with watchable event streams.
//!
//! ## Features
//! - **Revisioned writes**: every committed mutation gets a monotone revision
//! - **Watchable**: exact-key and prefix subscriptions with strict per-watcher
//!   revision ordering
//! - **Historical catch-up**: lagging watchers replay missed events from the
//!   backend, subject to the compaction floor
//! - **Bounded fan-out**: deliveries are non-blocking; slow consumers are
//!   demoted instead of blocking writers
//! - **Observability**: structured logging via `tracing` and prometheus metrics
//!
//! ## Quick Start
//! ```no_run
//! use watchkv::{init_sled_kv_db, WatchConfig, WatchableStore, NO_LEASE};
//!
//! #[tokio::main]
//! async fn main() -> watchkv::Result<()> {
//!     let db = init_sled_kv_db("./db")?;
//!     let store = WatchableStore::open(&db, None, WatchConfig::default())?;
//!
//!     let mut stream = store.new_watch_stream();
//!     let id = stream.watch("foo/", true, 0);
//!
//!     store.put("foo/bar", "1", NO_LEASE)?;
//!     let resp = stream.recv().await.expect("watch response");
//!     assert_eq!(resp.watch_id, id);
//!
//!     store.close().await
//! }
//! ```

pub mod config;
pub mod lease;
pub mod metrics;
#[doc(hidden)]
pub mod storage;

mod constants;
mod errors;

#[doc(hidden)]
pub use config::*;
pub use constants::*;
pub use errors::*;
pub use lease::*;
#[doc(hidden)]
pub use storage::*;
