//! Error Hierarchy for the Store and Watch Layer
//!
//! Defines error types categorized by subsystem. Invariant violations
//! (corrupted registry state, change-count mismatches, undecodable on-disk
//! records) are not represented here: they panic, because no in-memory
//! rollback can recover them.

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Storage-level failures (backend I/O, codec, revision state)
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Lease bookkeeping failures
    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// Configuration validation failures
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration loading failures
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Disk I/O failures during backend operations
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Embedded database errors
    #[error("Embedded database error: {0}")]
    Db(String),

    /// Serialization failures for persisted records
    #[error(transparent)]
    Bincode(#[from] bincode::Error),

    /// Revision key conversion failures
    #[error("Revision key convert failed")]
    Convert(#[from] ConvertError),

    /// The requested revision is below the compaction floor
    #[error("revision {requested} has been compacted (floor is {floor})")]
    Compacted { requested: i64, floor: i64 },

    /// The requested revision is ahead of the store
    #[error("revision {requested} is in the future (current is {current})")]
    FutureRevision { requested: i64, current: i64 },

    /// A standalone mutation raced an open transaction
    #[error("transaction {0} still in progress")]
    TxnInProgress(i64),

    /// A transaction operation carried the wrong id
    #[error("transaction id mismatch (expected {expected}, got {got})")]
    TxnIdMismatch { expected: i64, got: i64 },

    /// A transaction operation arrived with no transaction open
    #[error("no transaction in progress")]
    NoTxn,
}

/// Error type for revision key conversion operations
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    /// The input byte slice cannot be an encoded revision key.
    #[error("invalid revision key length: received {0} bytes")]
    InvalidLength(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("lease {0} not found")]
    NotFound(i64),

    #[error("lease {0} already exists")]
    AlreadyExists(i64),

    #[error("no range deleter registered")]
    NoDeleter,
}

// ============== Conversion Implementations ============== //
impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::Db(err.to_string())
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        StorageError::Db(err.to_string()).into()
    }
}

impl From<ConvertError> for Error {
    fn from(e: ConvertError) -> Self {
        Error::Storage(StorageError::Convert(e))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Storage(StorageError::Bincode(e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e).into()
    }
}
