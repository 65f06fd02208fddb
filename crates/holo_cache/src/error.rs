use thiserror::Error;

/// Errors surfaced by cache implementations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("{0} does not support transactions")]
    TransactionsUnsupported(String),
    #[error("cache {0} is not defined")]
    UnknownCache(String),
    #[error("lock on key {key} not acquired within {timeout_ms}ms")]
    LockTimeout { key: u64, timeout_ms: u64 },
    #[error("write conflict on key {key}: read version {read}, current version {current}")]
    WriteConflict { key: u64, read: u64, current: u64 },
    #[error("cache state lock poisoned")]
    Poisoned,
    #[error("value codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("remote error: {0}")]
    Remote(String),
}

pub type CacheResult<T> = Result<T, CacheError>;
