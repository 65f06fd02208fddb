//! Reference key-value store consumed by the benchmark harness.
//!
//! The harness only talks to the [`Cache`] trait. This crate supplies an
//! in-memory versioned engine ([`MemCache`]), an in-process cluster registry
//! with membership notifications, a RESP endpoint that serves caches over
//! TCP, and a RESP client ([`RemoteCache`]) implementing the same trait.

use std::collections::BTreeMap;

pub mod cluster;
pub mod config;
mod error;
pub mod kv;
pub mod record;
pub mod remote;
pub mod resp_server;

pub use error::{CacheError, CacheResult};
pub use kv::MemCache;
pub use record::{QueryField, RangePredicate, Record, Value};
pub use remote::RemoteCache;

/// Key-value surface shared by embedded and remote caches.
///
/// Implementations must be safe to share across worker threads.
pub trait Cache: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self, key: u64) -> CacheResult<Option<Value>>;

    fn put(&self, key: u64, value: Value) -> CacheResult<()>;

    fn put_all(&self, entries: BTreeMap<u64, Value>) -> CacheResult<()>;

    /// Start a transaction bound to the calling thread.
    fn begin(&self) -> CacheResult<Box<dyn Transaction + '_>>;

    /// All records whose predicate field falls inside the interval.
    fn query(&self, predicate: &RangePredicate) -> CacheResult<Vec<Record>>;

    fn size(&self) -> CacheResult<usize>;
}

/// A transaction handle.
///
/// `commit` and `rollback` consume the handle, so a transaction is always
/// finished through the same handle that began it.
pub trait Transaction {
    fn get(&mut self, key: u64) -> CacheResult<Option<Value>>;

    fn put(&mut self, key: u64, value: Value) -> CacheResult<()>;

    fn put_all(&mut self, entries: BTreeMap<u64, Value>) -> CacheResult<()> {
        for (key, value) in entries {
            self.put(key, value)?;
        }
        Ok(())
    }

    fn commit(self: Box<Self>) -> CacheResult<()>;

    fn rollback(self: Box<Self>) -> CacheResult<()>;
}
