//! In-memory versioned cache engine.
//!
//! Every key keeps its latest committed value and the version that wrote it.
//! Versions come from one per-cache counter; `0` means "never written".
//! Transactions buffer their writes and apply them under the entries write
//! lock at commit, so a commit is atomic with respect to readers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError, RwLock};
use std::time::Instant;

use crate::config::{CacheSettings, IsolationLevel, TxConcurrency};
use crate::{Cache, CacheError, CacheResult, QueryField, RangePredicate, Record, Transaction, Value};

pub type Version = u64;
type TxId = u64;

#[derive(Clone, Debug)]
struct VersionedValue {
    version: Version,
    value: Value,
}

/// Salary wrapper ordered with `total_cmp` so it can key a `BTreeMap`.
#[derive(Clone, Copy, Debug)]
struct SalaryKey(f64);

impl PartialEq for SalaryKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for SalaryKey {}

impl Ord for SalaryKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for SalaryKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Entries {
    latest: HashMap<u64, VersionedValue>,
    salary_index: BTreeMap<SalaryKey, BTreeSet<u64>>,
}

impl Entries {
    fn version_of(&self, key: u64) -> Version {
        self.latest.get(&key).map(|v| v.version).unwrap_or(0)
    }

    fn apply(&mut self, indexed: bool, key: u64, value: Value, version: Version) {
        let new_salary = value.as_record().map(|r| r.salary);
        let previous = self.latest.insert(key, VersionedValue { version, value });
        if !indexed {
            return;
        }
        let old_salary = previous.and_then(|v| v.value.as_record().map(|r| r.salary));
        if let Some(salary) = old_salary {
            if let Some(keys) = self.salary_index.get_mut(&SalaryKey(salary)) {
                keys.remove(&key);
                if keys.is_empty() {
                    self.salary_index.remove(&SalaryKey(salary));
                }
            }
        }
        if let Some(salary) = new_salary {
            self.salary_index
                .entry(SalaryKey(salary))
                .or_default()
                .insert(key);
        }
    }

    fn query(&self, indexed: bool, predicate: &RangePredicate) -> Vec<Record> {
        if indexed && predicate.field == QueryField::Salary {
            // BTreeMap::range panics on an inverted interval.
            if predicate.min.total_cmp(&predicate.max).is_ge() {
                return Vec::new();
            }
            return self
                .salary_index
                .range(SalaryKey(predicate.min)..SalaryKey(predicate.max))
                .flat_map(|(_, keys)| keys.iter())
                .filter_map(|key| self.latest.get(key))
                .filter_map(|v| v.value.as_record())
                .filter(|record| predicate.matches(record))
                .cloned()
                .collect();
        }

        let mut out: Vec<Record> = self
            .latest
            .values()
            .filter_map(|v| v.value.as_record())
            .filter(|record| predicate.matches(record))
            .cloned()
            .collect();
        out.sort_by_key(|record| record.id);
        out
    }
}

/// Named in-memory cache.
pub struct MemCache {
    settings: CacheSettings,
    entries: RwLock<Entries>,
    /// Pessimistic key locks: key -> owning transaction.
    locks: Mutex<HashMap<u64, TxId>>,
    lock_released: Condvar,
    next_version: AtomicU64,
    next_tx: AtomicU64,
}

impl MemCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            entries: RwLock::new(Entries::default()),
            locks: Mutex::new(HashMap::new()),
            lock_released: Condvar::new(),
            next_version: AtomicU64::new(1),
            next_tx: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    fn next_version(&self) -> Version {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }

    fn read_entry(&self, key: u64) -> CacheResult<Option<VersionedValue>> {
        let guard = self.entries.read().map_err(|_| CacheError::Poisoned)?;
        Ok(guard.latest.get(&key).cloned())
    }

    fn lock_key(&self, key: u64, tx: TxId) -> CacheResult<()> {
        let timeout = self.settings.lock_timeout;
        let deadline = Instant::now() + timeout;
        let mut owners = self.locks.lock().map_err(|_| CacheError::Poisoned)?;
        loop {
            match owners.get(&key) {
                None => {
                    owners.insert(key, tx);
                    return Ok(());
                }
                Some(owner) if *owner == tx => return Ok(()),
                Some(_) => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CacheError::LockTimeout {
                    key,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            let (guard, _) = self
                .lock_released
                .wait_timeout(owners, deadline - now)
                .map_err(|_| CacheError::Poisoned)?;
            owners = guard;
        }
    }

    fn unlock_keys(&self, tx: TxId, keys: &[u64]) {
        let mut owners = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            if owners.get(key) == Some(&tx) {
                owners.remove(key);
            }
        }
        drop(owners);
        self.lock_released.notify_all();
    }
}

impl Cache for MemCache {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn get(&self, key: u64) -> CacheResult<Option<Value>> {
        Ok(self.read_entry(key)?.map(|v| v.value))
    }

    fn put(&self, key: u64, value: Value) -> CacheResult<()> {
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;
        let version = self.next_version();
        entries.apply(self.settings.indexed, key, value, version);
        Ok(())
    }

    fn put_all(&self, items: BTreeMap<u64, Value>) -> CacheResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;
        let version = self.next_version();
        for (key, value) in items {
            entries.apply(self.settings.indexed, key, value, version);
        }
        Ok(())
    }

    fn begin(&self) -> CacheResult<Box<dyn Transaction + '_>> {
        if !self.settings.transactional {
            return Err(CacheError::TransactionsUnsupported(format!(
                "cache {}",
                self.settings.name
            )));
        }
        let id = self.next_tx.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemTransaction {
            cache: self,
            id,
            read_versions: HashMap::new(),
            snapshot: HashMap::new(),
            writes: BTreeMap::new(),
            held_locks: Vec::new(),
        }))
    }

    fn query(&self, predicate: &RangePredicate) -> CacheResult<Vec<Record>> {
        let entries = self.entries.read().map_err(|_| CacheError::Poisoned)?;
        Ok(entries.query(self.settings.indexed, predicate))
    }

    fn size(&self) -> CacheResult<usize> {
        let entries = self.entries.read().map_err(|_| CacheError::Poisoned)?;
        Ok(entries.latest.len())
    }
}

/// Transaction over a [`MemCache`]. Locks held by a pessimistic transaction
/// are released when the handle is dropped, whichever way it finished.
pub struct MemTransaction<'a> {
    cache: &'a MemCache,
    id: TxId,
    /// Version observed on the first read of each key (0 when absent).
    read_versions: HashMap<u64, Version>,
    /// Values returned so far, replayed for repeatable reads.
    snapshot: HashMap<u64, Option<Value>>,
    writes: BTreeMap<u64, Value>,
    held_locks: Vec<u64>,
}

impl MemTransaction<'_> {
    fn validate(&self, entries: &Entries, writes: &BTreeMap<u64, Value>) -> CacheResult<()> {
        let serializable = self.cache.settings.isolation == IsolationLevel::Serializable;
        for (&key, &read) in &self.read_versions {
            if !serializable && !writes.contains_key(&key) {
                continue;
            }
            let current = entries.version_of(key);
            if current != read {
                return Err(CacheError::WriteConflict { key, read, current });
            }
        }
        Ok(())
    }
}

impl Transaction for MemTransaction<'_> {
    fn get(&mut self, key: u64) -> CacheResult<Option<Value>> {
        if let Some(value) = self.writes.get(&key) {
            return Ok(Some(value.clone()));
        }
        let repeatable = self.cache.settings.isolation != IsolationLevel::ReadCommitted;
        if repeatable {
            if let Some(seen) = self.snapshot.get(&key) {
                return Ok(seen.clone());
            }
        }
        let entry = self.cache.read_entry(key)?;
        let version = entry.as_ref().map(|e| e.version).unwrap_or(0);
        let value = entry.map(|e| e.value);
        self.read_versions.entry(key).or_insert(version);
        if repeatable {
            self.snapshot.insert(key, value.clone());
        }
        Ok(value)
    }

    fn put(&mut self, key: u64, value: Value) -> CacheResult<()> {
        if self.cache.settings.concurrency == TxConcurrency::Pessimistic
            && !self.held_locks.contains(&key)
        {
            self.cache.lock_key(key, self.id)?;
            self.held_locks.push(key);
        }
        self.writes.insert(key, value);
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> CacheResult<()> {
        let writes = std::mem::take(&mut self.writes);
        if writes.is_empty() {
            return Ok(());
        }
        let cache = self.cache;
        let mut entries = cache.entries.write().map_err(|_| CacheError::Poisoned)?;
        if cache.settings.concurrency == TxConcurrency::Optimistic {
            self.validate(&entries, &writes)?;
        }
        let version = cache.next_version();
        for (key, value) in writes {
            entries.apply(cache.settings.indexed, key, value, version);
        }
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> CacheResult<()> {
        self.writes.clear();
        Ok(())
    }
}

impl Drop for MemTransaction<'_> {
    fn drop(&mut self) {
        if !self.held_locks.is_empty() {
            let keys = std::mem::take(&mut self.held_locks);
            self.cache.unlock_keys(self.id, &keys);
        }
    }
}
