//! Workload semantics against scripted caches and a live member.

mod common;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use common::{member_config, unique_cluster};
use holo_bench::node::{NodeLifecycleManager, NodeRole};
use holo_bench::workload::{
    populate_records, query_and_verify, write_absent_key, PutTx, WorkloadContext,
};
use holo_bench::{FailurePolicy, KeyGenerator, Outcome, Workload, WorkloadConfig, WorkloadKind};
use holo_cache::config::CacheSettings;
use holo_cache::{
    Cache, CacheError, CacheResult, MemCache, RangePredicate, Record, Transaction, Value,
};

/// Cache that records every write, answers queries with canned records and
/// can be told to fail puts.
#[derive(Default)]
struct ScriptedCache {
    batches: Mutex<Vec<BTreeMap<u64, Value>>>,
    query_results: Mutex<Vec<Record>>,
    reject_odd_puts: AtomicBool,
    fail_tx_puts: AtomicBool,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

struct ScriptedTx<'a> {
    cache: &'a ScriptedCache,
    staged: BTreeMap<u64, Value>,
}

impl Cache for ScriptedCache {
    fn name(&self) -> &str {
        "scripted"
    }

    fn get(&self, _key: u64) -> CacheResult<Option<Value>> {
        Ok(None)
    }

    fn put(&self, key: u64, value: Value) -> CacheResult<()> {
        if self.reject_odd_puts.load(Ordering::SeqCst) && key % 2 == 1 {
            return Err(CacheError::Remote(format!("rejected key {key}")));
        }
        self.put_all(BTreeMap::from([(key, value)]))
    }

    fn put_all(&self, entries: BTreeMap<u64, Value>) -> CacheResult<()> {
        self.batches.lock().unwrap().push(entries);
        Ok(())
    }

    fn begin(&self) -> CacheResult<Box<dyn Transaction + '_>> {
        Ok(Box::new(ScriptedTx {
            cache: self,
            staged: BTreeMap::new(),
        }))
    }

    fn query(&self, _predicate: &RangePredicate) -> CacheResult<Vec<Record>> {
        Ok(self.query_results.lock().unwrap().clone())
    }

    fn size(&self) -> CacheResult<usize> {
        Ok(self.batches.lock().unwrap().iter().map(|b| b.len()).sum())
    }
}

impl Transaction for ScriptedTx<'_> {
    fn get(&mut self, key: u64) -> CacheResult<Option<Value>> {
        Ok(self.staged.get(&key).cloned())
    }

    fn put(&mut self, key: u64, value: Value) -> CacheResult<()> {
        if self.cache.fail_tx_puts.load(Ordering::SeqCst) {
            return Err(CacheError::LockTimeout {
                key,
                timeout_ms: 0,
            });
        }
        self.staged.insert(key, value);
        Ok(())
    }

    fn commit(self: Box<Self>) -> CacheResult<()> {
        self.cache.commits.fetch_add(1, Ordering::SeqCst);
        self.cache.put_all(self.staged)
    }

    fn rollback(self: Box<Self>) -> CacheResult<()> {
        self.cache.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn scripted(range: u64, batch: usize) -> (Arc<ScriptedCache>, WorkloadContext) {
    let cache = Arc::new(ScriptedCache::default());
    let ctx = WorkloadContext {
        config: Arc::new(WorkloadConfig {
            range,
            batch,
            ..WorkloadConfig::default()
        }),
        cache: cache.clone(),
    };
    (cache, ctx)
}

#[test]
fn bulk_put_writes_distinct_keys_in_range() {
    let (cache, ctx) = scripted(500, 40);
    let workload = WorkloadKind::BulkPut.build(ctx);
    let mut rng = KeyGenerator::seeded(17);
    for _ in 0..25 {
        assert_eq!(workload.test(&mut rng).unwrap(), Outcome::Completed);
    }

    let batches = cache.batches.lock().unwrap();
    assert_eq!(batches.len(), 25);
    for batch in batches.iter() {
        assert_eq!(batch.len(), 40);
        assert!(batch.keys().all(|k| *k < 500));
    }
}

#[test]
fn bulk_put_tx_failure_rolls_back_once() {
    let (cache, ctx) = scripted(100, 10);
    cache.fail_tx_puts.store(true, Ordering::SeqCst);
    let workload = WorkloadKind::BulkPutTx.build(ctx);

    let err = workload.test(&mut KeyGenerator::seeded(3)).unwrap_err();
    assert!(err.to_string().contains("not acquired"));
    assert_eq!(cache.rollbacks.load(Ordering::SeqCst), 1);
    assert_eq!(cache.commits.load(Ordering::SeqCst), 0);
    assert!(cache.batches.lock().unwrap().is_empty());
}

#[test]
fn put_tx_failure_policies() {
    let (cache, ctx) = scripted(100, 1);
    cache.fail_tx_puts.store(true, Ordering::SeqCst);

    let absorbing = PutTx::new(ctx.clone());
    match absorbing.test(&mut KeyGenerator::seeded(4)).unwrap() {
        Outcome::RolledBack { error } => assert!(error.contains("not acquired")),
        other => panic!("expected rollback, got {other:?}"),
    }
    assert_eq!(cache.rollbacks.load(Ordering::SeqCst), 1);

    let strict = PutTx::with_policy(ctx, FailurePolicy::Propagate);
    assert!(strict.test(&mut KeyGenerator::seeded(4)).is_err());
    assert_eq!(cache.rollbacks.load(Ordering::SeqCst), 2);
    assert_eq!(cache.commits.load(Ordering::SeqCst), 0);

    cache.fail_tx_puts.store(false, Ordering::SeqCst);
    assert_eq!(
        strict.test(&mut KeyGenerator::seeded(4)).unwrap(),
        Outcome::Completed
    );
    assert_eq!(cache.commits.load(Ordering::SeqCst), 1);
}

#[test]
fn put_get_never_rewrites_lower_key() {
    let cache = MemCache::new(CacheSettings::local("transactional", true, false));
    let range = 1_000;

    let first = write_absent_key(&cache, range, &mut KeyGenerator::seeded(21)).unwrap();
    assert!(first < range / 2);
    assert_eq!(cache.get(first).unwrap(), Some(Value::sample(first)));

    // Same seed draws the same lower-half key, which now exists.
    let second = write_absent_key(&cache, range, &mut KeyGenerator::seeded(21)).unwrap();
    assert_ne!(second, first);
    assert!((range / 2..range).contains(&second));
    assert_eq!(cache.size().unwrap(), 2);
}

#[test]
fn range_query_on_member_returns_window() {
    let config = member_config(&unique_cluster("workload-query"), 1);
    let mut node = NodeLifecycleManager::new(NodeRole::Member);
    node.start(config.clone()).unwrap();
    let cache = node.cache("queryCache").unwrap();

    let workload = WorkloadKind::RangeQuery.build(WorkloadContext {
        config,
        cache: cache.clone(),
    });
    workload.set_up().unwrap();
    assert_eq!(cache.size().unwrap(), 1_000);

    let ids: Vec<u64> = query_and_verify(cache.as_ref(), 2_500.0)
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![3]);
    assert!(query_and_verify(cache.as_ref(), 1_000_000.0).unwrap().is_empty());

    let mut rng = KeyGenerator::seeded(5);
    for _ in 0..50 {
        assert_eq!(workload.test(&mut rng).unwrap(), Outcome::Completed);
    }
}

#[test]
fn query_verification_rejects_record_outside_window() {
    let (cache, ctx) = scripted(1_000, 1);
    *cache.query_results.lock().unwrap() = vec![Record::for_index(3), Record::for_index(5)];

    let err = query_and_verify(cache.as_ref(), 2_500.0).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("invalid record retrieved"), "{msg}");
    assert!(msg.contains("id=5"), "{msg}");

    // No 1000-wide window holds both salaries, so every call fails.
    let workload = WorkloadKind::RangeQuery.build(ctx);
    let err = workload.test(&mut KeyGenerator::seeded(1)).unwrap_err();
    assert!(err.to_string().contains("invalid record retrieved"));
}

#[test]
fn population_reports_failed_workers() {
    let (cache, ctx) = scripted(40, 1);
    cache.reject_odd_puts.store(true, Ordering::SeqCst);

    // With an even worker count every odd index lands on an odd worker.
    let err = populate_records(cache.as_ref(), 40, 4).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("population failed in 2 of 4 workers"), "{msg}");
    assert!(msg.contains("query-populate-1"), "{msg}");
    assert!(msg.contains("rejected key 1"), "{msg}");
    // Healthy workers still wrote every even index.
    assert_eq!(cache.size().unwrap(), 20);

    let workload = WorkloadKind::RangeQuery.build(ctx);
    let err = workload.set_up().unwrap_err();
    assert!(err.to_string().contains("population failed"));
}
