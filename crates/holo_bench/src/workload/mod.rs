//! Benchmark workloads.
//!
//! A workload is built once per driver from a [`WorkloadContext`] and its
//! `test` is then called concurrently from many worker threads, each with its
//! own [`KeyGenerator`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use holo_cache::config::{CACHE_DEFAULT, CACHE_QUERY, CACHE_TRANSACTIONAL};
use holo_cache::{Cache, Transaction, Value};
use serde::Serialize;

use crate::config::WorkloadConfig;
use crate::rng::KeyGenerator;

mod bulk_put;
mod bulk_put_tx;
mod put_get_tx;
mod put_tx;
mod range_query;
mod range_query_put;

pub use bulk_put::BulkPut;
pub use bulk_put_tx::BulkPutTx;
pub use put_get_tx::{write_absent_key, PutGetTx};
pub use put_tx::PutTx;
pub use range_query::{populate_records, query_and_verify, random_window_start, RangeQuery};
pub use range_query_put::RangeQueryPut;

/// Result of one successful `test` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// The transaction failed, was rolled back and the failure absorbed.
    RolledBack { error: String },
}

/// What a workload does with a failed transaction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Roll back and return the error.
    Propagate,
    /// Roll back, log, and report [`Outcome::RolledBack`].
    #[default]
    #[value(name = "log")]
    LogAndContinue,
}

/// Shared inputs of every workload.
#[derive(Clone)]
pub struct WorkloadContext {
    pub config: Arc<WorkloadConfig>,
    pub cache: Arc<dyn Cache>,
}

/// A benchmarked unit of work.
pub trait Workload: Send + Sync {
    fn kind(&self) -> WorkloadKind;

    /// One-time preparation before measurement, such as population.
    fn set_up(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// One unit of measured work.
    fn test(&self, rng: &mut KeyGenerator) -> anyhow::Result<Outcome>;
}

/// Selectable workloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadKind {
    BulkPut,
    BulkPutTx,
    PutGetTx,
    PutTx,
    RangeQuery,
    RangeQueryPut,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 6] = [
        WorkloadKind::BulkPut,
        WorkloadKind::BulkPutTx,
        WorkloadKind::PutGetTx,
        WorkloadKind::PutTx,
        WorkloadKind::RangeQuery,
        WorkloadKind::RangeQueryPut,
    ];

    pub fn cache_name(self) -> &'static str {
        match self {
            WorkloadKind::BulkPut => CACHE_DEFAULT,
            WorkloadKind::BulkPutTx | WorkloadKind::PutGetTx | WorkloadKind::PutTx => {
                CACHE_TRANSACTIONAL
            }
            WorkloadKind::RangeQuery | WorkloadKind::RangeQueryPut => CACHE_QUERY,
        }
    }

    pub fn is_transactional(self) -> bool {
        matches!(
            self,
            WorkloadKind::BulkPutTx | WorkloadKind::PutGetTx | WorkloadKind::PutTx
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            WorkloadKind::BulkPut => "BulkPut",
            WorkloadKind::BulkPutTx => "BulkPutTx",
            WorkloadKind::PutGetTx => "PutGetTx",
            WorkloadKind::PutTx => "PutTx",
            WorkloadKind::RangeQuery => "RangeQuery",
            WorkloadKind::RangeQueryPut => "RangeQueryPut",
        }
    }

    pub fn build(self, ctx: WorkloadContext) -> Box<dyn Workload> {
        match self {
            WorkloadKind::BulkPut => Box::new(BulkPut::new(ctx)),
            WorkloadKind::BulkPutTx => Box::new(BulkPutTx::new(ctx)),
            WorkloadKind::PutGetTx => Box::new(PutGetTx::new(ctx)),
            WorkloadKind::PutTx => Box::new(PutTx::new(ctx)),
            WorkloadKind::RangeQuery => Box::new(RangeQuery::new(ctx)),
            WorkloadKind::RangeQueryPut => Box::new(RangeQueryPut::new(ctx)),
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `count` distinct keys from `[0, range)` mapped to themselves.
///
/// Loops until enough distinct keys were drawn, so `count <= range` must
/// hold. Config validation also keeps `range` within `i64`.
pub fn distinct_keys(rng: &mut KeyGenerator, count: usize, range: u64) -> BTreeMap<u64, Value> {
    let mut out = BTreeMap::new();
    while out.len() < count {
        let key = rng.next(range);
        out.insert(key, Value::Int(key as i64));
    }
    out
}

/// Run `body` inside a transaction on `cache`.
///
/// Commits on success. When `body` fails the same handle is rolled back and
/// the error is returned.
pub fn in_transaction<F>(cache: &dyn Cache, body: F) -> anyhow::Result<()>
where
    F: FnOnce(&mut dyn Transaction) -> anyhow::Result<()>,
{
    let mut tx = cache.begin()?;
    match body(&mut *tx) {
        Ok(()) => {
            tx.commit()?;
            Ok(())
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback() {
                tracing::warn!(error = ?rollback, "rollback failed");
            }
            Err(err)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_keys_fill_the_batch() {
        let mut rng = KeyGenerator::seeded(3);
        for (count, range) in [(1, 2), (10, 1_000), (50, 50)] {
            let keys = distinct_keys(&mut rng, count, range);
            assert_eq!(keys.len(), count);
            assert!(keys.keys().all(|k| *k < range));
            assert!(keys.iter().all(|(k, v)| *v == Value::Int(*k as i64)));
        }
    }

    #[test]
    fn kinds_map_to_caches() {
        assert_eq!(WorkloadKind::BulkPut.cache_name(), "cache");
        assert_eq!(WorkloadKind::PutTx.cache_name(), "transactional");
        assert_eq!(WorkloadKind::RangeQueryPut.cache_name(), "queryCache");
        let tx: Vec<_> = WorkloadKind::ALL
            .into_iter()
            .filter(|k| k.is_transactional())
            .collect();
        assert_eq!(
            tx,
            vec![
                WorkloadKind::BulkPutTx,
                WorkloadKind::PutGetTx,
                WorkloadKind::PutTx
            ]
        );
    }

    #[test]
    fn in_transaction_rolls_back_failed_body() {
        let ctx = test_support::context(CACHE_TRANSACTIONAL, WorkloadConfig::default());
        let err = in_transaction(ctx.cache.as_ref(), |tx| {
            tx.put(1, Value::sample(1))?;
            anyhow::bail!("body failed")
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "body failed");
        assert_eq!(ctx.cache.get(1).unwrap(), None);

        in_transaction(ctx.cache.as_ref(), |tx| Ok(tx.put(2, Value::sample(2))?)).unwrap();
        assert_eq!(ctx.cache.get(2).unwrap(), Some(Value::sample(2)));
    }
}
