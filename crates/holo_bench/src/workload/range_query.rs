use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use holo_cache::record::SALARY_STEP;
use holo_cache::{Cache, RangePredicate, Record, Value};

use super::{Outcome, Workload, WorkloadContext, WorkloadKind};
use crate::populate::run_parallel;
use crate::rng::KeyGenerator;

const PROGRESS_EVERY: u64 = 100_000;

/// Salary range query whose results are checked against the predicate.
pub struct RangeQuery {
    ctx: WorkloadContext,
}

impl RangeQuery {
    pub fn new(ctx: WorkloadContext) -> Self {
        Self { ctx }
    }
}

impl Workload for RangeQuery {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::RangeQuery
    }

    fn set_up(&self) -> anyhow::Result<()> {
        populate_records(self.ctx.cache.as_ref(), self.ctx.config.range, population_workers())
    }

    fn test(&self, rng: &mut KeyGenerator) -> anyhow::Result<Outcome> {
        let min = random_window_start(rng, self.ctx.config.range);
        query_and_verify(self.ctx.cache.as_ref(), min)?;
        Ok(Outcome::Completed)
    }
}

/// Twice the available parallelism.
pub(crate) fn population_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 2
}

/// Fill `[0, range)` with `Record::for_index(i)` at key `i`. Worker `w`
/// writes indexes `w, w + workers, w + 2 * workers, ...`.
pub fn populate_records(cache: &dyn Cache, range: u64, workers: usize) -> anyhow::Result<()> {
    anyhow::ensure!(workers > 0, "population needs at least one worker");
    tracing::info!(range, workers, cache = cache.name(), "populating query data");
    let start = Instant::now();
    let populated = AtomicU64::new(0);
    let stride = workers as u64;

    let errors = run_parallel(
        |worker| {
            let mut i = worker as u64;
            while i < range {
                cache.put(i, Value::Record(Record::for_index(i)))?;
                let done = populated.fetch_add(1, Ordering::Relaxed) + 1;
                if done % PROGRESS_EVERY == 0 {
                    tracing::info!(populated = done, "population progress");
                }
                i += stride;
            }
            Ok(())
        },
        workers,
        "query-populate-",
    )?;

    if !errors.is_empty() {
        for err in &errors {
            tracing::error!(error = %err, "population worker failed");
        }
        anyhow::bail!(
            "population failed in {} of {} workers; first: {}",
            errors.len(),
            workers,
            errors[0]
        );
    }
    tracing::info!(
        populated = populated.load(Ordering::Relaxed),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "finished populating query data"
    );
    Ok(())
}

/// Random window start in `[0, range * 1000)`.
pub fn random_window_start(rng: &mut KeyGenerator, range: u64) -> f64 {
    rng.next_f64() * range as f64 * SALARY_STEP
}

/// Query salaries in `[min, min + 1000)` and check every returned record
/// falls inside. Returns the matching records.
pub fn query_and_verify(cache: &dyn Cache, min: f64) -> anyhow::Result<Vec<Record>> {
    let max = min + SALARY_STEP;
    let predicate = RangePredicate::salary(min, max);
    let records = cache.query(&predicate)?;
    for record in &records {
        anyhow::ensure!(
            record.salary >= min && record.salary < max,
            "invalid record retrieved [min={min}, max={max}, record={record}]"
        );
    }
    Ok(records)
}
