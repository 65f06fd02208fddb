//! Minimal measurement loop: run a driver's workload on worker threads for a
//! fixed duration and count what happened.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::Serialize;

use crate::driver::BenchmarkDriver;
use crate::populate::run_parallel;
use crate::rng::KeyGenerator;
use crate::workload::Outcome;

/// Errors beyond this count are only counted, not logged.
const MAX_LOGGED_ERRORS: u64 = 10;

/// Counters of one measurement run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub description: String,
    pub threads: usize,
    pub seed: u64,
    pub operations: u64,
    pub errors: u64,
    pub rolled_back: u64,
    pub elapsed_ms: u64,
}

impl RunSummary {
    /// Operations per second.
    pub fn throughput(&self) -> f64 {
        if self.elapsed_ms == 0 {
            return 0.0;
        }
        self.operations as f64 * 1000.0 / self.elapsed_ms as f64
    }
}

/// Call `driver`'s workload repeatedly on `threads` threads until `duration`
/// has passed. Worker `i` draws keys from `KeyGenerator::for_worker(seed, i)`.
pub fn measure(
    driver: &BenchmarkDriver,
    threads: usize,
    duration: Duration,
    seed: u64,
) -> anyhow::Result<RunSummary> {
    anyhow::ensure!(threads > 0, "--threads must be > 0");
    let workload = driver
        .workload()
        .ok_or_else(|| anyhow::anyhow!("driver is not set up"))?;

    let operations = AtomicU64::new(0);
    let errors = AtomicU64::new(0);
    let rolled_back = AtomicU64::new(0);
    let start = Instant::now();
    let deadline = start + duration;

    let failed = run_parallel(
        |worker| {
            let mut rng = KeyGenerator::for_worker(seed, worker);
            while Instant::now() < deadline {
                match workload.test(&mut rng) {
                    Ok(Outcome::Completed) => {
                        operations.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Outcome::RolledBack { .. }) => {
                        operations.fetch_add(1, Ordering::Relaxed);
                        rolled_back.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        let seen = errors.fetch_add(1, Ordering::Relaxed) + 1;
                        if seen <= MAX_LOGGED_ERRORS {
                            tracing::warn!(worker, error = ?err, "test iteration failed");
                        }
                    }
                }
            }
            Ok(())
        },
        threads,
        "bench-worker-",
    )?;
    if let Some(first) = failed.first() {
        anyhow::bail!("{} benchmark worker(s) died; first: {first}", failed.len());
    }

    let summary = RunSummary {
        description: driver.description(),
        threads,
        seed,
        operations: operations.into_inner(),
        errors: errors.into_inner(),
        rolled_back: rolled_back.into_inner(),
        elapsed_ms: start.elapsed().as_millis() as u64,
    };
    tracing::info!(
        workload = %summary.description,
        operations = summary.operations,
        errors = summary.errors,
        rolled_back = summary.rolled_back,
        ops_per_sec = summary.throughput(),
        "measurement finished"
    );
    Ok(summary)
}

/// Write `summary` as pretty JSON, creating parent directories.
pub fn write_summary(path: &Path, summary: &RunSummary) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(summary).context("serialize summary")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
