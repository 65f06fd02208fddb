use holo_cache::{Cache, Value};

use super::{in_transaction, Outcome, Workload, WorkloadContext, WorkloadKind};
use crate::rng::KeyGenerator;

/// Read-then-write: reads a lower-half key and writes it when absent,
/// otherwise writes a random upper-half key instead.
pub struct PutGetTx {
    ctx: WorkloadContext,
}

impl PutGetTx {
    pub fn new(ctx: WorkloadContext) -> Self {
        Self { ctx }
    }
}

impl Workload for PutGetTx {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::PutGetTx
    }

    fn test(&self, rng: &mut KeyGenerator) -> anyhow::Result<Outcome> {
        write_absent_key(self.ctx.cache.as_ref(), self.ctx.config.range, rng)?;
        Ok(Outcome::Completed)
    }
}

/// One read-then-write transaction; returns the key that was written.
pub fn write_absent_key(cache: &dyn Cache, range: u64, rng: &mut KeyGenerator) -> anyhow::Result<u64> {
    let half = range / 2;
    let mut written = 0;
    in_transaction(cache, |tx| {
        let mut key = rng.next(half);
        if tx.get(key)?.is_some() {
            key = rng.next_in(half, range);
        }
        tx.put(key, Value::sample(key))?;
        written = key;
        Ok(())
    })?;
    Ok(written)
}
