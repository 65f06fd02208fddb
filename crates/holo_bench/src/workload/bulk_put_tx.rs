use super::{distinct_keys, in_transaction, Outcome, Workload, WorkloadContext, WorkloadKind};
use crate::rng::KeyGenerator;

/// [`super::BulkPut`] inside a transaction. Failures roll back and propagate.
pub struct BulkPutTx {
    ctx: WorkloadContext,
}

impl BulkPutTx {
    pub fn new(ctx: WorkloadContext) -> Self {
        Self { ctx }
    }
}

impl Workload for BulkPutTx {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::BulkPutTx
    }

    fn test(&self, rng: &mut KeyGenerator) -> anyhow::Result<Outcome> {
        let entries = distinct_keys(rng, self.ctx.config.batch, self.ctx.config.range);
        in_transaction(self.ctx.cache.as_ref(), |tx| {
            tx.put_all(entries)?;
            Ok(())
        })?;
        Ok(Outcome::Completed)
    }
}
