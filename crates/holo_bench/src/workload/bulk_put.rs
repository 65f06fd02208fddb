use super::{distinct_keys, Outcome, Workload, WorkloadContext, WorkloadKind};
use crate::rng::KeyGenerator;

/// Writes `batch` distinct random keys with one `put_all`.
pub struct BulkPut {
    ctx: WorkloadContext,
}

impl BulkPut {
    pub fn new(ctx: WorkloadContext) -> Self {
        Self { ctx }
    }
}

impl Workload for BulkPut {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::BulkPut
    }

    fn test(&self, rng: &mut KeyGenerator) -> anyhow::Result<Outcome> {
        let entries = distinct_keys(rng, self.ctx.config.batch, self.ctx.config.range);
        self.ctx.cache.put_all(entries)?;
        Ok(Outcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkloadConfig;
    use crate::workload::test_support::context;

    #[test]
    fn writes_full_batch() {
        let ctx = context(
            "cache",
            WorkloadConfig {
                range: 64,
                batch: 16,
                ..WorkloadConfig::default()
            },
        );
        let workload = BulkPut::new(ctx.clone());
        let mut rng = KeyGenerator::seeded(11);
        assert_eq!(workload.test(&mut rng).unwrap(), Outcome::Completed);
        assert_eq!(ctx.cache.size().unwrap(), 16);
    }
}
