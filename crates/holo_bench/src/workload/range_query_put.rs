use holo_cache::{Record, Value};

use super::range_query::population_workers;
use super::{
    populate_records, query_and_verify, random_window_start, Outcome, Workload, WorkloadContext,
    WorkloadKind,
};
use crate::rng::KeyGenerator;

/// Half verified range queries, half single record puts.
pub struct RangeQueryPut {
    ctx: WorkloadContext,
}

impl RangeQueryPut {
    pub fn new(ctx: WorkloadContext) -> Self {
        Self { ctx }
    }
}

impl Workload for RangeQueryPut {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::RangeQueryPut
    }

    fn set_up(&self) -> anyhow::Result<()> {
        populate_records(self.ctx.cache.as_ref(), self.ctx.config.range, population_workers())
    }

    fn test(&self, rng: &mut KeyGenerator) -> anyhow::Result<Outcome> {
        let range = self.ctx.config.range;
        if rng.coin() {
            let min = random_window_start(rng, range);
            query_and_verify(self.ctx.cache.as_ref(), min)?;
        } else {
            let i = rng.next(range);
            self.ctx.cache.put(i, Value::Record(Record::for_index(i)))?;
        }
        Ok(Outcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkloadConfig;
    use crate::workload::test_support::context;

    #[test]
    fn mixed_calls_keep_data_consistent() {
        let ctx = context(
            "queryCache",
            WorkloadConfig {
                range: 200,
                batch: 1,
                ..WorkloadConfig::default()
            },
        );
        let workload = RangeQueryPut::new(ctx.clone());
        let mut rng = KeyGenerator::seeded(4);
        for _ in 0..200 {
            assert_eq!(workload.test(&mut rng).unwrap(), Outcome::Completed);
        }
        assert!(ctx.cache.size().unwrap() <= 200);
    }
}
