use holo_cache::Value;

use super::{FailurePolicy, Outcome, Workload, WorkloadContext, WorkloadKind};
use crate::rng::KeyGenerator;

/// Single transactional put. Failed transactions are rolled back and, under
/// the default policy, reported as [`Outcome::RolledBack`] instead of an
/// error.
pub struct PutTx {
    ctx: WorkloadContext,
    policy: FailurePolicy,
}

impl PutTx {
    /// Uses the policy chosen by `--put-tx-failure`.
    pub fn new(ctx: WorkloadContext) -> Self {
        let policy = ctx.config.put_tx_failure;
        Self::with_policy(ctx, policy)
    }

    pub fn with_policy(ctx: WorkloadContext, policy: FailurePolicy) -> Self {
        Self { ctx, policy }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }
}

impl Workload for PutTx {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::PutTx
    }

    fn test(&self, rng: &mut KeyGenerator) -> anyhow::Result<Outcome> {
        let key = rng.next(self.ctx.config.range);
        let mut tx = self.ctx.cache.begin()?;

        let result = match tx.put(key, Value::sample(key)) {
            Ok(()) => tx.commit(),
            Err(err) => {
                if let Err(rollback) = tx.rollback() {
                    tracing::warn!(key, error = ?rollback, "rollback failed");
                }
                Err(err)
            }
        };

        match (result, self.policy) {
            (Ok(()), _) => Ok(Outcome::Completed),
            (Err(err), FailurePolicy::Propagate) => Err(err.into()),
            (Err(err), FailurePolicy::LogAndContinue) => {
                tracing::warn!(key, error = %err, "put transaction rolled back");
                Ok(Outcome::RolledBack {
                    error: err.to_string(),
                })
            }
        }
    }
}
