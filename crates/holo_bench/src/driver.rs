use std::sync::Arc;

use crate::config::WorkloadConfig;
use crate::node::NodeLifecycleManager;
use crate::rng::KeyGenerator;
use crate::workload::{Outcome, Workload, WorkloadContext, WorkloadKind};

/// Binds one workload to a running node.
///
/// `set_up` starts the node and prepares the workload, `test` is the unit of
/// measured work and may be called from many threads, `tear_down` stops the
/// node.
pub struct BenchmarkDriver {
    kind: WorkloadKind,
    config: Option<Arc<WorkloadConfig>>,
    node: Option<NodeLifecycleManager>,
    workload: Option<Box<dyn Workload>>,
}

impl BenchmarkDriver {
    pub fn new(kind: WorkloadKind) -> Self {
        Self {
            kind,
            config: None,
            node: None,
            workload: None,
        }
    }

    pub fn kind(&self) -> WorkloadKind {
        self.kind
    }

    pub fn set_up(&mut self, config: Arc<WorkloadConfig>) -> anyhow::Result<()> {
        anyhow::ensure!(self.node.is_none(), "driver is already set up");
        if config.client_mode && self.kind.is_transactional() {
            anyhow::bail!(
                "remote client does not support transactions ({} needs an embedded member)",
                self.kind
            );
        }

        let mut node = NodeLifecycleManager::for_config(&config);
        node.start(config.clone())?;
        let cache = node.cache(self.kind.cache_name())?;
        self.node = Some(node);
        self.config = Some(config.clone());

        let workload = self.kind.build(WorkloadContext { config, cache });
        tracing::info!(workload = %self.description(), "setting up workload");
        workload.set_up()?;
        self.workload = Some(workload);
        Ok(())
    }

    /// The prepared workload, once `set_up` succeeded.
    pub fn workload(&self) -> Option<&dyn Workload> {
        self.workload.as_deref()
    }

    pub fn node(&self) -> Option<&NodeLifecycleManager> {
        self.node.as_ref()
    }

    pub fn test(&self, rng: &mut KeyGenerator) -> anyhow::Result<Outcome> {
        let workload = self
            .workload
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("driver is not set up"))?;
        workload.test(rng)
    }

    pub fn tear_down(&mut self) -> anyhow::Result<()> {
        self.workload = None;
        if let Some(mut node) = self.node.take() {
            node.stop();
        }
        Ok(())
    }

    /// Workload name followed by the configuration summary.
    pub fn description(&self) -> String {
        match &self.config {
            Some(config) => format!("{}{}", self.kind.name(), config.description()),
            None => self.kind.name().to_string(),
        }
    }

    pub fn usage(&self) -> String {
        crate::config::usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transactional_workloads_rejected_in_client_mode() {
        let config = Arc::new(WorkloadConfig {
            client_mode: true,
            server_hosts: vec!["127.0.0.1".into()],
            ..WorkloadConfig::default()
        });
        for kind in [
            WorkloadKind::BulkPutTx,
            WorkloadKind::PutGetTx,
            WorkloadKind::PutTx,
        ] {
            let mut driver = BenchmarkDriver::new(kind);
            let err = driver.set_up(config.clone()).unwrap_err();
            assert!(err.to_string().contains("does not support transactions"));
            assert!(driver.node().is_none());
        }
    }

    #[test]
    fn test_before_set_up_fails() {
        let driver = BenchmarkDriver::new(WorkloadKind::BulkPut);
        assert!(driver.test(&mut KeyGenerator::seeded(1)).is_err());
        assert_eq!(driver.description(), "BulkPut");
    }

    #[test]
    fn lifecycle_on_single_member() {
        let config = Arc::new(WorkloadConfig {
            cluster: Some("driver-unit".into()),
            range: 1_000,
            batch: 10,
            ..WorkloadConfig::default()
        });
        let mut driver = BenchmarkDriver::new(WorkloadKind::BulkPut);
        driver.set_up(config).unwrap();
        assert_eq!(
            driver.description(),
            "BulkPut-nn=1-b=0-as=false-cm=false-txc=OPTIMISTIC-txi=REPEATABLE_READ"
        );
        let mut rng = KeyGenerator::seeded(1);
        assert_eq!(driver.test(&mut rng).unwrap(), Outcome::Completed);
        driver.tear_down().unwrap();
        assert!(driver.test(&mut rng).is_err());
    }
}
