//! Benchmark configuration.
//!
//! Parsed once from the command line into a [`WorkloadConfig`], validated,
//! then shared read-only (`Arc`) by the node, the driver and the workloads.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use holo_cache::config::{ClusterParams, IsolationLevel, TxConcurrency};
use rand::Rng;
use serde::Serialize;

use crate::port::DEFAULT_ENDPOINT_PORT;
use crate::workload::FailurePolicy;

pub const DEFAULT_RANGE: u64 = 1_000_000;
pub const DEFAULT_BATCH: usize = 100;
pub const DEFAULT_CLUSTER: &str = "holo-bench";
/// Port appended to peer hosts when they are used as discovery seeds.
pub const DISCOVERY_PORT: u16 = 7800;
/// Seconds a remote client sleeps before its first request.
pub const CLIENT_WAIT_ENV: &str = "HOLO_BENCH_CLIENT_WAIT_SECS";

/// Command-line options shared by every subcommand that starts a node.
#[derive(Args, Debug, Clone)]
pub struct BenchArgs {
    /// Cluster size a member waits for before it reports ready.
    #[arg(long, env = "HOLO_BENCH_NODES", default_value_t = 1)]
    pub nodes: usize,

    /// Backup copies per key.
    #[arg(long, default_value_t = 0)]
    pub backups: usize,

    /// Key range, keys are drawn from `[0, range)`.
    #[arg(long, default_value_t = DEFAULT_RANGE)]
    pub range: u64,

    /// Entries per bulk write.
    #[arg(long, default_value_t = DEFAULT_BATCH)]
    pub batch: usize,

    /// Asynchronous replication mode for every cache.
    #[arg(long = "async", default_value_t = false)]
    pub async_mode: bool,

    /// Serve caches over the RESP endpoint (members) / talk to it (clients).
    #[arg(long, default_value_t = false)]
    pub client_mode: bool,

    #[arg(long, value_enum, default_value_t = TxConcurrency::Optimistic)]
    pub tx_concurrency: TxConcurrency,

    #[arg(long, value_enum, default_value_t = IsolationLevel::RepeatableRead)]
    pub isolation: IsolationLevel,

    /// What PutTx does with a failed transaction.
    #[arg(long, value_enum, default_value_t = FailurePolicy::LogAndContinue)]
    pub put_tx_failure: FailurePolicy,

    /// JSON store configuration file.
    #[arg(long, env = "HOLO_BENCH_STORE_CONFIG")]
    pub store_config: Option<PathBuf>,

    /// Comma-separated driver hosts.
    #[arg(long, env = "DRIVER_HOSTS", default_value = "")]
    pub driver_hosts: String,

    /// Comma-separated server hosts.
    #[arg(long, env = "SERVER_HOSTS", default_value = "")]
    pub server_hosts: String,

    /// Address the RESP endpoint binds to.
    #[arg(long, env = "LOCAL_IP", default_value = "127.0.0.1")]
    pub bind_host: String,

    /// First port tried for the RESP endpoint.
    #[arg(long, default_value_t = DEFAULT_ENDPOINT_PORT)]
    pub endpoint_port: u16,

    /// Cluster name. Falls back to the store config, then to `holo-bench`.
    #[arg(long, env = "HOLO_BENCH_CLUSTER")]
    pub cluster: Option<String>,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

impl BenchArgs {
    pub fn into_config(self) -> anyhow::Result<Arc<WorkloadConfig>> {
        // Use a random seed when the user provides zero.
        let seed = if self.seed == 0 {
            rand::thread_rng().gen()
        } else {
            self.seed
        };
        let config = WorkloadConfig {
            nodes: self.nodes,
            backups: self.backups,
            range: self.range,
            batch: self.batch,
            async_mode: self.async_mode,
            client_mode: self.client_mode,
            tx_concurrency: self.tx_concurrency,
            isolation: self.isolation,
            put_tx_failure: self.put_tx_failure,
            store_config: self.store_config,
            driver_hosts: split_hosts(&self.driver_hosts),
            server_hosts: split_hosts(&self.server_hosts),
            bind_host: self.bind_host,
            endpoint_port: self.endpoint_port,
            cluster: self.cluster.filter(|c| !c.is_empty()),
            seed,
            client_wait: Duration::from_secs(read_env_u64(CLIENT_WAIT_ENV, 0)),
        };
        config.validate()?;
        Ok(Arc::new(config))
    }
}

/// Help text for the node options.
pub fn usage() -> String {
    let mut cmd = BenchArgs::augment_args(clap::Command::new("holo-bench"));
    cmd.render_help().to_string()
}

/// Validated benchmark settings shared by every component.
#[derive(Clone, Debug, Serialize)]
pub struct WorkloadConfig {
    pub nodes: usize,
    pub backups: usize,
    pub range: u64,
    pub batch: usize,
    pub async_mode: bool,
    pub client_mode: bool,
    pub tx_concurrency: TxConcurrency,
    pub isolation: IsolationLevel,
    pub put_tx_failure: FailurePolicy,
    pub store_config: Option<PathBuf>,
    pub driver_hosts: Vec<String>,
    pub server_hosts: Vec<String>,
    pub bind_host: String,
    pub endpoint_port: u16,
    pub cluster: Option<String>,
    pub seed: u64,
    pub client_wait: Duration,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            nodes: 1,
            backups: 0,
            range: DEFAULT_RANGE,
            batch: DEFAULT_BATCH,
            async_mode: false,
            client_mode: false,
            tx_concurrency: TxConcurrency::default(),
            isolation: IsolationLevel::default(),
            put_tx_failure: FailurePolicy::default(),
            store_config: None,
            driver_hosts: Vec::new(),
            server_hosts: Vec::new(),
            bind_host: "127.0.0.1".to_string(),
            endpoint_port: DEFAULT_ENDPOINT_PORT,
            cluster: None,
            seed: 1,
            client_wait: Duration::ZERO,
        }
    }
}

impl WorkloadConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.nodes > 0, "--nodes must be > 0");
        anyhow::ensure!(self.range >= 2, "--range must be >= 2");
        // Bulk puts store each key as an `i64` value.
        anyhow::ensure!(
            i64::try_from(self.range).is_ok(),
            "--range must not exceed {}",
            i64::MAX
        );
        anyhow::ensure!(self.batch > 0, "--batch must be > 0");
        anyhow::ensure!(
            self.batch as u64 <= self.range,
            "--batch ({}) must not exceed --range ({})",
            self.batch,
            self.range
        );
        anyhow::ensure!(!self.bind_host.is_empty(), "--bind-host must not be empty");
        Ok(())
    }

    /// Configuration suffix used in benchmark descriptions.
    pub fn description(&self) -> String {
        format!(
            "-nn={}-b={}-as={}-cm={}-txc={}-txi={}",
            self.nodes,
            self.backups,
            self.async_mode,
            self.client_mode,
            self.tx_concurrency,
            self.isolation
        )
    }

    /// Driver hosts followed by server hosts, without duplicates.
    pub fn peer_hosts(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for host in self.driver_hosts.iter().chain(self.server_hosts.iter()) {
            if !out.contains(host) {
                out.push(host.clone());
            }
        }
        out
    }

    /// Hosts a remote client connects to: servers when given, else all peers.
    pub fn client_servers(&self) -> Vec<String> {
        if self.server_hosts.is_empty() {
            self.peer_hosts()
        } else {
            self.server_hosts.clone()
        }
    }

    /// Cluster discovery seeds in `host[port]` form.
    pub fn discovery_seeds(&self) -> Vec<String> {
        self.peer_hosts()
            .into_iter()
            .map(|host| format!("{host}[{DISCOVERY_PORT}]"))
            .collect()
    }

    pub fn cluster_params(&self) -> ClusterParams {
        ClusterParams {
            backups: self.backups,
            async_mode: self.async_mode,
            concurrency: self.tx_concurrency,
            isolation: self.isolation,
        }
    }
}

fn split_hosts(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serial_test::serial;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        args: BenchArgs,
    }

    #[test]
    fn validate_rejects_batch_larger_than_range() {
        let config = WorkloadConfig {
            range: 10,
            batch: 11,
            ..WorkloadConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("--batch"));

        let config = WorkloadConfig {
            range: 1,
            batch: 1,
            ..WorkloadConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(WorkloadConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_range_beyond_i64() {
        let config = WorkloadConfig {
            range: i64::MAX as u64 + 1,
            ..WorkloadConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("--range must not exceed"));

        let config = WorkloadConfig {
            range: i64::MAX as u64,
            ..WorkloadConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn put_tx_failure_flag_selects_policy() {
        let cli = Cli::try_parse_from(["holo-bench", "--seed", "1"]).unwrap();
        assert_eq!(cli.args.put_tx_failure, FailurePolicy::LogAndContinue);

        let cli =
            Cli::try_parse_from(["holo-bench", "--put-tx-failure", "propagate", "--seed", "1"])
                .unwrap();
        let config = cli.args.into_config().unwrap();
        assert_eq!(config.put_tx_failure, FailurePolicy::Propagate);

        assert!(Cli::try_parse_from(["holo-bench", "--put-tx-failure", "ignore"]).is_err());
    }

    #[test]
    fn description_lists_cluster_shape() {
        let config = WorkloadConfig {
            nodes: 3,
            backups: 1,
            tx_concurrency: TxConcurrency::Pessimistic,
            ..WorkloadConfig::default()
        };
        assert_eq!(
            config.description(),
            "-nn=3-b=1-as=false-cm=false-txc=PESSIMISTIC-txi=REPEATABLE_READ"
        );
    }

    #[test]
    fn peers_become_discovery_seeds() {
        let config = WorkloadConfig {
            driver_hosts: vec!["10.0.0.1".into(), "10.0.0.2".into()],
            server_hosts: vec!["10.0.0.2".into(), "10.0.0.3".into()],
            ..WorkloadConfig::default()
        };
        assert_eq!(
            config.discovery_seeds(),
            vec!["10.0.0.1[7800]", "10.0.0.2[7800]", "10.0.0.3[7800]"]
        );
        assert_eq!(config.client_servers(), vec!["10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    #[serial]
    fn args_parse_with_env_fallbacks() {
        env::set_var("SERVER_HOSTS", "a, b,,c");
        env::set_var(CLIENT_WAIT_ENV, "3");
        let cli = Cli::try_parse_from([
            "holo-bench",
            "--nodes",
            "2",
            "--range",
            "500",
            "--async",
            "--isolation",
            "serializable",
            "--seed",
            "9",
        ])
        .unwrap();
        let config = cli.args.into_config().unwrap();
        env::remove_var("SERVER_HOSTS");
        env::remove_var(CLIENT_WAIT_ENV);

        assert_eq!(config.nodes, 2);
        assert_eq!(config.range, 500);
        assert!(config.async_mode);
        assert_eq!(config.isolation, IsolationLevel::Serializable);
        assert_eq!(config.server_hosts, vec!["a", "b", "c"]);
        assert_eq!(config.seed, 9);
        assert_eq!(config.client_wait, Duration::from_secs(3));
    }

    #[test]
    fn usage_mentions_flags() {
        let text = usage();
        assert!(text.contains("--tx-concurrency"));
        assert!(text.contains("--client-mode"));
    }
}
