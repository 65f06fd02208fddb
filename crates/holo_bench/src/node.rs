//! Node lifecycle: bring a cluster member or a remote client online, wait
//! for convergence and hand out caches.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use holo_cache::cluster::{self, ClusterMember};
use holo_cache::config::{StoreConfig, CACHE_DEFAULT, STANDARD_CACHES};
use holo_cache::remote::parse_servers;
use holo_cache::resp_server::{self, CacheMap};
use holo_cache::{Cache, RemoteCache};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;

use crate::config::{WorkloadConfig, DEFAULT_CLUSTER};
use crate::gate::ConvergenceGate;
use crate::port::{attempt_budget, bind_tcp, PortNegotiator};

/// What kind of node a manager runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    /// Embedded cluster member holding data.
    Member,
    /// Remote client talking to members over RESP.
    Client,
}

/// Lifecycle state. A manager that was never started reports `Stopped`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Starting,
    AwaitingConvergence,
    Ready,
    Stopped,
}

/// RESP endpoint served by a member.
struct Endpoint {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

/// Owns one node: its cluster membership or remote connections, the
/// endpoint and the runtime behind them.
pub struct NodeLifecycleManager {
    role: NodeRole,
    state: NodeState,
    member: Option<ClusterMember>,
    listener: Option<thread::JoinHandle<()>>,
    runtime: Option<Runtime>,
    endpoint: Option<Endpoint>,
    servers: Vec<SocketAddr>,
    remote_caches: HashMap<String, Arc<dyn Cache>>,
}

impl NodeLifecycleManager {
    pub fn new(role: NodeRole) -> Self {
        Self {
            role,
            state: NodeState::Stopped,
            member: None,
            listener: None,
            runtime: None,
            endpoint: None,
            servers: Vec::new(),
            remote_caches: HashMap::new(),
        }
    }

    /// Role implied by the configuration: client mode drivers are clients.
    pub fn for_config(config: &WorkloadConfig) -> Self {
        if config.client_mode {
            Self::new(NodeRole::Client)
        } else {
            Self::new(NodeRole::Member)
        }
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Address of the RESP endpoint, when one is running.
    pub fn endpoint_addr(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref().map(|e| e.addr)
    }

    pub fn usage(&self) -> String {
        crate::config::usage()
    }

    /// Bring the node online. Members return once the cluster has reached
    /// `config.nodes` members.
    pub fn start(&mut self, config: Arc<WorkloadConfig>) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.state == NodeState::Stopped,
            "node is already {:?}",
            self.state
        );
        config.validate()?;
        self.state = NodeState::Starting;
        let result = match self.role {
            NodeRole::Member => self.start_member(&config),
            NodeRole::Client => self.start_client(&config),
        };
        if let Err(err) = result {
            self.stop();
            return Err(err);
        }
        self.state = NodeState::Ready;
        tracing::info!(role = ?self.role, "node ready");
        Ok(())
    }

    fn start_member(&mut self, config: &WorkloadConfig) -> anyhow::Result<()> {
        let store = match &config.store_config {
            Some(path) => StoreConfig::load(path)?,
            None => StoreConfig::default(),
        };
        let cluster_name = config
            .cluster
            .clone()
            .or_else(|| store.cluster_name.clone())
            .unwrap_or_else(|| DEFAULT_CLUSTER.to_string());
        let seeds = config.discovery_seeds();
        tracing::info!(cluster = %cluster_name, seeds = ?seeds, "joining cluster");
        let member = cluster::join_cluster(&cluster_name, seeds)
            .with_context(|| format!("join cluster {cluster_name}"))?;

        let params = config.cluster_params();
        let mut exposed = CacheMap::new();
        for name in STANDARD_CACHES {
            let settings = store.settings_for(name, &params);
            tracing::info!(
                cache = name,
                mode = ?settings.mode,
                owners = settings.owners,
                transactional = settings.transactional,
                indexed = settings.indexed,
                concurrency = %settings.concurrency,
                isolation = %settings.isolation,
                "started cache"
            );
            let cache: Arc<dyn Cache> = member.define_cache(settings)?;
            exposed.insert(name.to_string(), cache);
        }

        // Subscribe before sampling the size so no join is missed in between.
        let events = member.subscribe()?;
        let gate = Arc::new(ConvergenceGate::new(config.nodes));
        let listener = ConvergenceGate::spawn_listener(gate.clone(), events)
            .context("spawn topology listener")?;
        self.listener = Some(listener);
        let size = member.size();
        self.member = Some(member);

        if config.client_mode {
            self.start_endpoint(config, exposed)?;
        }

        if size >= config.nodes {
            gate.release();
        } else {
            self.state = NodeState::AwaitingConvergence;
            tracing::info!(
                members = size,
                target = config.nodes,
                "waiting for {} more node(s) to start",
                config.nodes - size
            );
            gate.wait();
        }
        Ok(())
    }

    fn start_endpoint(&mut self, config: &WorkloadConfig, caches: CacheMap) -> anyhow::Result<()> {
        let negotiator = PortNegotiator::new(
            &config.bind_host,
            config.endpoint_port,
            attempt_budget(config.nodes),
        )?;
        let Some(negotiated) = negotiator.negotiate(bind_tcp)? else {
            tracing::warn!(
                host = %config.bind_host,
                base = config.endpoint_port,
                "starting without endpoint"
            );
            return Ok(());
        };
        negotiated
            .bound
            .set_nonblocking(true)
            .context("set endpoint listener non-blocking")?;

        let runtime = build_runtime("holo-endpoint")?;
        let listener = {
            let _guard = runtime.enter();
            tokio::net::TcpListener::from_std(negotiated.bound).context("register endpoint listener")?
        };
        let (shutdown, rx) = oneshot::channel();
        let task = runtime.spawn(resp_server::run(listener, Arc::new(caches), rx));
        self.endpoint = Some(Endpoint {
            addr: negotiated.addr,
            shutdown: Some(shutdown),
            task,
        });
        self.runtime = Some(runtime);
        Ok(())
    }

    fn start_client(&mut self, config: &WorkloadConfig) -> anyhow::Result<()> {
        let hosts = config.client_servers();
        anyhow::ensure!(
            !hosts.is_empty(),
            "client mode needs --server-hosts or --driver-hosts"
        );
        self.servers = parse_servers(&hosts.join(","), config.endpoint_port)?;
        let runtime = build_runtime("holo-client")?;
        let handle = runtime.handle().clone();
        self.runtime = Some(runtime);
        if !config.client_wait.is_zero() {
            tracing::info!(
                wait = %humantime::format_duration(config.client_wait),
                "waiting for the servers to start"
            );
            thread::sleep(config.client_wait);
        }
        // Connect now so an unreachable server fails the start.
        let default = RemoteCache::connect(CACHE_DEFAULT, self.servers.clone(), handle)
            .with_context(|| format!("connect to servers {:?}", self.servers))?;
        let default: Arc<dyn Cache> = Arc::new(default);
        self.remote_caches.insert(CACHE_DEFAULT.to_string(), default);
        tracing::info!(servers = ?self.servers, "remote client connected");
        Ok(())
    }

    /// A ready cache by name.
    pub fn cache(&mut self, name: &str) -> anyhow::Result<Arc<dyn Cache>> {
        anyhow::ensure!(
            self.state == NodeState::Ready,
            "node is not ready ({:?})",
            self.state
        );
        match self.role {
            NodeRole::Member => {
                let member = self
                    .member
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("member is not running"))?;
                let cache: Arc<dyn Cache> = member.cache(name)?;
                Ok(cache)
            }
            NodeRole::Client => {
                if let Some(cache) = self.remote_caches.get(name) {
                    return Ok(cache.clone());
                }
                let runtime = self
                    .runtime
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("client runtime is not running"))?;
                let remote =
                    RemoteCache::connect(name, self.servers.clone(), runtime.handle().clone())
                        .with_context(|| format!("connect remote cache {name}"))?;
                let cache: Arc<dyn Cache> = Arc::new(remote);
                self.remote_caches.insert(name.to_string(), cache.clone());
                Ok(cache)
            }
        }
    }

    /// Release everything the node holds. Safe to call repeatedly.
    pub fn stop(&mut self) {
        let was_running = self.state != NodeState::Stopped;
        self.remote_caches.clear();
        if let Some(mut endpoint) = self.endpoint.take() {
            if let Some(shutdown) = endpoint.shutdown.take() {
                let _ = shutdown.send(());
            }
            if let Some(runtime) = &self.runtime {
                match runtime.block_on(endpoint.task) {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => tracing::warn!(error = ?err, "endpoint exited with error"),
                    Err(err) => tracing::warn!(error = ?err, "endpoint task failed"),
                }
            }
        }
        if let Some(mut member) = self.member.take() {
            member.leave();
        }
        if let Some(listener) = self.listener.take() {
            if listener.join().is_err() {
                tracing::warn!("topology listener panicked");
            }
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
        self.servers.clear();
        self.state = NodeState::Stopped;
        if was_running {
            tracing::info!(role = ?self.role, "node stopped");
        }
    }
}

impl Drop for NodeLifecycleManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pending start of an in-process member.
pub type MemberStart = thread::JoinHandle<anyhow::Result<NodeLifecycleManager>>;

/// Start `count` extra members of the configured cluster, each on its own
/// thread since `start` blocks until convergence.
pub fn spawn_members(config: &Arc<WorkloadConfig>, count: usize) -> anyhow::Result<Vec<MemberStart>> {
    let mut pending = Vec::with_capacity(count);
    for i in 0..count {
        let config = config.clone();
        let handle = thread::Builder::new()
            .name(format!("local-member-{i}"))
            .spawn(move || {
                let mut node = NodeLifecycleManager::new(NodeRole::Member);
                node.start(config)?;
                Ok(node)
            })
            .with_context(|| format!("spawn local member {i}"))?;
        pending.push(handle);
    }
    Ok(pending)
}

/// Wait for every pending member to finish starting.
pub fn join_members(pending: Vec<MemberStart>) -> anyhow::Result<Vec<NodeLifecycleManager>> {
    let mut nodes = Vec::with_capacity(pending.len());
    for handle in pending {
        let node = handle
            .join()
            .map_err(|_| anyhow::anyhow!("local member thread panicked"))??;
        nodes.push(node);
    }
    Ok(nodes)
}

fn build_runtime(name: &str) -> anyhow::Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name(name)
        .enable_all()
        .build()
        .with_context(|| format!("build {name} runtime"))
}
