//! Cluster-aware benchmark harness for the holo cache.
//!
//! A [`node::NodeLifecycleManager`] brings up an embedded cluster member (or a
//! remote client), waits for the cluster to converge and hands out caches.
//! A [`driver::BenchmarkDriver`] binds one [`workload::WorkloadKind`] to that
//! node, and [`harness::measure`] runs it on worker threads.

pub mod config;
pub mod driver;
pub mod gate;
pub mod harness;
pub mod node;
pub mod populate;
pub mod port;
pub mod rng;
pub mod workload;

pub use config::{BenchArgs, WorkloadConfig};
pub use driver::BenchmarkDriver;
pub use rng::KeyGenerator;
pub use workload::{FailurePolicy, Outcome, Workload, WorkloadKind};
