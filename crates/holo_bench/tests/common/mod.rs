#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use holo_bench::WorkloadConfig;

/// Ask the OS for a free port on localhost.
pub fn pick_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Occupy `count` consecutive localhost ports. The listeners keep the ports
/// busy until dropped.
pub fn occupy_consecutive_ports(count: u16) -> (u16, Vec<TcpListener>) {
    for _ in 0..50 {
        let base = pick_free_port().expect("port");
        if base.checked_add(count + 1).is_none() {
            continue;
        }
        let held: Vec<TcpListener> = (0..count)
            .filter_map(|i| TcpListener::bind(("127.0.0.1", base + i)).ok())
            .collect();
        // The port right after the block must be free for the endpoint.
        let next_free = TcpListener::bind(("127.0.0.1", base + count)).is_ok();
        if held.len() == count as usize && next_free {
            return (base, held);
        }
    }
    panic!("could not reserve {count} consecutive ports");
}

/// Cluster name unique within this test process.
pub fn unique_cluster(name: &str) -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    format!("{name}-{}-{}", std::process::id(), SEQ.fetch_add(1, Ordering::Relaxed))
}

pub fn member_config(cluster: &str, nodes: usize) -> Arc<WorkloadConfig> {
    Arc::new(WorkloadConfig {
        nodes,
        cluster: Some(cluster.to_string()),
        range: 1_000,
        batch: 20,
        seed: 42,
        ..WorkloadConfig::default()
    })
}
