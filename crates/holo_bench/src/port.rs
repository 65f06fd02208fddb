//! Endpoint port negotiation.
//!
//! Ports `[base, base + budget)` are tried in order. A port already in use
//! moves on to the next one; any other bind failure is fatal. Running out of
//! candidates is not an error: the caller gets `None` and decides.

use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener, ToSocketAddrs};

use anyhow::Context;

pub const DEFAULT_ENDPOINT_PORT: u16 = 11222;
pub const MIN_PORT_ATTEMPTS: usize = 10;

/// Attempts allowed for a cluster of `nodes` members.
pub fn attempt_budget(nodes: usize) -> usize {
    nodes.max(MIN_PORT_ATTEMPTS)
}

/// A successful bind and where it landed.
#[derive(Debug)]
pub struct Negotiated<T> {
    pub addr: SocketAddr,
    pub bound: T,
    /// Ports tried, including the one that succeeded.
    pub attempts: usize,
}

/// Walks a port range on one host until a bind succeeds.
#[derive(Debug, Clone)]
pub struct PortNegotiator {
    host: String,
    ip: IpAddr,
    base: u16,
    budget: usize,
}

impl PortNegotiator {
    pub fn new(host: &str, base: u16, budget: usize) -> anyhow::Result<Self> {
        let ip = match host.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => (host, 0)
                .to_socket_addrs()
                .with_context(|| format!("resolve bind host {host:?}"))?
                .next()
                .map(|addr| addr.ip())
                .with_context(|| format!("bind host {host:?} resolved to nothing"))?,
        };
        Ok(Self {
            host: host.to_string(),
            ip,
            base,
            budget,
        })
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn negotiate<T, F>(&self, mut bind: F) -> anyhow::Result<Option<Negotiated<T>>>
    where
        F: FnMut(SocketAddr) -> io::Result<T>,
    {
        for attempt in 0..self.budget {
            let Ok(port) = u16::try_from(usize::from(self.base) + attempt) else {
                tracing::warn!(host = %self.host, base = self.base, "endpoint port range overflowed");
                break;
            };
            let addr = SocketAddr::new(self.ip, port);
            tracing::info!(host = %self.host, port, attempt = attempt + 1, "binding endpoint");
            match bind(addr) {
                Ok(bound) => {
                    tracing::info!(host = %self.host, port, "endpoint bound");
                    return Ok(Some(Negotiated {
                        addr,
                        bound,
                        attempts: attempt + 1,
                    }));
                }
                Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                    tracing::info!(host = %self.host, port, "port in use, trying next");
                }
                Err(err) => {
                    return Err(anyhow::Error::new(err).context(format!("bind endpoint on {addr}")));
                }
            }
        }
        tracing::warn!(
            host = %self.host,
            base = self.base,
            budget = self.budget,
            "no free endpoint port within budget"
        );
        Ok(None)
    }
}

/// Default binder: a blocking std listener.
pub fn bind_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    TcpListener::bind(addr)
}
