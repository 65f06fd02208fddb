//! RESP client implementing [`Cache`] against a remote endpoint.
//!
//! Calls are synchronous: each one blocks on the supplied runtime handle, so
//! a `RemoteCache` must be used from threads that are not themselves driving
//! that runtime.

use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_util::codec::Framed;

use crate::{Cache, CacheError, CacheResult, RangePredicate, Record, Transaction, Value};

const IO_TIMEOUT: Duration = Duration::from_secs(10);

type Conn = Framed<TcpStream, Resp2>;

/// Remote view of one named cache.
pub struct RemoteCache {
    name: String,
    servers: Vec<SocketAddr>,
    handle: Handle,
    pool: Mutex<Vec<Conn>>,
    next_server: AtomicUsize,
}

impl RemoteCache {
    /// Open a client for cache `name`. One connection is established up
    /// front so an unreachable endpoint or unknown cache fails here.
    pub fn connect(name: &str, servers: Vec<SocketAddr>, handle: Handle) -> CacheResult<Self> {
        if servers.is_empty() {
            return Err(CacheError::Transport("no server addresses".into()));
        }
        let cache = Self {
            name: name.to_string(),
            servers,
            handle,
            pool: Mutex::new(Vec::new()),
            next_server: AtomicUsize::new(0),
        };
        let conn = cache.open()?;
        cache.release(conn);
        Ok(cache)
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    fn open(&self) -> CacheResult<Conn> {
        let idx = self.next_server.fetch_add(1, Ordering::Relaxed) % self.servers.len();
        let addr = self.servers[idx];
        let name = self.name.clone();
        let mut conn = self
            .handle
            .block_on(async move {
                let mut conn = connect(addr).await?;
                let resp = exchange(&mut conn, command(&[b"USE", name.as_bytes()])).await?;
                Ok::<_, anyhow::Error>((conn, resp))
            })
            .map_err(|err| CacheError::Transport(format!("{err:#}")))
            .and_then(|(conn, resp)| expect_ok(resp).map(|_| conn))?;
        tracing::debug!(cache = %self.name, %addr, "remote cache connection opened");
        conn.get_mut().set_nodelay(true).ok();
        Ok(conn)
    }

    fn release(&self, conn: Conn) {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conn);
    }

    fn call(&self, request: BytesFrame) -> CacheResult<BytesFrame> {
        let pooled = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => self.open()?,
        };
        let result = self.handle.block_on(exchange(&mut conn, request));
        match result {
            Ok(BytesFrame::Error(err)) => {
                self.release(conn);
                Err(CacheError::Remote(err.to_string()))
            }
            Ok(frame) => {
                self.release(conn);
                Ok(frame)
            }
            // The connection state is unknown after a transport failure.
            Err(err) => Err(CacheError::Transport(format!("{err:#}"))),
        }
    }
}

impl Cache for RemoteCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: u64) -> CacheResult<Option<Value>> {
        let key = key.to_string();
        match self.call(command(&[b"GET", key.as_bytes()]))? {
            BytesFrame::Null => Ok(None),
            BytesFrame::BulkString(bytes) => Ok(Some(Value::from_json(&bytes)?)),
            other => Err(unexpected("GET", &other)),
        }
    }

    fn put(&self, key: u64, value: Value) -> CacheResult<()> {
        let key = key.to_string();
        let value = value.to_json()?;
        expect_ok(self.call(command(&[b"SET", key.as_bytes(), &value]))?)
    }

    fn put_all(&self, entries: BTreeMap<u64, Value>) -> CacheResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut parts = Vec::with_capacity(1 + entries.len() * 2);
        parts.push(BytesFrame::BulkString(Bytes::from_static(b"MSET")));
        for (key, value) in entries {
            parts.push(BytesFrame::BulkString(Bytes::from(key.to_string())));
            parts.push(BytesFrame::BulkString(Bytes::from(value.to_json()?)));
        }
        expect_ok(self.call(BytesFrame::Array(parts))?)
    }

    fn begin(&self) -> CacheResult<Box<dyn Transaction + '_>> {
        Err(CacheError::TransactionsUnsupported("remote client".into()))
    }

    fn query(&self, predicate: &RangePredicate) -> CacheResult<Vec<Record>> {
        let min = predicate.min.to_string();
        let max = predicate.max.to_string();
        let request = command(&[
            b"QUERY",
            predicate.field.as_str().as_bytes(),
            min.as_bytes(),
            max.as_bytes(),
        ]);
        match self.call(request)? {
            BytesFrame::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        BytesFrame::BulkString(bytes) => out.push(serde_json::from_slice(&bytes)?),
                        other => return Err(unexpected("QUERY", &other)),
                    }
                }
                Ok(out)
            }
            other => Err(unexpected("QUERY", &other)),
        }
    }

    fn size(&self) -> CacheResult<usize> {
        match self.call(command(&[b"DBSIZE"]))? {
            BytesFrame::Integer(n) if n >= 0 => Ok(n as usize),
            other => Err(unexpected("DBSIZE", &other)),
        }
    }
}

async fn connect(node: SocketAddr) -> anyhow::Result<Conn> {
    let socket = tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(node))
        .await
        .with_context(|| format!("connect to {node} timed out"))?
        .with_context(|| format!("connect to {node}"))?;
    Ok(Framed::new(socket, Resp2::default()))
}

async fn exchange(conn: &mut Conn, request: BytesFrame) -> anyhow::Result<BytesFrame> {
    conn.send(request).await?;
    match tokio::time::timeout(IO_TIMEOUT, conn.next()).await {
        Ok(Some(frame)) => Ok(frame?),
        Ok(None) => anyhow::bail!("connection closed by server"),
        Err(_) => anyhow::bail!("timed out waiting for reply"),
    }
}

fn command(parts: &[&[u8]]) -> BytesFrame {
    BytesFrame::Array(
        parts
            .iter()
            .map(|p| BytesFrame::BulkString(Bytes::from(p.to_vec())))
            .collect(),
    )
}

fn expect_ok(resp: BytesFrame) -> CacheResult<()> {
    match resp {
        BytesFrame::SimpleString(s) if s.as_ref() == b"OK" => Ok(()),
        BytesFrame::Error(err) => Err(CacheError::Remote(err.to_string())),
        other => Err(unexpected("command", &other)),
    }
}

fn unexpected(cmd: &str, frame: &BytesFrame) -> CacheError {
    CacheError::Remote(format!("unexpected {cmd} response: {frame:?}"))
}

/// Parse a comma-separated host list. Entries without a port get
/// `default_port`; host names are resolved.
pub fn parse_servers(input: &str, default_port: u16) -> anyhow::Result<Vec<SocketAddr>> {
    let mut out = Vec::new();
    for part in input.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if let Ok(addr) = part.parse::<SocketAddr>() {
            out.push(addr);
            continue;
        }
        let resolved = if part.contains(':') {
            part.to_socket_addrs()
        } else {
            (part, default_port).to_socket_addrs()
        };
        let addr = resolved
            .with_context(|| format!("invalid server address {part:?}"))?
            .next()
            .with_context(|| format!("server address {part:?} resolved to nothing"))?;
        out.push(addr);
    }
    Ok(out)
}
