//! RESP2 endpoint serving named caches to remote clients.
//!
//! Keys are decimal `u64`, values travel as JSON-encoded [`Value`]s. Each
//! connection starts on the default cache and can switch with `USE`.
//!
//! | command | reply |
//! |---|---|
//! | `PING` | `PONG` |
//! | `USE name` | `OK` |
//! | `GET key` | bulk JSON or null |
//! | `SET key json` | `OK` |
//! | `MSET key json [key json ...]` | `OK` |
//! | `QUERY field min max` | array of bulk JSON records |
//! | `DBSIZE` | integer |

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::{BytesFrame, Resp2Frame};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::codec::Framed;

use crate::config::CACHE_DEFAULT;
use crate::{Cache, CacheResult, QueryField, RangePredicate, Value};

/// Caches exposed by an endpoint, by name.
pub type CacheMap = BTreeMap<String, Arc<dyn Cache>>;

/// Parsed endpoint command.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheOp {
    Ping,
    Use { name: String },
    Get { key: u64 },
    Set { key: u64, value: Value },
    MSet { entries: BTreeMap<u64, Value> },
    Query { predicate: RangePredicate },
    DbSize,
}

/// Accept connections until `shutdown` fires or its sender is dropped.
pub async fn run(
    listener: TcpListener,
    caches: Arc<CacheMap>,
    mut shutdown: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, caches = caches.len(), "cache endpoint listening");
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                socket.set_nodelay(true).ok();
                let caches = caches.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_conn(socket, caches).await {
                        tracing::debug!(error = ?err, %peer, "endpoint connection closed");
                    }
                });
            }
        }
    }
    tracing::info!(addr = %local, "cache endpoint stopped");
    Ok(())
}

async fn handle_conn(socket: TcpStream, caches: Arc<CacheMap>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, Resp2::default());
    let mut selected = CACHE_DEFAULT.to_string();

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let resp = match parse_command(frame) {
            Ok(Some(op)) => execute(op, &caches, &mut selected),
            Ok(None) => continue,
            Err(err) => BytesFrame::Error(format!("ERR {err}").into()),
        };
        framed.send(resp).await?;
    }
    Ok(())
}

fn execute(op: CacheOp, caches: &CacheMap, selected: &mut String) -> BytesFrame {
    match op {
        CacheOp::Ping => BytesFrame::SimpleString(Bytes::from_static(b"PONG")),
        CacheOp::Use { name } => {
            if caches.contains_key(&name) {
                *selected = name;
                ok_frame()
            } else {
                BytesFrame::Error(format!("ERR cache {name} is not defined").into())
            }
        }
        op => {
            let Some(cache) = caches.get(selected.as_str()) else {
                return BytesFrame::Error(format!("ERR cache {selected} is not defined").into());
            };
            match apply(cache.as_ref(), op) {
                Ok(frame) => frame,
                Err(err) => BytesFrame::Error(format!("ERR {err}").into()),
            }
        }
    }
}

fn apply(cache: &dyn Cache, op: CacheOp) -> CacheResult<BytesFrame> {
    let frame = match op {
        CacheOp::Get { key } => match cache.get(key)? {
            Some(value) => BytesFrame::BulkString(Bytes::from(value.to_json()?)),
            None => BytesFrame::Null,
        },
        CacheOp::Set { key, value } => {
            cache.put(key, value)?;
            ok_frame()
        }
        CacheOp::MSet { entries } => {
            cache.put_all(entries)?;
            ok_frame()
        }
        CacheOp::Query { predicate } => {
            let records = cache.query(&predicate)?;
            let mut out = Vec::with_capacity(records.len());
            for record in &records {
                out.push(BytesFrame::BulkString(Bytes::from(serde_json::to_vec(record)?)));
            }
            BytesFrame::Array(out)
        }
        CacheOp::DbSize => BytesFrame::Integer(cache.size()? as i64),
        CacheOp::Ping | CacheOp::Use { .. } => ok_frame(),
    };
    Ok(frame)
}

fn ok_frame() -> BytesFrame {
    BytesFrame::SimpleString(Bytes::from_static(b"OK"))
}

pub fn parse_command(frame: BytesFrame) -> anyhow::Result<Option<CacheOp>> {
    let BytesFrame::Array(parts) = frame else {
        anyhow::bail!("expected array frame");
    };

    if parts.is_empty() {
        return Ok(None);
    }

    let cmd = frame_str_upper(&parts[0]).ok_or_else(|| anyhow::anyhow!("invalid command"))?;
    match cmd.as_str() {
        "PING" => Ok(Some(CacheOp::Ping)),
        "USE" => {
            anyhow::ensure!(parts.len() == 2, "USE expects 1 argument");
            let name = parts[1]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("invalid cache name"))?;
            Ok(Some(CacheOp::Use {
                name: name.to_string(),
            }))
        }
        "GET" => {
            anyhow::ensure!(parts.len() == 2, "GET expects 1 argument");
            Ok(Some(CacheOp::Get {
                key: frame_key(&parts[1])?,
            }))
        }
        "SET" => {
            anyhow::ensure!(parts.len() == 3, "SET expects 2 arguments");
            Ok(Some(CacheOp::Set {
                key: frame_key(&parts[1])?,
                value: frame_value(&parts[2])?,
            }))
        }
        "MSET" => {
            anyhow::ensure!(
                parts.len() >= 3 && parts.len() % 2 == 1,
                "MSET expects key/value pairs"
            );
            let mut entries = BTreeMap::new();
            for pair in parts[1..].chunks(2) {
                entries.insert(frame_key(&pair[0])?, frame_value(&pair[1])?);
            }
            Ok(Some(CacheOp::MSet { entries }))
        }
        "QUERY" => {
            anyhow::ensure!(parts.len() == 4, "QUERY expects 3 arguments");
            let field: QueryField = parts[1]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("invalid query field"))?
                .parse()?;
            let min = frame_f64(&parts[2])?;
            let max = frame_f64(&parts[3])?;
            Ok(Some(CacheOp::Query {
                predicate: RangePredicate { field, min, max },
            }))
        }
        "DBSIZE" => {
            anyhow::ensure!(parts.len() == 1, "DBSIZE expects 0 arguments");
            Ok(Some(CacheOp::DbSize))
        }
        other => anyhow::bail!("unknown command {other}"),
    }
}

fn frame_str_upper(frame: &BytesFrame) -> Option<String> {
    frame.as_str().map(|s| s.to_ascii_uppercase())
}

fn frame_key(frame: &BytesFrame) -> anyhow::Result<u64> {
    let raw = frame.as_str().ok_or_else(|| anyhow::anyhow!("invalid key"))?;
    raw.parse::<u64>()
        .map_err(|_| anyhow::anyhow!("invalid key {raw:?}"))
}

fn frame_f64(frame: &BytesFrame) -> anyhow::Result<f64> {
    let raw = frame
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("invalid bound"))?;
    raw.parse::<f64>()
        .map_err(|_| anyhow::anyhow!("invalid bound {raw:?}"))
}

fn frame_value(frame: &BytesFrame) -> anyhow::Result<Value> {
    match frame {
        BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => Ok(Value::from_json(b)?),
        _ => anyhow::bail!("invalid value"),
    }
}
