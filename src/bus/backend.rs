//! Stream backend abstraction.
//!
//! Production runs against Redis Streams over one multiplexed async
//! connection; tests and degraded local mode run against an in-memory
//! backend with identical semantics (including blocking reads).

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::streams::{StreamPendingReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;

pub type Fields = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub id: String,
    pub fields: Fields,
}

#[derive(Debug, Error)]
pub enum BusError {
    /// Connection-level failure; retried by the client within its budget.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Command-level failure (bad arguments, wrong type, missing group).
    #[error("backend error: {0}")]
    Backend(String),
}

impl BusError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Unavailable(_))
    }
}

fn map_redis_err(e: redis::RedisError) -> BusError {
    if e.is_io_error() || e.is_timeout() || e.is_connection_refusal() || e.is_connection_dropped()
    {
        BusError::Unavailable(e.to_string())
    } else {
        BusError::Backend(e.to_string())
    }
}

/// True for "the stream or group does not exist yet" errors, which health
/// queries must treat as empty rather than failed.
fn is_missing(e: &redis::RedisError) -> bool {
    e.code() == Some("NOGROUP") || e.to_string().contains("no such key")
}

#[async_trait]
pub trait StreamBackend: Send + Sync {
    async fn append(&self, stream: &str, fields: &Fields) -> Result<String, BusError>;

    /// Append many entries in one round-trip (pipelined). All-or-nothing is
    /// NOT guaranteed; callers treat a failure as "retry the whole batch".
    async fn append_batch(&self, stream: &str, entries: &[Fields]) -> Result<Vec<String>, BusError>;

    async fn create_group(&self, stream: &str, group: &str, start_id: &str)
        -> Result<(), BusError>;

    /// Blocking group read: waits up to `block_ms` for new messages.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>, BusError>;

    /// Idempotent: acking an unknown id returns 0.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<u64, BusError>;

    /// 0 when the stream does not exist.
    async fn len(&self, stream: &str) -> Result<u64, BusError>;

    /// 0 when the stream or group does not exist.
    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, BusError>;
}

// ---------------------------------------------------------------------------
// Redis
// ---------------------------------------------------------------------------

/// Redis Streams backend over a shared multiplexed connection. The connection
/// is Clone; redis serializes commands internally, so callers see FIFO
/// semantics without an explicit pool.
pub struct RedisBackend {
    con: redis::aio::MultiplexedConnection,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(map_redis_err)?;
        let con = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(map_redis_err)?;
        Ok(Self { con })
    }
}

#[async_trait]
impl StreamBackend for RedisBackend {
    async fn append(&self, stream: &str, fields: &Fields) -> Result<String, BusError> {
        let mut con = self.con.clone();
        con.xadd(stream, "*", &fields[..])
            .await
            .map_err(map_redis_err)
    }

    async fn append_batch(
        &self,
        stream: &str,
        entries: &[Fields],
    ) -> Result<Vec<String>, BusError> {
        let mut con = self.con.clone();
        let mut pipe = redis::pipe();
        for fields in entries {
            pipe.xadd(stream, "*", &fields[..]);
        }
        pipe.query_async(&mut con).await.map_err(map_redis_err)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), BusError> {
        let mut con = self.con.clone();
        let res: Result<String, redis::RedisError> =
            con.xgroup_create_mkstream(stream, group, start_id).await;
        match res {
            Ok(_) => Ok(()),
            // Group already exists — createGroup is idempotent.
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_err(e)),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>, BusError> {
        let mut con = self.con.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(max_count)
            .block(block_ms as usize);
        let reply: StreamReadReply = con
            .xread_options(&[stream], &[">"], &opts)
            .await
            .map_err(map_redis_err)?;

        let mut out = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let mut fields = Vec::with_capacity(entry.map.len());
                for (k, v) in entry.map {
                    let value: String = redis::from_redis_value(&v).unwrap_or_default();
                    fields.push((k, value));
                }
                out.push(StreamMessage {
                    id: entry.id,
                    fields,
                });
            }
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<u64, BusError> {
        let mut con = self.con.clone();
        con.xack(stream, group, &[id]).await.map_err(map_redis_err)
    }

    async fn len(&self, stream: &str) -> Result<u64, BusError> {
        let mut con = self.con.clone();
        let res: Result<u64, redis::RedisError> = con.xlen(stream).await;
        match res {
            Ok(n) => Ok(n),
            Err(e) if is_missing(&e) => Ok(0),
            Err(e) => Err(map_redis_err(e)),
        }
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, BusError> {
        let mut con = self.con.clone();
        let res: Result<StreamPendingReply, redis::RedisError> = con.xpending(stream, group).await;
        match res {
            Ok(reply) => Ok(reply.count() as u64),
            Err(e) if is_missing(&e) => Ok(0),
            Err(e) => Err(map_redis_err(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

struct MemGroup {
    /// Index into `entries` of the next never-delivered message.
    next_index: usize,
    /// id → entry index, awaiting ack.
    pending: HashMap<String, usize>,
}

struct MemStream {
    next_seq: u64,
    entries: Vec<StreamMessage>,
    groups: HashMap<String, MemGroup>,
    notify: Arc<Notify>,
}

impl MemStream {
    fn new() -> Self {
        Self {
            next_seq: 0,
            entries: Vec::new(),
            groups: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

/// In-memory backend with the same contract as Redis Streams, including
/// blocking reads (woken by a Notify — no polling).
#[derive(Default)]
pub struct MemoryBackend {
    streams: Mutex<HashMap<String, MemStream>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, stream: &str, fields: Fields) -> (String, Arc<Notify>) {
        let mut streams = self.streams.lock();
        let s = streams
            .entry(stream.to_string())
            .or_insert_with(MemStream::new);
        let id = format!("{}-{}", crate::types::now_ms(), s.next_seq);
        s.next_seq += 1;
        s.entries.push(StreamMessage {
            id: id.clone(),
            fields,
        });
        (id, Arc::clone(&s.notify))
    }
}

#[async_trait]
impl StreamBackend for MemoryBackend {
    async fn append(&self, stream: &str, fields: &Fields) -> Result<String, BusError> {
        let (id, notify) = self.push(stream, fields.clone());
        notify.notify_waiters();
        Ok(id)
    }

    async fn append_batch(
        &self,
        stream: &str,
        entries: &[Fields],
    ) -> Result<Vec<String>, BusError> {
        let mut ids = Vec::with_capacity(entries.len());
        let mut last_notify = None;
        for fields in entries {
            let (id, notify) = self.push(stream, fields.clone());
            ids.push(id);
            last_notify = Some(notify);
        }
        if let Some(n) = last_notify {
            n.notify_waiters();
        }
        Ok(ids)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), BusError> {
        let mut streams = self.streams.lock();
        let s = streams
            .entry(stream.to_string())
            .or_insert_with(MemStream::new);
        let next_index = if start_id == "$" { s.entries.len() } else { 0 };
        s.groups.entry(group.to_string()).or_insert(MemGroup {
            next_index,
            pending: HashMap::new(),
        });
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        max_count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>, BusError> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        loop {
            let notify = {
                let mut streams = self.streams.lock();
                let s = match streams.get_mut(stream) {
                    Some(s) => s,
                    None => return Err(BusError::Backend(format!("NOGROUP {}", stream))),
                };
                let notify = Arc::clone(&s.notify);
                let total = s.entries.len();
                let g = s
                    .groups
                    .get_mut(group)
                    .ok_or_else(|| BusError::Backend(format!("NOGROUP {}", group)))?;
                if g.next_index < total {
                    let end = (g.next_index + max_count).min(total);
                    let batch: Vec<StreamMessage> = s.entries[g.next_index..end].to_vec();
                    for (offset, msg) in batch.iter().enumerate() {
                        g.pending.insert(msg.id.clone(), g.next_index + offset);
                    }
                    g.next_index = end;
                    return Ok(batch);
                }
                notify
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(remaining) => return Ok(Vec::new()),
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<u64, BusError> {
        let mut streams = self.streams.lock();
        let Some(s) = streams.get_mut(stream) else {
            return Ok(0);
        };
        let Some(g) = s.groups.get_mut(group) else {
            return Ok(0);
        };
        Ok(if g.pending.remove(id).is_some() { 1 } else { 0 })
    }

    async fn len(&self, stream: &str) -> Result<u64, BusError> {
        let streams = self.streams.lock();
        Ok(streams.get(stream).map_or(0, |s| s.entries.len() as u64))
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, BusError> {
        let streams = self.streams.lock();
        Ok(streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(v: &str) -> Fields {
        vec![("data".to_string(), v.to_string())]
    }

    #[tokio::test]
    async fn test_memory_produce_consume_ack() {
        let backend = MemoryBackend::new();
        backend.create_group("s", "g", "$").await.unwrap();
        backend.append("s", &fields("a")).await.unwrap();
        backend.append("s", &fields("b")).await.unwrap();

        let batch = backend.read_group("s", "g", "c1", 10, 0).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(backend.pending_count("s", "g").await.unwrap(), 2);

        backend.ack("s", "g", &batch[0].id).await.unwrap();
        assert_eq!(backend.pending_count("s", "g").await.unwrap(), 1);
        // Idempotent ack
        assert_eq!(backend.ack("s", "g", &batch[0].id).await.unwrap(), 0);
        assert_eq!(backend.len("s").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_memory_group_start_at_new_only() {
        let backend = MemoryBackend::new();
        backend.append("s", &fields("old")).await.unwrap();
        backend.create_group("s", "g", "$").await.unwrap();
        backend.append("s", &fields("new")).await.unwrap();

        let batch = backend.read_group("s", "g", "c1", 10, 0).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].fields[0].1, "new");
    }

    #[tokio::test]
    async fn test_memory_blocking_read_wakes_on_append() {
        let backend = Arc::new(MemoryBackend::new());
        backend.create_group("s", "g", "$").await.unwrap();

        let reader = Arc::clone(&backend);
        let handle =
            tokio::spawn(async move { reader.read_group("s", "g", "c1", 10, 2_000).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.append("s", &fields("x")).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("reader should wake promptly")
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_blocking_read_times_out_empty() {
        let backend = MemoryBackend::new();
        backend.create_group("s", "g", "$").await.unwrap();
        let start = Instant::now();
        let batch = backend.read_group("s", "g", "c1", 10, 30).await.unwrap();
        assert!(batch.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_memory_missing_stream_defaults() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.len("nope").await.unwrap(), 0);
        assert_eq!(backend.pending_count("nope", "g").await.unwrap(), 0);
        assert_eq!(backend.ack("nope", "g", "1-0").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_batch_append_preserves_order() {
        let backend = MemoryBackend::new();
        backend.create_group("s", "g", "0").await.unwrap();
        let entries: Vec<Fields> = (0..5).map(|i| fields(&i.to_string())).collect();
        let ids = backend.append_batch("s", &entries).await.unwrap();
        assert_eq!(ids.len(), 5);

        let batch = backend.read_group("s", "g", "c1", 10, 0).await.unwrap();
        let got: Vec<&str> = batch.iter().map(|m| m.fields[0].1.as_str()).collect();
        assert_eq!(got, vec!["0", "1", "2", "3", "4"]);
    }
}
