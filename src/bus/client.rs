//! Stream bus client: retry policy over a backend.
//!
//! Transient backend errors are retried with exponential backoff up to the
//! configured budget; after that the error surfaces to the owning service,
//! which enters a degraded state. Missing streams/groups are never failures
//! for health queries.

use crate::bus::backend::{BusError, Fields, StreamBackend, StreamMessage};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const RETRY_BASE_MS: u64 = 50;

#[derive(Clone)]
pub struct StreamBus {
    backend: Arc<dyn StreamBackend>,
    retry_budget: u32,
}

impl StreamBus {
    pub fn new(backend: Arc<dyn StreamBackend>, retry_budget: u32) -> Self {
        Self {
            backend,
            retry_budget,
        }
    }

    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, BusError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, BusError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.retry_budget => {
                    let delay = RETRY_BASE_MS * 2u64.saturating_pow(attempt);
                    warn!(
                        "bus {} transient error (attempt {}/{}): {} — retrying in {}ms",
                        what,
                        attempt + 1,
                        self.retry_budget,
                        e,
                        delay
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Append one entry; returns the server-assigned monotonic id.
    pub async fn produce(&self, stream: &str, fields: Fields) -> Result<String, BusError> {
        self.with_retries("produce", || self.backend.append(stream, &fields))
            .await
    }

    /// Append a batch in one round-trip.
    pub async fn produce_batch(
        &self,
        stream: &str,
        entries: &[Fields],
    ) -> Result<Vec<String>, BusError> {
        self.with_retries("produce_batch", || self.backend.append_batch(stream, entries))
            .await
    }

    /// Idempotent. `start_id` of "$" means "only new messages".
    pub async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), BusError> {
        self.with_retries("create_group", || {
            self.backend.create_group(stream, group, start_id)
        })
        .await
    }

    /// Blocking group read. NOT retried: the caller's read loop is the retry.
    pub async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>, BusError> {
        self.backend
            .read_group(stream, group, consumer, max_count, block_ms)
            .await
    }

    pub async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<u64, BusError> {
        self.with_retries("ack", || self.backend.ack(stream, group, id))
            .await
    }

    /// Stream length; 0 when the stream does not exist.
    pub async fn stream_len(&self, stream: &str) -> Result<u64, BusError> {
        self.with_retries("stream_len", || self.backend.len(stream))
            .await
    }

    /// Pending (delivered, unacked) count; 0 when stream/group do not exist.
    pub async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, BusError> {
        self.with_retries("pending_count", || self.backend.pending_count(stream, group))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::backend::MemoryBackend;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend that fails transiently N times before succeeding.
    struct FlakyBackend {
        inner: MemoryBackend,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl StreamBackend for FlakyBackend {
        async fn append(&self, stream: &str, fields: &Fields) -> Result<String, BusError> {
            if self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            }).is_ok()
            {
                return Err(BusError::Unavailable("connection reset".into()));
            }
            self.inner.append(stream, fields).await
        }

        async fn append_batch(
            &self,
            stream: &str,
            entries: &[Fields],
        ) -> Result<Vec<String>, BusError> {
            self.inner.append_batch(stream, entries).await
        }

        async fn create_group(
            &self,
            stream: &str,
            group: &str,
            start_id: &str,
        ) -> Result<(), BusError> {
            self.inner.create_group(stream, group, start_id).await
        }

        async fn read_group(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            max_count: usize,
            block_ms: u64,
        ) -> Result<Vec<StreamMessage>, BusError> {
            self.inner
                .read_group(stream, group, consumer, max_count, block_ms)
                .await
        }

        async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<u64, BusError> {
            self.inner.ack(stream, group, id).await
        }

        async fn len(&self, stream: &str) -> Result<u64, BusError> {
            self.inner.len(stream).await
        }

        async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, BusError> {
            self.inner.pending_count(stream, group).await
        }
    }

    fn fields() -> Fields {
        vec![("data".to_string(), "{}".to_string())]
    }

    #[tokio::test]
    async fn test_produce_retries_transient_errors() {
        let backend = Arc::new(FlakyBackend {
            inner: MemoryBackend::new(),
            failures_left: AtomicU32::new(2),
        });
        let bus = StreamBus::new(backend, 3);
        let id = bus.produce("s", fields()).await.unwrap();
        assert!(!id.is_empty());
        assert_eq!(bus.stream_len("s").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_produce_fails_after_budget() {
        let backend = Arc::new(FlakyBackend {
            inner: MemoryBackend::new(),
            failures_left: AtomicU32::new(10),
        });
        let bus = StreamBus::new(backend, 2);
        let err = bus.produce("s", fields()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_roundtrip_counts_consistent() {
        let bus = StreamBus::new(Arc::new(MemoryBackend::new()), 2);
        bus.create_group("s", "g", "$").await.unwrap();
        bus.produce("s", fields()).await.unwrap();
        bus.produce("s", fields()).await.unwrap();

        let batch = bus.consume("s", "g", "c1", 10, 0).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(bus.pending_count("s", "g").await.unwrap(), 2);

        for msg in &batch {
            bus.ack("s", "g", &msg.id).await.unwrap();
        }
        assert_eq!(bus.pending_count("s", "g").await.unwrap(), 0);
        assert_eq!(bus.stream_len("s").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_health_queries_on_missing_stream() {
        let bus = StreamBus::new(Arc::new(MemoryBackend::new()), 2);
        assert_eq!(bus.stream_len("missing").await.unwrap(), 0);
        assert_eq!(bus.pending_count("missing", "g").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_group_idempotent() {
        let bus = StreamBus::new(Arc::new(MemoryBackend::new()), 2);
        bus.create_group("s", "g", "$").await.unwrap();
        bus.create_group("s", "g", "$").await.unwrap();
    }
}
