//! Stream consumer: a named member of a consumer group with a blocking read
//! loop and pause/resume for backpressure.
//!
//! Pausing stops new blocking reads; an in-flight read completes normally.
//! Both pause and resume are idempotent. The execution engine pauses its
//! consumer at the work-queue high watermark and resumes at the low
//! watermark, pushing queue pressure back into the stream.

use crate::bus::backend::{BusError, StreamMessage};
use crate::bus::client::StreamBus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

pub struct StreamConsumer {
    bus: StreamBus,
    stream: String,
    group: String,
    consumer: String,
    paused: AtomicBool,
    stopping: AtomicBool,
}

impl StreamConsumer {
    pub fn new(bus: StreamBus, stream: &str, group: &str, consumer: &str) -> Self {
        Self {
            bus,
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            paused: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        }
    }

    /// Create the consumer group (idempotent) starting at new messages.
    pub async fn ensure_group(&self) -> Result<(), BusError> {
        self.bus.create_group(&self.stream, &self.group, "$").await
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("consumer {} on {} paused", self.consumer, self.stream);
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("consumer {} on {} resumed", self.consumer, self.stream);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// One read-loop iteration: returns the next batch, or empty on timeout,
    /// pause, or stop. While paused this sleeps briefly instead of issuing a
    /// blocking read, so resume takes effect within ~20 ms.
    pub async fn next_batch(
        &self,
        max_count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>, BusError> {
        if self.is_stopping() {
            return Ok(Vec::new());
        }
        if self.is_paused() {
            tokio::time::sleep(Duration::from_millis(20)).await;
            return Ok(Vec::new());
        }
        match self
            .bus
            .consume(&self.stream, &self.group, &self.consumer, max_count, block_ms)
            .await
        {
            Ok(batch) => Ok(batch),
            Err(e) if e.is_transient() => {
                warn!(
                    "consumer {} read on {} failed transiently: {} — backing off",
                    self.consumer, self.stream, e
                );
                tokio::time::sleep(Duration::from_millis(250)).await;
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn ack(&self, id: &str) -> Result<u64, BusError> {
        self.bus.ack(&self.stream, &self.group, id).await
    }

    pub fn stream_name(&self) -> &str {
        &self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::backend::{MemoryBackend, StreamBackend};
    use std::sync::Arc;

    fn fields(v: &str) -> crate::bus::Fields {
        vec![("data".to_string(), v.to_string())]
    }

    async fn setup() -> (StreamBus, StreamConsumer) {
        let backend = Arc::new(MemoryBackend::new()) as Arc<dyn StreamBackend>;
        let bus = StreamBus::new(backend, 2);
        let consumer = StreamConsumer::new(bus.clone(), "s", "g", "c1");
        consumer.ensure_group().await.unwrap();
        (bus, consumer)
    }

    #[tokio::test]
    async fn test_consume_and_ack() {
        let (bus, consumer) = setup().await;
        bus.produce("s", fields("a")).await.unwrap();

        let batch = consumer.next_batch(10, 100).await.unwrap();
        assert_eq!(batch.len(), 1);
        consumer.ack(&batch[0].id).await.unwrap();
        assert_eq!(bus.pending_count("s", "g").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pause_skips_reads_resume_reenters() {
        let (bus, consumer) = setup().await;
        bus.produce("s", fields("a")).await.unwrap();

        consumer.pause();
        assert!(consumer.is_paused());
        // Paused: no read issued, message stays undelivered.
        let batch = consumer.next_batch(10, 100).await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(bus.pending_count("s", "g").await.unwrap(), 0);

        consumer.resume();
        assert!(!consumer.is_paused());
        let batch = consumer.next_batch(10, 100).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_pause_resume_idempotent() {
        let (_bus, consumer) = setup().await;
        consumer.pause();
        consumer.pause();
        assert!(consumer.is_paused());
        consumer.resume();
        consumer.resume();
        assert!(!consumer.is_paused());
    }

    #[tokio::test]
    async fn test_stop_returns_empty() {
        let (bus, consumer) = setup().await;
        bus.produce("s", fields("a")).await.unwrap();
        consumer.stop();
        let batch = consumer.next_batch(10, 100).await.unwrap();
        assert!(batch.is_empty());
    }
}
