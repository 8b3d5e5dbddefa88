//! Batching producer.
//!
//! Entries accumulate per stream and flush as a single pipelined append when
//! the batch fills or the wait timer (default 5 ms) expires. A flush that
//! still fails after the bus retry budget moves the batch to a bounded
//! dead-letter list tagged by stream name and the producer keeps going —
//! data loss is preferable to unbounded memory growth.

use crate::bus::backend::Fields;
use crate::bus::client::StreamBus;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub stream: String,
    pub fields: Fields,
    pub error: String,
    pub at_ms: u64,
}

/// Bounded dead-letter list for operator inspection. Oldest entries are
/// dropped once the cap is reached.
#[derive(Default)]
pub struct DeadLetterList {
    entries: Mutex<VecDeque<DeadLetter>>,
    cap: usize,
}

impl DeadLetterList {
    fn new(cap: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            cap,
        }
    }

    fn push_all(&self, letters: impl IntoIterator<Item = DeadLetter>) {
        let mut entries = self.entries.lock();
        for letter in letters {
            if entries.len() >= self.cap {
                entries.pop_front();
            }
            entries.push_back(letter);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drain(&self) -> Vec<DeadLetter> {
        self.entries.lock().drain(..).collect()
    }
}

enum Command {
    Entry { stream: String, fields: Fields },
    Flush(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

pub struct BatchingProducer {
    tx: mpsc::Sender<Command>,
    dead_letters: Arc<DeadLetterList>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BatchingProducer {
    pub fn new(bus: StreamBus, batch_max: usize, batch_wait_ms: u64, dead_letter_cap: usize) -> Self {
        let (tx, rx) = mpsc::channel(8_192);
        let dead_letters = Arc::new(DeadLetterList::new(dead_letter_cap));
        let worker_dead = Arc::clone(&dead_letters);
        let task = tokio::spawn(run_worker(
            bus,
            rx,
            batch_max,
            Duration::from_millis(batch_wait_ms),
            worker_dead,
        ));
        Self {
            tx,
            dead_letters,
            task: Mutex::new(Some(task)),
        }
    }

    /// Enqueue one entry. Applies channel backpressure; returns false only
    /// after stop().
    pub async fn publish(&self, stream: &str, fields: Fields) -> bool {
        self.tx
            .send(Command::Entry {
                stream: stream.to_string(),
                fields,
            })
            .await
            .is_ok()
    }

    /// Force all pending batches out now.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Flush everything and stop the worker. A second stop is a no-op.
    pub async fn stop(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Stop(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub fn dead_letters(&self) -> &DeadLetterList {
        &self.dead_letters
    }
}

async fn run_worker(
    bus: StreamBus,
    mut rx: mpsc::Receiver<Command>,
    batch_max: usize,
    batch_wait: Duration,
    dead_letters: Arc<DeadLetterList>,
) {
    // Per-stream pending batches. The timer is armed by the oldest pending
    // entry across all streams.
    let mut pending: HashMap<String, Vec<Fields>> = HashMap::new();
    let mut oldest: Option<Instant> = None;

    loop {
        let deadline = oldest.map(|t| t + batch_wait);
        let command = match deadline {
            Some(at) => match tokio::time::timeout_at(at.into(), rx.recv()).await {
                Ok(cmd) => cmd,
                Err(_) => {
                    // Timer expired — flush everything pending.
                    flush_all(&bus, &mut pending, &dead_letters).await;
                    oldest = None;
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match command {
            Some(Command::Entry { stream, fields }) => {
                let batch = pending.entry(stream.clone()).or_default();
                batch.push(fields);
                if oldest.is_none() {
                    oldest = Some(Instant::now());
                }
                if batch.len() >= batch_max {
                    let entries = pending.remove(&stream).unwrap_or_default();
                    flush_stream(&bus, &stream, entries, &dead_letters).await;
                    if pending.is_empty() {
                        oldest = None;
                    }
                }
            }
            Some(Command::Flush(ack)) => {
                flush_all(&bus, &mut pending, &dead_letters).await;
                oldest = None;
                let _ = ack.send(());
            }
            stop => {
                // Stop command or channel closed: drain anything still
                // queued, flush, acknowledge, exit.
                let ack = match stop {
                    Some(Command::Stop(ack)) => Some(ack),
                    _ => None,
                };
                while let Ok(cmd) = rx.try_recv() {
                    if let Command::Entry { stream, fields } = cmd {
                        pending.entry(stream).or_default().push(fields);
                    }
                }
                flush_all(&bus, &mut pending, &dead_letters).await;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                info!("batching producer stopped");
                return;
            }
        }
    }
}

async fn flush_all(
    bus: &StreamBus,
    pending: &mut HashMap<String, Vec<Fields>>,
    dead_letters: &Arc<DeadLetterList>,
) {
    let streams: Vec<String> = pending.keys().cloned().collect();
    for stream in streams {
        if let Some(entries) = pending.remove(&stream) {
            flush_stream(bus, &stream, entries, dead_letters).await;
        }
    }
}

async fn flush_stream(
    bus: &StreamBus,
    stream: &str,
    entries: Vec<Fields>,
    dead_letters: &Arc<DeadLetterList>,
) {
    if entries.is_empty() {
        return;
    }
    let count = entries.len();
    match bus.produce_batch(stream, &entries).await {
        Ok(_) => debug!("flushed {} entries to {}", count, stream),
        Err(e) => {
            error!(
                "flush of {} entries to {} failed after retry budget: {} — dead-lettering",
                count, stream, e
            );
            let at_ms = crate::types::now_ms();
            let error = e.to_string();
            dead_letters.push_all(entries.into_iter().map(|fields| DeadLetter {
                stream: stream.to_string(),
                fields,
                error: error.clone(),
                at_ms,
            }));
        }
    }
}
