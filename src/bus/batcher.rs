//! Keyed event batcher.
//!
//! Groups N same-key events into one downstream message to amortize fan-out
//! cost. The timer starts on the first event of a bucket; the bucket flushes
//! when it fills or the timer expires. `stop()` flushes everything pending
//! synchronously.
//!
//! The core is synchronous and owned by the caller's loop (drive
//! `poll_expired` from an interval); this keeps it deterministic to test.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Bucket<T> {
    items: Vec<T>,
    first_at: Instant,
}

pub struct EventBatcher<K: Eq + Hash + Clone, T> {
    max_batch: usize,
    max_wait: Duration,
    buckets: HashMap<K, Bucket<T>>,
    stopped: bool,
}

impl<K: Eq + Hash + Clone, T> EventBatcher<K, T> {
    pub fn new(max_batch: usize, max_wait_ms: u64) -> Self {
        Self {
            max_batch: max_batch.max(1),
            max_wait: Duration::from_millis(max_wait_ms),
            buckets: HashMap::new(),
            stopped: false,
        }
    }

    /// Add an event. Returns the full batch when this event filled it.
    pub fn push(&mut self, key: K, item: T, now: Instant) -> Option<Vec<T>> {
        if self.stopped {
            return Some(vec![item]);
        }
        let bucket = self.buckets.entry(key.clone()).or_insert_with(|| Bucket {
            items: Vec::with_capacity(self.max_batch),
            first_at: now,
        });
        bucket.items.push(item);
        if bucket.items.len() >= self.max_batch {
            return self.buckets.remove(&key).map(|b| b.items);
        }
        None
    }

    /// Flush buckets whose wait timer has expired.
    pub fn poll_expired(&mut self, now: Instant) -> Vec<(K, Vec<T>)> {
        let expired: Vec<K> = self
            .buckets
            .iter()
            .filter(|(_, b)| now.duration_since(b.first_at) >= self.max_wait)
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|k| self.buckets.remove(&k).map(|b| (k, b.items)))
            .collect()
    }

    /// Earliest deadline across pending buckets, for the caller's timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.buckets
            .values()
            .map(|b| b.first_at + self.max_wait)
            .min()
    }

    /// Flush all pending batches. Further pushes pass straight through.
    pub fn stop(&mut self) -> Vec<(K, Vec<T>)> {
        self.stopped = true;
        self.buckets.drain().map(|(k, b)| (k, b.items)).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.buckets.values().map(|b| b.items.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_when_full() {
        let mut batcher: EventBatcher<&str, u32> = EventBatcher::new(3, 5);
        let now = Instant::now();
        assert!(batcher.push("k", 1, now).is_none());
        assert!(batcher.push("k", 2, now).is_none());
        let batch = batcher.push("k", 3, now).expect("third push fills batch");
        assert_eq!(batch, vec![1, 2, 3]);
        assert_eq!(batcher.pending_len(), 0);
    }

    #[test]
    fn test_flush_on_timer_expiry() {
        let mut batcher: EventBatcher<&str, u32> = EventBatcher::new(100, 5);
        let t0 = Instant::now();
        batcher.push("k", 1, t0);
        batcher.push("k", 2, t0);

        // Before the deadline nothing flushes.
        assert!(batcher.poll_expired(t0 + Duration::from_millis(3)).is_empty());
        // At/after the deadline the bucket flushes whole.
        let flushed = batcher.poll_expired(t0 + Duration::from_millis(5));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].1, vec![1, 2]);
    }

    #[test]
    fn test_keys_batch_independently() {
        let mut batcher: EventBatcher<&str, u32> = EventBatcher::new(2, 5);
        let now = Instant::now();
        assert!(batcher.push("a", 1, now).is_none());
        assert!(batcher.push("b", 2, now).is_none());
        // Filling "a" does not flush "b".
        let batch = batcher.push("a", 3, now).unwrap();
        assert_eq!(batch, vec![1, 3]);
        assert_eq!(batcher.pending_len(), 1);
    }

    #[test]
    fn test_stop_flushes_pending() {
        let mut batcher: EventBatcher<&str, u32> = EventBatcher::new(10, 1_000);
        let now = Instant::now();
        batcher.push("a", 1, now);
        batcher.push("b", 2, now);
        let flushed = batcher.stop();
        assert_eq!(flushed.len(), 2);
        assert_eq!(batcher.pending_len(), 0);
        // After stop, pushes pass through unbatched.
        assert_eq!(batcher.push("a", 9, now), Some(vec![9]));
    }

    #[test]
    fn test_next_deadline_tracks_oldest_bucket() {
        let mut batcher: EventBatcher<&str, u32> = EventBatcher::new(10, 5);
        let t0 = Instant::now();
        assert!(batcher.next_deadline().is_none());
        batcher.push("a", 1, t0);
        batcher.push("b", 2, t0 + Duration::from_millis(2));
        assert_eq!(batcher.next_deadline(), Some(t0 + Duration::from_millis(5)));
    }
}
