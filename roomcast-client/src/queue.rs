//! Offline emit queue.
//!
//! While the client is not `Open`, emits land in this bounded FIFO. On
//! reconnect the queue is flushed oldest-first before any new emit reaches
//! the transport, preserving the order the application emitted in. A full
//! queue discards its oldest entry; entries older than the TTL are dropped
//! at flush time. Ack timers for queued frames only start when the frame is
//! actually sent.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use roomcast_core::Frame;

#[derive(Debug)]
pub(crate) struct QueuedFrame {
    pub frame: Frame,
    pub queued_at: Instant,
}

#[derive(Debug)]
pub(crate) struct OfflineQueue {
    entries: VecDeque<QueuedFrame>,
    capacity: usize,
    ttl: Duration,
}

impl OfflineQueue {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            ttl,
        }
    }

    /// Appends a frame, returning the evicted oldest entry when the queue
    /// was full.
    pub fn push(&mut self, frame: Frame) -> Option<QueuedFrame> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(QueuedFrame {
            frame,
            queued_at: Instant::now(),
        });
        evicted
    }

    /// Empties the queue, splitting entries into the still-fresh frames (in
    /// queue order) and the expired ones.
    pub fn drain(&mut self, now: Instant) -> (Vec<Frame>, Vec<QueuedFrame>) {
        let mut fresh = Vec::with_capacity(self.entries.len());
        let mut expired = Vec::new();
        for entry in self.entries.drain(..) {
            if now.duration_since(entry.queued_at) > self.ttl {
                expired.push(entry);
            } else {
                fresh.push(entry.frame);
            }
        }
        (fresh, expired)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(n: u64) -> Frame {
        Frame::event("/", "ev", json!({ "n": n }))
    }

    #[test]
    fn drains_in_fifo_order() {
        let mut queue = OfflineQueue::new(10, Duration::from_secs(300));
        for n in 0..3 {
            assert!(queue.push(frame(n)).is_none());
        }
        let (fresh, expired) = queue.drain(Instant::now());
        assert!(expired.is_empty());
        let order: Vec<u64> = fresh
            .iter()
            .map(|f| f.payload.json()["n"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn full_queue_discards_the_oldest() {
        let mut queue = OfflineQueue::new(2, Duration::from_secs(300));
        assert!(queue.push(frame(0)).is_none());
        assert!(queue.push(frame(1)).is_none());
        let evicted = queue.push(frame(2)).expect("oldest entry evicted");
        assert_eq!(evicted.frame.payload.json()["n"], 0);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn expired_entries_are_separated_at_drain() {
        let mut queue = OfflineQueue::new(10, Duration::from_millis(50));
        queue.push(frame(0));
        let later = Instant::now() + Duration::from_millis(100);
        let (fresh, expired) = queue.drain(later);
        assert!(fresh.is_empty());
        assert_eq!(expired.len(), 1);
    }
}
