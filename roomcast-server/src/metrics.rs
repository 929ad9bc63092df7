//! Broker counters. The export format is out of scope; a collector reads a
//! [`CountersSnapshot`] and ships it however it likes.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counters {
    pub(crate) connections_opened: AtomicU64,
    pub(crate) connections_current: AtomicU64,
    pub(crate) connections_rejected: AtomicU64,
    pub(crate) frames_in: AtomicU64,
    pub(crate) frames_out: AtomicU64,
    pub(crate) frame_errors: AtomicU64,
    pub(crate) rate_limited: AtomicU64,
    pub(crate) ack_timeouts: AtomicU64,
    pub(crate) handler_panics: AtomicU64,
}

impl Counters {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decr(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_current: self.connections_current.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            frame_errors: self.frame_errors.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            ack_timeouts: self.ack_timeouts.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the broker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub connections_opened: u64,
    pub connections_current: u64,
    pub connections_rejected: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub frame_errors: u64,
    pub rate_limited: u64,
    pub ack_timeouts: u64,
    pub handler_panics: u64,
}
