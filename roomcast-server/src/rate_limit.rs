//! Sliding-window admission control.
//!
//! Each socket carries two limiter surfaces: a global window covering every
//! inbound event, and per-event windows consulted only for events with a
//! registered override. Events without an override fall through to the
//! global window. Denials are soft: the sender is told to back off, the
//! connection stays open.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use dashmap::DashMap;

/// Limiter configuration, part of the server config.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Master switch. When false every frame is admitted.
    pub enabled: bool,
    /// Window length of the default limiter.
    pub window: Duration,
    /// Maximum frames admitted per key within one window.
    pub max_requests: usize,
    /// Per-event overrides, keyed by event name.
    pub per_event: HashMap<String, EventLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window: Duration::from_secs(1),
            max_requests: 100,
            per_event: HashMap::new(),
        }
    }
}

/// An override for a single event name.
#[derive(Debug, Clone, Copy)]
pub struct EventLimit {
    pub window: Duration,
    pub max_requests: usize,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied {
        /// How long until the oldest recorded hit leaves the window.
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Ring of request timestamps truncated to the window length.
#[derive(Debug, Default)]
struct SlidingWindow {
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    fn admit(&mut self, now: Instant, window: Duration, max: usize) -> Admission {
        while let Some(front) = self.hits.front() {
            if now.duration_since(*front) >= window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        if self.hits.len() < max {
            self.hits.push_back(now);
            Admission::Allowed
        } else {
            let oldest = self.hits.front().copied().unwrap_or(now);
            Admission::Denied {
                retry_after: window.saturating_sub(now.duration_since(oldest)),
            }
        }
    }

    fn reset(&mut self) {
        self.hits.clear();
    }
}

/// Per-socket limiter state. Single writer per key: only the socket's
/// dispatch task calls [`admit`](Self::admit).
#[derive(Debug)]
pub(crate) struct SocketRateLimiter {
    config: Arc<RateLimitConfig>,
    global: Mutex<SlidingWindow>,
    per_event: DashMap<String, SlidingWindow>,
}

impl SocketRateLimiter {
    pub(crate) fn new(config: Arc<RateLimitConfig>) -> Self {
        Self {
            config,
            global: Mutex::new(SlidingWindow::default()),
            per_event: DashMap::new(),
        }
    }

    pub(crate) fn admit(&self, event: &str, now: Instant) -> Admission {
        if !self.config.enabled {
            return Admission::Allowed;
        }
        if let Some(limit) = self.config.per_event.get(event) {
            self.per_event
                .entry(event.to_owned())
                .or_default()
                .admit(now, limit.window, limit.max_requests)
        } else {
            self.global
                .lock()
                .unwrap()
                .admit(now, self.config.window, self.config.max_requests)
        }
    }

    /// Clears the window for one event, or the global window when `None`.
    pub(crate) fn reset(&self, event: Option<&str>) {
        match event {
            Some(event) => {
                self.per_event.remove(event);
            }
            None => self.global.lock().unwrap().reset(),
        }
    }

    pub(crate) fn reset_all(&self) {
        self.global.lock().unwrap().reset();
        self.per_event.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(window: Duration, max: usize) -> Arc<RateLimitConfig> {
        Arc::new(RateLimitConfig {
            enabled: true,
            window,
            max_requests: max,
            per_event: HashMap::new(),
        })
    }

    #[test]
    fn admits_up_to_max_within_window() {
        let limiter = SocketRateLimiter::new(config(Duration::from_secs(1), 3));
        let now = Instant::now();
        for _ in 0..3 {
            assert!(limiter.admit("say", now).is_allowed());
        }
        assert!(!limiter.admit("say", now).is_allowed());
    }

    #[test]
    fn window_expiry_readmits() {
        let limiter = SocketRateLimiter::new(config(Duration::from_millis(100), 2));
        let t0 = Instant::now();
        assert!(limiter.admit("say", t0).is_allowed());
        assert!(limiter.admit("say", t0).is_allowed());
        assert!(!limiter.admit("say", t0).is_allowed());
        // after the window the old hits fall out of the ring
        let t1 = t0 + Duration::from_millis(100);
        assert!(limiter.admit("say", t1).is_allowed());
    }

    #[test]
    fn denial_reports_retry_after() {
        let limiter = SocketRateLimiter::new(config(Duration::from_millis(500), 1));
        let t0 = Instant::now();
        assert!(limiter.admit("say", t0).is_allowed());
        match limiter.admit("say", t0 + Duration::from_millis(200)) {
            Admission::Denied { retry_after } => {
                assert_eq!(retry_after, Duration::from_millis(300));
            }
            Admission::Allowed => panic!("expected denial"),
        }
    }

    #[test]
    fn per_event_override_does_not_consume_global_budget() {
        let mut cfg = RateLimitConfig {
            enabled: true,
            window: Duration::from_secs(1),
            max_requests: 1,
            per_event: HashMap::new(),
        };
        cfg.per_event.insert(
            "bulk".to_owned(),
            EventLimit {
                window: Duration::from_secs(1),
                max_requests: 3,
            },
        );
        let limiter = SocketRateLimiter::new(Arc::new(cfg));
        let now = Instant::now();

        for _ in 0..3 {
            assert!(limiter.admit("bulk", now).is_allowed());
        }
        assert!(!limiter.admit("bulk", now).is_allowed());
        // the global window is untouched by the per-event hits
        assert!(limiter.admit("say", now).is_allowed());
        assert!(!limiter.admit("other", now).is_allowed());
    }

    #[test]
    fn disabled_limiter_admits_everything() {
        let limiter = SocketRateLimiter::new(Arc::new(RateLimitConfig::default()));
        let now = Instant::now();
        for _ in 0..1000 {
            assert!(limiter.admit("say", now).is_allowed());
        }
    }

    #[test]
    fn reset_clears_the_ring() {
        let limiter = SocketRateLimiter::new(config(Duration::from_secs(1), 1));
        let now = Instant::now();
        assert!(limiter.admit("say", now).is_allowed());
        assert!(!limiter.admit("say", now).is_allowed());
        limiter.reset(None);
        assert!(limiter.admit("say", now).is_allowed());
    }
}
