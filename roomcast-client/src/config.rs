//! Client configuration.

use std::time::Duration;

use roomcast_core::CodecConfig;

/// Exponential backoff multiplier applied per reconnect attempt.
pub(crate) const BACKOFF_MULTIPLIER: f64 = 1.5;

/// Reconnect delays never exceed this cap.
pub(crate) const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Consecutive heartbeat misses that force a reconnect.
pub(crate) const HEARTBEAT_MAX_MISSES: u32 = 3;

/// Configuration for the roomcast client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base WebSocket URL, e.g. `ws://127.0.0.1:8090`.
    pub url: String,

    /// Namespace path appended to the base URL. The effective connection
    /// URL is `url + namespace`: a path join, never a query parameter.
    pub namespace: String,

    /// Handshake timeout.
    pub connect_timeout: Duration,

    /// Initial reconnect delay; attempt `n` waits
    /// `reconnect_delay * 1.5^n`, capped at 60 seconds.
    pub reconnect_delay: Duration,

    /// Reconnect attempts before giving up with `max_reconnect_reached`.
    pub max_reconnect_attempts: u32,

    /// Liveness probe interval.
    pub heartbeat_interval: Duration,

    /// How long a probe waits for its answer before counting as missed.
    pub heartbeat_timeout: Duration,

    /// How long an emitted ack waits before resolving with `ack_timeout`.
    pub ack_timeout: Duration,

    /// Offline queue capacity; the oldest entry is discarded when full.
    pub queue_capacity: usize,

    /// Offline queue entries older than this are dropped at flush time.
    pub queue_ttl: Duration,

    /// Frame codec settings, which must match the server's.
    pub codec: CodecConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            namespace: "/".to_owned(),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: 10,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(30),
            queue_capacity: 1000,
            queue_ttl: Duration::from_secs(300),
            codec: CodecConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// The effective WebSocket URL: base joined with the namespace path.
    pub fn ws_url(&self) -> String {
        let base = self.url.trim_end_matches('/');
        if self.namespace == "/" {
            format!("{base}/")
        } else {
            format!("{base}{}", self.namespace)
        }
    }

    /// Backoff delay for the given attempt, capped.
    pub fn reconnect_delay_for(&self, attempt: u32) -> Duration {
        let delay =
            self.reconnect_delay.as_millis() as f64 * BACKOFF_MULTIPLIER.powi(attempt as i32);
        let capped = delay.min(MAX_RECONNECT_DELAY.as_millis() as f64) as u64;
        Duration::from_millis(capped)
    }

    pub fn should_reconnect(&self, attempt: u32) -> bool {
        attempt < self.max_reconnect_attempts
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: Option<ClientConfig>,
}

impl ClientConfigBuilder {
    fn config(&mut self) -> &mut ClientConfig {
        self.config.get_or_insert_with(ClientConfig::default)
    }

    /// Base WebSocket URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config().url = url.into();
        self
    }

    /// Namespace path, defaults to `/`.
    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        let ns = ns.into();
        assert!(ns.starts_with('/'), "namespace path must start with '/'");
        self.config().namespace = ns;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config().connect_timeout = timeout;
        self
    }

    /// Initial reconnect delay. Defaults to 1 second.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config().reconnect_delay = delay;
        self
    }

    /// Maximum reconnect attempts. Defaults to 10.
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config().max_reconnect_attempts = attempts;
        self
    }

    /// Probe interval. Defaults to 30 seconds.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config().heartbeat_interval = interval;
        self
    }

    /// Probe answer wait. Defaults to 5 seconds.
    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.config().heartbeat_timeout = timeout;
        self
    }

    /// Ack wait. Defaults to 30 seconds.
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config().ack_timeout = timeout;
        self
    }

    /// Offline queue capacity. Defaults to 1000 entries.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config().queue_capacity = capacity;
        self
    }

    /// Offline queue entry TTL. Defaults to 5 minutes.
    pub fn queue_ttl(mut self, ttl: Duration) -> Self {
        self.config().queue_ttl = ttl;
        self
    }

    /// Minimum payload size before DEFLATE kicks in. Defaults to 1024 bytes.
    pub fn compression_threshold(mut self, threshold: usize) -> Self {
        self.config().codec.compression_threshold = threshold;
        self
    }

    /// DEFLATE level, 1..=9. Defaults to 6.
    pub fn compression_level(mut self, level: u32) -> Self {
        self.config().codec.compression_level = level;
        self
    }

    /// Enables AES-256-CBC payload encryption with a pre-shared key.
    pub fn encryption_key(mut self, key: [u8; 32]) -> Self {
        self.config().codec.encryption_key = Some(key);
        self
    }

    pub fn build(mut self) -> ClientConfig {
        self.config.take().unwrap_or_default()
    }
}
