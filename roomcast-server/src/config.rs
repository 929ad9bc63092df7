use std::{net::IpAddr, time::Duration};

use roomcast_core::CodecConfig;

use crate::rate_limit::{EventLimit, RateLimitConfig};

/// How long the server waits for an answer to a heartbeat probe.
pub(crate) const HEARTBEAT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// How many unanswered probes close the connection.
pub(crate) const HEARTBEAT_PROBE_RETRIES: u32 = 3;

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub host: IpAddr,

    /// TCP port to listen on. `0` picks a free port, useful in tests.
    pub port: u16,

    /// Admission cap: upgrades past this count are rejected with a 503 and
    /// no socket state is allocated.
    pub max_connections: usize,

    /// Idle time after which the server starts probing the connection with
    /// heartbeats.
    pub connection_timeout: Duration,

    /// How long an emitted ack waits before resolving with `ack_timeout`.
    pub ack_timeout: Duration,

    /// Outbound frames buffered per socket before sends fail with
    /// [`SendError::BufferFull`](crate::errors::SendError::BufferFull).
    pub max_buffer_size: usize,

    /// Frame codec settings (compression threshold/level, encryption key).
    pub codec: CodecConfig,

    /// Admission control settings.
    pub rate_limit: RateLimitConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([127, 0, 0, 1]),
            port: 8090,
            max_connections: 10_000,
            connection_timeout: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(30),
            max_buffer_size: 128,
            codec: CodecConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }
}

/// Builder for [`ServerConfig`].
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    /// Bind address. Defaults to 127.0.0.1.
    pub fn host(mut self, host: IpAddr) -> Self {
        self.config.host = host;
        self
    }

    /// TCP port. Defaults to 8090; `0` picks a free port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Admission cap. Defaults to 10 000 connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Idle timeout before heartbeat probing. Defaults to 60 seconds.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Ack wait. Defaults to 30 seconds.
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.ack_timeout = timeout;
        self
    }

    /// Outbound frames buffered per socket. Defaults to 128.
    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.config.max_buffer_size = size;
        self
    }

    /// Minimum payload size before DEFLATE kicks in. Defaults to 1024 bytes.
    pub fn compression_threshold(mut self, threshold: usize) -> Self {
        self.config.codec.compression_threshold = threshold;
        self
    }

    /// DEFLATE level, 1..=9. Defaults to 6.
    pub fn compression_level(mut self, level: u32) -> Self {
        self.config.codec.compression_level = level;
        self
    }

    /// Enables AES-256-CBC payload encryption with a pre-shared key.
    pub fn encryption_key(mut self, key: [u8; 32]) -> Self {
        self.config.codec.encryption_key = Some(key);
        self
    }

    /// Master switch for the rate limiter. Defaults to off.
    pub fn enable_rate_limiting(mut self, enabled: bool) -> Self {
        self.config.rate_limit.enabled = enabled;
        self
    }

    /// Window of the default limiter. Defaults to 1 second.
    pub fn rate_limit_window(mut self, window: Duration) -> Self {
        self.config.rate_limit.window = window;
        self
    }

    /// Frames admitted per window for the default limiter. Defaults to 100.
    pub fn rate_limit_max_requests(mut self, max: usize) -> Self {
        self.config.rate_limit.max_requests = max;
        self
    }

    /// Overrides the limiter for one event name.
    pub fn event_rate_limit(
        mut self,
        event: impl Into<String>,
        window: Duration,
        max_requests: usize,
    ) -> Self {
        self.config.rate_limit.per_event.insert(
            event.into(),
            EventLimit {
                window,
                max_requests,
            },
        );
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = ServerConfig::builder()
            .port(0)
            .max_connections(2)
            .ack_timeout(Duration::from_millis(250))
            .enable_rate_limiting(true)
            .rate_limit_window(Duration::from_millis(1000))
            .rate_limit_max_requests(3)
            .event_rate_limit("bulk", Duration::from_secs(5), 1)
            .build();

        assert_eq!(config.port, 0);
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.ack_timeout, Duration::from_millis(250));
        assert!(config.rate_limit.enabled);
        assert_eq!(config.rate_limit.max_requests, 3);
        assert_eq!(config.rate_limit.per_event["bulk"].max_requests, 1);
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config = ServerConfig::default();
        assert_eq!(config.connection_timeout, Duration::from_secs(60));
        assert_eq!(config.ack_timeout, Duration::from_secs(30));
        assert_eq!(config.codec.compression_threshold, 1024);
        assert_eq!(config.codec.compression_level, 6);
        assert!(config.codec.encryption_key.is_none());
        assert!(!config.rate_limit.enabled);
    }
}
