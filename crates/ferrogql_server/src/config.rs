//! Server configuration.

use crate::error::ServerError;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

/// Default read window before a silent peer is dropped.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Default interval between liveness probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Default maximum inbound message size in bytes.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 512_000;

/// Default bound on a single outbound write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Liveness settings of a websocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// How long the reader waits for a ping or pong before giving up.
    pub read_timeout: Duration,
    /// How often the writer sends a ping.
    pub probe_interval: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }
}

impl KeepaliveConfig {
    pub fn new(read_timeout: Duration, probe_interval: Duration) -> Self {
        Self {
            read_timeout,
            probe_interval,
        }
    }

    /// Checks that at least one probe lands inside every read window.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.read_timeout.is_zero() || self.probe_interval.is_zero() {
            return Err(ServerError::config("keepalive durations must be non-zero"));
        }
        if self.probe_interval > self.read_timeout / 2 {
            return Err(ServerError::config(format!(
                "probe interval {:?} must be at most half the read timeout {:?}",
                self.probe_interval, self.read_timeout
            )));
        }
        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Path serving GraphQL over POST and websocket.
    pub path: String,
    /// Pretty-print JSON responses.
    pub pretty: bool,
    /// Accept websocket upgrades.
    pub websocket: bool,
    pub keepalive: KeepaliveConfig,
    /// Largest inbound websocket message accepted, in bytes.
    pub max_frame_size: usize,
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerConfig {
    /// Creates a new config with default values.
    pub fn new() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4000,
            path: "/graphql".to_string(),
            pretty: false,
            websocket: true,
            keepalive: KeepaliveConfig::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    #[must_use]
    pub fn pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    #[must_use]
    pub fn websocket(mut self, enabled: bool) -> Self {
        self.websocket = enabled;
        self
    }

    #[must_use]
    pub fn keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    #[must_use]
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ServerError> {
        self.keepalive.validate()?;
        if self.max_frame_size == 0 {
            return Err(ServerError::config("max frame size must be non-zero"));
        }
        if self.write_timeout.is_zero() {
            return Err(ServerError::config("write timeout must be non-zero"));
        }
        if !self.path.starts_with('/') {
            return Err(ServerError::config(format!(
                "path \"{}\" must start with '/'",
                self.path
            )));
        }
        Ok(())
    }

    /// Resolves the address to bind.
    pub fn socket_addr(&self) -> Result<SocketAddr, ServerError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ServerError::config(format!("invalid address {}:{}: {e}", self.host, self.port)))?
            .next()
            .ok_or_else(|| ServerError::config(format!("no address for {}:{}", self.host, self.port)))
    }

    /// The websocket codec settings derived from this config.
    pub fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_frame_size);
        config.max_frame_size = Some(self.max_frame_size);
        config
    }
}
