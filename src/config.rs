use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Shortest heartbeat accepted; a zero period cannot drive a ticker.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Runtime settings for a [`crate::web_server::SyncServer`].
///
/// Everything that varies between deployments (port, origins, limits) is
/// injected here; nothing in the server reads the environment directly.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    /// `0` binds an ephemeral port.
    pub port: u16,
    /// Origins admitted for WebSocket upgrades and CORS. Empty means any
    /// loopback origin.
    pub allowed_origins: Vec<String>,
    pub max_connections: usize,
    pub rate_limit_window: Duration,
    pub rate_limit_max_requests: usize,
    pub heartbeat_interval: Duration,
    pub shutdown_grace: Duration,
    pub max_file_bytes: u64,
    /// How long a watched file must stay unchanged before it is re-read.
    pub stability_threshold: Duration,
    pub poll_interval: Duration,
    /// Outbound frames buffered per session before it counts as stalled.
    pub send_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 3001,
            allowed_origins: Vec::new(),
            max_connections: 100,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max_requests: 100,
            heartbeat_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(1),
            max_file_bytes: 10 * 1024 * 1024,
            stability_threshold: Duration::from_millis(100),
            poll_interval: Duration::from_millis(50),
            send_buffer: 64,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_allowed_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_rate_limit(mut self, window: Duration, max_requests: usize) -> Self {
        self.rate_limit_window = window;
        self.rate_limit_max_requests = max_requests;
        self
    }

    /// Clamped to [`MIN_HEARTBEAT_INTERVAL`].
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_HEARTBEAT_INTERVAL);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}
