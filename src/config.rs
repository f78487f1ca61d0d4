use crate::auth::ProxyCredentials;
use std::fmt;
use std::time::Duration;

/// Default number of concurrently serviced sessions
pub const DEFAULT_MAX_SESSIONS: usize = 100;

/// Default time a client may stay silent before finishing its handshake
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shortest idle timeout a bridge accepts
pub const MIN_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default bound on the outbound TCP connect to the upstream proxy
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default size of each relay pump's buffer
pub const DEFAULT_RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// ProxyEndpoint is the upstream SOCKS5 proxy, fixed for the life of the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub credentials: Option<ProxyCredentials>,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
        }
    }

    /// with_auth applies the desired authentication
    pub fn with_auth(mut self, credentials: Option<ProxyCredentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn requires_authentication(&self) -> bool {
        self.credentials.is_some()
    }

    /// address renders `host:port` in a form `TcpStream::connect` accepts
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address())?;
        if let Some(credentials) = &self.credentials {
            write!(f, ", username: {}", credentials.username)?;
        }
        Ok(())
    }
}

/// BridgeConfig holds everything the relay listener needs at construction
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bind_host: String,
    pub bridge_port: u16,
    pub endpoint: ProxyEndpoint,
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub relay_buffer_size: usize,
}

impl BridgeConfig {
    /// new is a constructor for BridgeConfig listening on localhost
    pub fn new(bridge_port: u16, endpoint: ProxyEndpoint) -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            bridge_port,
            endpoint,
            max_sessions: DEFAULT_MAX_SESSIONS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            relay_buffer_size: DEFAULT_RELAY_BUFFER_SIZE,
        }
    }

    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions.max(1);
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout.max(MIN_IDLE_TIMEOUT);
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_relay_buffer_size(mut self, size: usize) -> Self {
        self.relay_buffer_size = size.max(1);
        self
    }

    /// listen_addr is the local address the bridge binds
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.bridge_port)
    }
}
