use haze_shared::ConnectionError;
use std::time::Duration;

pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings for one client connection
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    /// Name presented when authenticating
    pub name: String,
    /// Opaque value presented when authenticating
    pub tag: Option<Vec<u8>>,
    /// Bound on the TCP connect and on waiting for the welcome
    pub connect_timeout: Duration,
    pub ping_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            name: "Anonymous".to_string(),
            tag: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn new(server_addr: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, tag: Vec<u8>) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConnectionError> {
        if self.name.trim().is_empty() {
            return Err(ConnectionError::InvalidConfig(
                "name must not be empty".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() || self.ping_timeout.is_zero() {
            return Err(ConnectionError::InvalidConfig(
                "timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
