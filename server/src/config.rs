use std::time::Duration;

use crate::network::ServerError;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_MAX_CLIENTS: usize = 32;
pub const DEFAULT_VALIDATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings for one server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to; port 0 picks a free port
    pub bind_addr: String,
    /// Name advertised in every roster snapshot
    pub name: String,
    /// Combined limit for validated members and queued connections
    pub max_clients: usize,
    /// How long a fresh connection may take to authenticate
    pub validation_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            name: "Haze Server".to_string(),
            max_clients: DEFAULT_MAX_CLIENTS,
            validation_timeout: DEFAULT_VALIDATION_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn with_bind_addr(mut self, bind_addr: impl Into<String>) -> Self {
        self.bind_addr = bind_addr.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn with_validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.max_clients == 0 {
            return Err(ServerError::InvalidConfig(
                "max_clients must be at least 1".to_string(),
            ));
        }
        if self.validation_timeout.is_zero() {
            return Err(ServerError::InvalidConfig(
                "validation_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.max_clients, 32);
        assert_eq!(config.validation_timeout, Duration::from_secs(10));
        assert_ok!(config.validate());
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let config = ServerConfig::default().with_max_clients(0);
        assert!(matches!(config.validate(), Err(ServerError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_validation_timeout() {
        let config = ServerConfig::default().with_validation_timeout(Duration::ZERO);
        assert_err!(config.validate());
    }

    #[test]
    fn test_builders() {
        let config = ServerConfig::default()
            .with_bind_addr("0.0.0.0:0")
            .with_name("lobby")
            .with_validation_timeout(Duration::from_millis(250));

        assert_eq!(config.bind_addr, "0.0.0.0:0");
        assert_eq!(config.name, "lobby");
        assert_eq!(config.validation_timeout, Duration::from_millis(250));
    }
}
