//! Connection manager configuration

use std::time::Duration;

use crate::errors::{LinkError, LinkResult};

/// Hard upper bound on simultaneous inbound links a publisher can hold
pub const MAX_SUPPORTED_CONNECTIONS: usize = 7;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for a [`ConnectionManager`](crate::ConnectionManager)
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Session name appended to the advertised device name and matched by searchers
    pub session_name: String,
    /// Maximum inbound connections accepted while publishing
    pub max_connections: usize,
    /// Outbound connection attempts per search
    pub connect_attempts: u32,
    /// Delay between outbound connection attempts
    pub connect_retry_delay: Duration,
    /// Write timeout used by message helpers (`None` waits indefinitely)
    pub default_write_timeout: Option<Duration>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            session_name: "btlink".to_string(),
            max_connections: 4,
            connect_attempts: 3,
            connect_retry_delay: Duration::from_millis(200),
            default_write_timeout: None,
        }
    }
}

impl LinkConfig {
    /// Create a configuration for the given session name
    pub fn new(session_name: impl Into<String>) -> Self {
        Self {
            session_name: session_name.into(),
            ..Self::default()
        }
    }

    /// Configuration tuned for in-process tests (fast retries)
    pub fn testing(session_name: impl Into<String>) -> Self {
        Self {
            session_name: session_name.into(),
            connect_attempts: 2,
            connect_retry_delay: Duration::from_millis(5),
            ..Self::default()
        }
    }

    /// Set the session name
    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = name.into();
        self
    }

    /// Set the inbound connection limit
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set outbound connect attempts
    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts;
        self
    }

    /// Set the delay between outbound connect attempts
    pub fn with_connect_retry_delay(mut self, delay: Duration) -> Self {
        self.connect_retry_delay = delay;
        self
    }

    /// Set the write timeout used by message helpers
    pub fn with_default_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_write_timeout = timeout;
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> LinkResult<()> {
        if self.session_name.trim().is_empty() {
            return Err(invalid("session name cannot be empty"));
        }
        if self.max_connections == 0 {
            return Err(invalid("max connections cannot be zero"));
        }
        if self.max_connections > MAX_SUPPORTED_CONNECTIONS {
            return Err(invalid(&format!(
                "max connections cannot exceed {}",
                MAX_SUPPORTED_CONNECTIONS
            )));
        }
        if self.connect_attempts == 0 {
            return Err(invalid("connect attempts cannot be zero"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> LinkError {
    LinkError::InvalidConfiguration {
        reason: reason.to_string(),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = LinkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.connect_attempts, 3);
    }

    #[test]
    fn test_validation_rejects_bad_limits() {
        let config = LinkConfig::default().with_max_connections(0);
        assert!(config.validate().is_err());

        let config = LinkConfig::default().with_max_connections(MAX_SUPPORTED_CONNECTIONS + 1);
        assert!(matches!(
            config.validate(),
            Err(LinkError::InvalidConfiguration { .. })
        ));

        let config = LinkConfig::new("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: LinkConfig = toml::from_str("session_name = \"arena\"\nmax_connections = 2\n").unwrap();
        assert_eq!(config.session_name, "arena");
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.connect_attempts, 3);
        assert_eq!(config.default_write_timeout, None);
    }
}
