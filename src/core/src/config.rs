use serde::{Deserialize, Serialize};

use crate::error::{BoxError, Result};

/// Default name of the Dockerfile entry inside a build context.
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// Build interception configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildProxyConfig {
    /// Port the intercepting proxy listens on (also tags injected labels)
    pub proxy_port: u16,

    /// PEM-encoded CA certificate injected into every build stage
    pub ca_certificate: String,

    /// Path of the Dockerfile entry within the build context
    pub dockerfile: String,
}

impl Default for BuildProxyConfig {
    fn default() -> Self {
        Self {
            proxy_port: 8000,
            ca_certificate: String::new(),
            dockerfile: DEFAULT_DOCKERFILE.to_string(),
        }
    }
}

impl BuildProxyConfig {
    /// Create a configuration for the given proxy port and CA certificate.
    pub fn new(proxy_port: u16, ca_certificate: impl Into<String>) -> Self {
        Self {
            proxy_port,
            ca_certificate: ca_certificate.into(),
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON, filling unspecified fields with defaults.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration can be used for a build.
    pub fn validate(&self) -> Result<()> {
        if self.proxy_port == 0 {
            return Err(BoxError::ConfigError(
                "proxy_port must be non-zero".to_string(),
            ));
        }
        if self.ca_certificate.trim().is_empty() {
            return Err(BoxError::ConfigError(
                "ca_certificate must not be empty".to_string(),
            ));
        }
        if self.dockerfile.is_empty() {
            return Err(BoxError::ConfigError(
                "dockerfile must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
