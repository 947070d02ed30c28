//! Server configuration loaded from the environment.
//!
//! | variable | default | meaning |
//! |---|---|---|
//! | `PORT` | `10000` | listening port |
//! | `REQUESTING_BASE_URL` | `/api` | prefix of every POST route |
//! | `REQUESTING_ALLOWED_ORIGINS` | empty | comma-separated CORS origins |
//! | `REQUESTING_ALLOWED_DOMAIN` | unset | one extra CORS origin |
//! | `REQUESTING_TIMEOUT` | `10000` | response timeout in milliseconds |
//! | `REQUESTING_SAVE_RESPONSES` | `true` | mirror responses into the audit store |

use concept_sync_runtime::RequestingConfig;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Environment variable could not be parsed
    #[error("Invalid value for {var}: {value}")]
    InvalidValue {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
    },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Bridge configuration was rejected
    #[error(transparent)]
    Requesting(#[from] concept_sync_runtime::ConfigError),
}

/// HTTP server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listening port
    pub port: u16,
    /// Route prefix, always starting with `/` and never ending with one
    pub base_url: String,
    /// Origins allowed by CORS, besides local development hosts
    pub allowed_origins: Vec<String>,
    /// Bridge settings
    pub requesting: RequestingConfig,
}

impl ServerConfig {
    /// Set the listening port
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the route prefix
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Allow an extra CORS origin
    #[must_use]
    pub fn with_allowed_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    /// Set the bridge configuration
    #[must_use]
    pub const fn with_requesting(mut self, requesting: RequestingConfig) -> Self {
        self.requesting = requesting;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is malformed or the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// See [`Self::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self {
            requesting: RequestingConfig::from_lookup(&lookup)?,
            ..Self::default()
        };

        if let Some(raw) = lookup("PORT") {
            config.port = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                var: "PORT",
                value: raw.clone(),
            })?;
        }
        if let Some(raw) = lookup("REQUESTING_BASE_URL") {
            config.base_url = raw.trim().trim_end_matches('/').to_string();
        }
        if let Some(raw) = lookup("REQUESTING_ALLOWED_ORIGINS") {
            config.allowed_origins.extend(
                raw.split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_string),
            );
        }
        if let Some(raw) = lookup("REQUESTING_ALLOWED_DOMAIN") {
            let origin = raw.trim();
            if !origin.is_empty() {
                config.allowed_origins.push(origin.to_string());
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if the port is zero or the
    /// base URL is not an absolute, non-root path.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::ValidationError("port must be > 0".to_string()));
        }
        if !self.base_url.starts_with('/') || self.base_url.len() < 2 || self.base_url.ends_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "base URL must look like /api, got {:?}",
                self.base_url
            )));
        }
        self.requesting.validate()?;
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 10_000,
            base_url: "/api".to_string(),
            allowed_origins: Vec::new(),
            requesting: RequestingConfig::default(),
        }
    }
}
