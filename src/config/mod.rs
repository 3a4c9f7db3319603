//! Subsystem configuration module
//!
//! Type-safe configuration loading from environment variables using the
//! `config` and `dotenvy` crates. Configuration is loaded with the
//! `CABLECAST` prefix and nested values use double underscores as
//! separators.
//!
//! # Example
//!
//! ```no_run
//! use cablecast::config::AppConfig;
//!
//! let config = AppConfig::load().expect("Failed to load configuration");
//! config.validate().expect("Invalid configuration");
//! ```

mod error;
mod signer;
mod transport;

pub use error::{ConfigError, ValidationError};
pub use signer::SignerConfig;
pub use transport::TransportConfig;

use serde::Deserialize;

/// Root configuration for the broadcast subsystem
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Websocket transport limits
    #[serde(default)]
    pub transport: TransportConfig,

    /// Stream name signing key
    pub signer: SignerConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    ///
    /// Loads a `.env` file if present (for development), then reads
    /// environment variables with the `CABLECAST` prefix:
    ///
    /// - `CABLECAST__SIGNER__HASH_KEY=...` -> `signer.hash_key`
    /// - `CABLECAST__TRANSPORT__QUEUE_CAPACITY=256` -> `transport.queue_capacity`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or values
    /// cannot be parsed into the expected types.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .prefix("CABLECAST")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.transport.validate()?;
        self.signer.validate()?;
        Ok(())
    }
}
