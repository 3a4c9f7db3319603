//! Websocket transport configuration

use serde::Deserialize;

use super::error::ValidationError;

/// Per-connection transport limits
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Capacity of each connection's outbound frame queue; frames are
    /// dropped rather than buffered beyond it
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum accepted inbound websocket message size in bytes
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.queue_capacity == 0 {
            return Err(ValidationError::InvalidQueueCapacity);
        }
        if self.max_message_bytes < 128 {
            return Err(ValidationError::MaxMessageSizeTooSmall);
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

fn default_queue_capacity() -> usize {
    128
}

// Inbound traffic is small command frames; anything bigger is abuse.
fn default_max_message_bytes() -> usize {
    512
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_defaults_are_valid() {
        let config = TransportConfig::default();
        assert_eq!(config.queue_capacity, 128);
        assert_eq!(config.max_message_bytes, 512);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_queue_capacity_is_rejected() {
        let config = TransportConfig {
            queue_capacity: 0,
            ..TransportConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidQueueCapacity)
        ));
    }

    #[test]
    fn test_tiny_message_limit_is_rejected() {
        let config = TransportConfig {
            max_message_bytes: 64,
            ..TransportConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ValidationError::MaxMessageSizeTooSmall)
        ));
    }
}
