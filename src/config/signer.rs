//! Stream name signing configuration

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::error::ValidationError;

/// Key material for signing stream names
#[derive(Debug, Clone, Deserialize)]
pub struct SignerConfig {
    /// Base64-encoded HMAC key, at least 32 bytes decoded
    pub hash_key: SecretString,
}

impl SignerConfig {
    /// Decode the signing key
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` if the key is not valid base64 or decodes
    /// to fewer than 32 bytes.
    pub fn hash_key_bytes(&self) -> Result<Vec<u8>, ValidationError> {
        let key = BASE64
            .decode(self.hash_key.expose_secret())
            .map_err(|_| ValidationError::InvalidSigningKeyEncoding)?;
        if key.len() < 32 {
            return Err(ValidationError::SigningKeyTooShort);
        }
        Ok(key)
    }

    /// Validate signer configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.hash_key_bytes().map(|_| ())
    }
}
