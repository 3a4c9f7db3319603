//! Signed stream names.
//!
//! Topic names cross the client round-trip (rendered into pages, sent back
//! in subscribe commands), so they carry an HMAC-SHA512 tag proving the
//! server generated them. Verification happens before any SUB handler runs;
//! a client cannot get the subsystem to even consider a topic it wasn't
//! handed. The encoded form is base64 over a JSON payload of name and tag;
//! both ends of the encoding are server-held.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha512 = Hmac<Sha512>;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("couldn't parse subscription identifier")]
    MalformedIdentifier(#[source] serde_json::Error),
    #[error("couldn't decode signed stream name")]
    MalformedName,
    #[error("stream name failed integrity check")]
    IntegrityCheckFailed,
}

#[derive(Serialize, Deserialize)]
struct SignedName {
    name: String,
    hash: String,
}

/// Signs and verifies stream names with a server-held key.
#[derive(Clone)]
pub struct Signer {
    key: Vec<u8>,
}

impl Signer {
    pub fn new(key: Vec<u8>) -> Self {
        Self { key }
    }

    fn tag(&self, name: &str) -> Vec<u8> {
        let mut mac =
            HmacSha512::new_from_slice(&self.key).expect("HMAC accepts keys of any size");
        mac.update(name.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    /// Produce the signed form of a stream name for handing to clients.
    pub fn sign(&self, name: &str) -> String {
        let payload = SignedName {
            name: name.to_owned(),
            hash: BASE64.encode(self.tag(name)),
        };
        BASE64.encode(
            serde_json::to_vec(&payload).expect("signed name serialization should not fail"),
        )
    }

    /// Recover the stream name from its signed form, verifying the tag in
    /// constant time.
    pub fn verify(&self, signed: &str) -> Result<String, SignerError> {
        let raw = BASE64
            .decode(signed)
            .map_err(|_| SignerError::MalformedName)?;
        let payload: SignedName =
            serde_json::from_slice(&raw).map_err(|_| SignerError::MalformedName)?;
        let claimed = BASE64
            .decode(&payload.hash)
            .map_err(|_| SignerError::MalformedName)?;
        let expected = self.tag(&payload.name);
        if claimed.ct_eq(&expected).into() {
            Ok(payload.name)
        } else {
            Err(SignerError::IntegrityCheckFailed)
        }
    }

    /// Extract and verify the stream name carried in a subscription
    /// identifier's `signed_stream_name` field.
    pub fn stream_name_from_identifier(&self, identifier: &str) -> Result<String, SignerError> {
        #[derive(Deserialize)]
        struct Identifier {
            signed_stream_name: String,
        }
        let identifier: Identifier =
            serde_json::from_str(identifier).map_err(SignerError::MalformedIdentifier)?;
        self.verify(&identifier.signed_stream_name)
    }
}
