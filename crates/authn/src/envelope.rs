//! Signed request envelope and its canonical signing encoding.
//!
//! A client signs every control-plane request with its device key:
//!
//! ```text
//! "sentra-envelope-v1\n" ‖ u64_be(len(payload_json)) ‖ payload_json
//!                        ‖ i64_be(timestamp) ‖ u64_be(len(nonce)) ‖ nonce
//! ```
//!
//! `payload_json` is the payload with object keys sorted and no whitespace,
//! produced by [`canonical_bytes`] independently of `serde_json`'s map
//! ordering features.
//!
//! # Example
//!
//! ```
//! use sentra_common_authn::envelope::EnvelopeSigner;
//! use serde_json::json;
//!
//! let signer = EnvelopeSigner::generate();
//! let envelope = signer.sign(json!({"op": "deploy", "project": "abc123"}), 1_700_000_000_000);
//! assert_eq!(envelope.public_key, signer.public_key_b64());
//! ```

use std::io::Write;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::{Signer, SigningKey};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::Zeroizing;

use crate::error::{AuthError, Result};

/// Domain separation prefix for envelope signatures.
pub const ENVELOPE_DOMAIN: &[u8] = b"sentra-envelope-v1\n";

/// Minimum decoded nonce length in bytes.
pub const MIN_NONCE_LENGTH: usize = 16;

/// A signed control-plane request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignedEnvelope {
    /// Opaque request body.
    pub payload: Value,
    /// Client time in Unix milliseconds.
    pub timestamp: i64,
    /// Random nonce, base64url without padding.
    pub nonce: String,
    /// Ed25519 signature over the canonical encoding, base64url.
    pub signature: String,
    /// Ed25519 public key of the signing device, base64url.
    pub public_key: String,
}

impl SignedEnvelope {
    /// Parses an envelope from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MalformedEnvelope`] on any JSON or shape error.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| AuthError::malformed(e.to_string()))
    }

    /// Serializes the envelope to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MalformedEnvelope`] if the payload cannot be
    /// serialized.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| AuthError::malformed(e.to_string()))
    }
}

/// Builds the byte string covered by an envelope signature.
#[must_use]
pub fn canonical_bytes(payload: &Value, timestamp: i64, nonce: &[u8]) -> Vec<u8> {
    let mut payload_json = Vec::new();
    write_canonical_json(&mut payload_json, payload);

    let mut out = Vec::with_capacity(ENVELOPE_DOMAIN.len() + payload_json.len() + nonce.len() + 24);
    out.extend_from_slice(ENVELOPE_DOMAIN);
    out.extend_from_slice(&(payload_json.len() as u64).to_be_bytes());
    out.extend_from_slice(&payload_json);
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(&(nonce.len() as u64).to_be_bytes());
    out.extend_from_slice(nonce);
    out
}

/// Writes `value` as compact JSON with object keys sorted.
fn write_canonical_json(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(b) => out.extend_from_slice(if *b { b"true" } else { b"false" }),
        Value::Number(n) => {
            // Writing into a Vec cannot fail
            let _ = write!(out, "{n}");
        },
        Value::String(s) => write_json_string(out, s),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical_json(out, item);
            }
            out.push(b']');
        },
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push(b'{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_json_string(out, key);
                out.push(b':');
                write_canonical_json(out, item);
            }
            out.push(b'}');
        },
    }
}

fn write_json_string(out: &mut Vec<u8>, s: &str) {
    // serde_json's string escaping is deterministic; serializing a &str into a
    // Vec cannot fail.
    let _ = serde_json::to_writer(&mut *out, s);
}

/// Client-side signer holding a device's Ed25519 private key.
///
/// The key material is zeroized on drop by `ed25519-dalek`.
pub struct EnvelopeSigner {
    signing_key: SigningKey,
}

impl std::fmt::Debug for EnvelopeSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeSigner").field("public_key", &self.public_key_b64()).finish()
    }
}

impl EnvelopeSigner {
    /// Generates a fresh random device key.
    #[must_use]
    pub fn generate() -> Self {
        Self { signing_key: SigningKey::generate(&mut OsRng) }
    }

    /// Wraps an existing 32-byte secret key.
    #[must_use]
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self { signing_key: SigningKey::from_bytes(secret) }
    }

    /// Restores a signer from a base64url-encoded 32-byte secret key.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MalformedEnvelope`] if the encoding or length is
    /// wrong.
    pub fn from_secret_b64(secret: &str) -> Result<Self> {
        let bytes: Zeroizing<Vec<u8>> = Zeroizing::new(
            URL_SAFE_NO_PAD
                .decode(secret.trim().as_bytes())
                .map_err(|e| AuthError::malformed(format!("secret key base64 decode: {e}")))?,
        );
        let array: Zeroizing<[u8; 32]> = Zeroizing::new(
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| AuthError::malformed(format!("expected 32-byte secret key, got {}", bytes.len())))?,
        );
        Ok(Self::from_secret_bytes(&array))
    }

    /// Base64url encoding of the secret key, for storing on the device.
    #[must_use]
    pub fn secret_key_b64(&self) -> Zeroizing<String> {
        let bytes = Zeroizing::new(self.signing_key.to_bytes());
        Zeroizing::new(URL_SAFE_NO_PAD.encode(*bytes))
    }

    /// Base64url encoding of the public key, as enrolled in the key registry.
    #[must_use]
    pub fn public_key_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Signs `payload` at `timestamp` with a fresh random nonce.
    #[must_use]
    pub fn sign(&self, payload: Value, timestamp: i64) -> SignedEnvelope {
        let mut nonce = [0u8; MIN_NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);
        self.sign_with_nonce(payload, timestamp, &nonce)
    }

    /// Signs `payload` with a caller-chosen nonce.
    #[must_use]
    pub fn sign_with_nonce(&self, payload: Value, timestamp: i64, nonce: &[u8]) -> SignedEnvelope {
        let message = canonical_bytes(&payload, timestamp, nonce);
        let signature = self.signing_key.sign(&message);
        SignedEnvelope {
            payload,
            timestamp,
            nonce: URL_SAFE_NO_PAD.encode(nonce),
            signature: URL_SAFE_NO_PAD.encode(signature.to_bytes()),
            public_key: self.public_key_b64(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_canonical_bytes_layout() {
        let bytes = canonical_bytes(&json!({"b": 1, "a": [true, null]}), 7, b"nonce");
        let payload = br#"{"a":[true,null],"b":1}"#;

        let mut expected = ENVELOPE_DOMAIN.to_vec();
        expected.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        expected.extend_from_slice(payload);
        expected.extend_from_slice(&7i64.to_be_bytes());
        expected.extend_from_slice(&5u64.to_be_bytes());
        expected.extend_from_slice(b"nonce");
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys_and_escapes() {
        let mut out = Vec::new();
        write_canonical_json(&mut out, &json!({"z": {"y": "q\"\n", "x": -1.5}, "a": "é"}));
        assert_eq!(String::from_utf8(out).unwrap(), r#"{"a":"é","z":{"x":-1.5,"y":"q\"\n"}}"#);
    }

    #[test]
    fn test_key_order_does_not_change_encoding() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":2,"x":1}"#).unwrap();
        assert_eq!(canonical_bytes(&a, 1, b"n"), canonical_bytes(&b, 1, b"n"));
    }

    #[test]
    fn test_sign_produces_verifiable_envelope() {
        use ed25519_dalek::{Signature, Verifier};

        let signer = EnvelopeSigner::generate();
        let env = signer.sign(json!({"op": "status"}), 1_000);

        let nonce = URL_SAFE_NO_PAD.decode(&env.nonce).unwrap();
        assert_eq!(nonce.len(), MIN_NONCE_LENGTH);
        let sig_bytes: [u8; 64] = URL_SAFE_NO_PAD.decode(&env.signature).unwrap().try_into().unwrap();
        let message = canonical_bytes(&env.payload, env.timestamp, &nonce);
        signer
            .signing_key
            .verifying_key()
            .verify(&message, &Signature::from_bytes(&sig_bytes))
            .expect("signature must verify");
    }

    #[test]
    fn test_secret_key_round_trip() {
        let signer = EnvelopeSigner::generate();
        let restored = EnvelopeSigner::from_secret_b64(&signer.secret_key_b64()).unwrap();
        assert_eq!(restored.public_key_b64(), signer.public_key_b64());
        assert!(EnvelopeSigner::from_secret_b64("c2hvcnQ").is_err());
    }

    #[test]
    fn test_envelope_json_rejects_unknown_fields() {
        let json = br#"{"payload":{},"timestamp":1,"nonce":"n","signature":"s","public_key":"k","alg":"none"}"#;
        assert!(matches!(SignedEnvelope::from_json(json), Err(AuthError::MalformedEnvelope(_))));
    }

    #[test]
    fn test_debug_does_not_leak_secret() {
        let signer = EnvelopeSigner::generate();
        let debug = format!("{signer:?}");
        assert!(!debug.contains(signer.secret_key_b64().as_str()));
    }
}
