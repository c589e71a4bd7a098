//! Envelope field decoding and signature verification.
//!
//! Every field is decoded from base64url (no padding) and length-checked
//! before any cryptographic work happens. Only Ed25519 is supported; there is
//! no algorithm field to negotiate.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::{PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH, Signature, VerifyingKey};
use serde_json::Value;
use zeroize::Zeroizing;

use crate::{
    envelope::{MIN_NONCE_LENGTH, canonical_bytes},
    error::{AuthError, Result},
};

/// Largest accepted decoded nonce.
pub const MAX_NONCE_LENGTH: usize = 64;

/// Parses a base64url Ed25519 public key.
///
/// # Errors
///
/// Returns [`AuthError::MalformedEnvelope`] if the key does not decode to
/// 32 bytes or is not a valid curve point.
pub fn decode_public_key(public_key: &str) -> Result<VerifyingKey> {
    let bytes: Zeroizing<Vec<u8>> = Zeroizing::new(
        URL_SAFE_NO_PAD
            .decode(public_key.as_bytes())
            .map_err(|e| AuthError::malformed(format!("public key base64 decode: {e}")))?,
    );

    if bytes.len() != PUBLIC_KEY_LENGTH {
        return Err(AuthError::malformed(format!(
            "expected {PUBLIC_KEY_LENGTH}-byte public key, got {}",
            bytes.len()
        )));
    }

    let key_bytes: Zeroizing<[u8; PUBLIC_KEY_LENGTH]> = Zeroizing::new(
        bytes[..PUBLIC_KEY_LENGTH]
            .try_into()
            .map_err(|_| AuthError::malformed("failed to convert public key bytes"))?,
    );

    VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| AuthError::malformed(format!("invalid Ed25519 key: {e}")))
}

/// Decodes the envelope nonce.
///
/// # Errors
///
/// Returns [`AuthError::MalformedEnvelope`] if the nonce is not base64url or
/// its length is outside `MIN_NONCE_LENGTH..=MAX_NONCE_LENGTH`.
pub fn decode_nonce(nonce: &str) -> Result<Vec<u8>> {
    let bytes = URL_SAFE_NO_PAD
        .decode(nonce.as_bytes())
        .map_err(|e| AuthError::malformed(format!("nonce base64 decode: {e}")))?;
    if !(MIN_NONCE_LENGTH..=MAX_NONCE_LENGTH).contains(&bytes.len()) {
        return Err(AuthError::malformed(format!(
            "nonce must be {MIN_NONCE_LENGTH}..={MAX_NONCE_LENGTH} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Decodes the envelope signature.
///
/// A signature that is not 64 bytes of base64url can never verify, so it is
/// reported as [`AuthError::InvalidSignature`].
///
/// # Errors
///
/// Returns [`AuthError::InvalidSignature`] on decoding or length errors.
pub fn decode_signature(signature: &str) -> Result<Signature> {
    let bytes = URL_SAFE_NO_PAD
        .decode(signature.as_bytes())
        .map_err(|_| AuthError::InvalidSignature)?;
    let array: [u8; SIGNATURE_LENGTH] =
        bytes.as_slice().try_into().map_err(|_| AuthError::InvalidSignature)?;
    Ok(Signature::from_bytes(&array))
}

/// Verifies `signature` over the canonical encoding of the envelope fields.
///
/// Uses strict verification, rejecting small-order keys and non-canonical
/// signature encodings.
///
/// # Errors
///
/// Returns [`AuthError::InvalidSignature`] if verification fails.
pub fn verify_signature(
    key: &VerifyingKey,
    payload: &Value,
    timestamp: i64,
    nonce: &[u8],
    signature: &Signature,
) -> Result<()> {
    let message = canonical_bytes(payload, timestamp, nonce);
    key.verify_strict(&message, signature).map_err(|_| AuthError::InvalidSignature)
}
