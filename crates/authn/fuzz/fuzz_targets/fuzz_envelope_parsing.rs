//! Fuzz target for envelope parsing and field decoding.
//!
//! Feeds arbitrary bytes as a wire envelope. Every result must be either
//! `Ok(...)` or `Err(AuthError)`; no input may panic or hang.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sentra_common_authn::{
    SignedEnvelope, canonical_bytes,
    validation::{decode_nonce, decode_public_key, decode_signature, verify_signature},
};

fuzz_target!(|data: &[u8]| {
    let Ok(envelope) = SignedEnvelope::from_json(data) else {
        return;
    };

    // The canonical encoding is total over any parsed payload
    let _ = canonical_bytes(&envelope.payload, envelope.timestamp, envelope.nonce.as_bytes());

    let key = decode_public_key(&envelope.public_key);
    let nonce = decode_nonce(&envelope.nonce);
    let signature = decode_signature(&envelope.signature);

    if let (Ok(key), Ok(nonce), Ok(signature)) = (key, nonce, signature) {
        let _ = verify_signature(&key, &envelope.payload, envelope.timestamp, &nonce, &signature);
    }

    // Re-serialization of a parsed envelope must succeed
    let _ = envelope.to_json();
});
