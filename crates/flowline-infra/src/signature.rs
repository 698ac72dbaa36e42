//! Trigger signature and operator token verification.
//!
//! Triggers may carry an `X-Flowline-Signature: sha256=<hex>` header holding
//! the HMAC-SHA256 of the raw request body under the shared trigger secret.
//! Operator routes take a bearer token. Both comparisons are constant-time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the trigger body signature.
pub const SIGNATURE_HEADER: &str = "x-flowline-signature";

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature verification failed")]
    SignatureMismatch,

    #[error("bearer token verification failed")]
    TokenMismatch,

    #[error("invalid HMAC key: {0}")]
    InvalidKey(String),

    #[error("missing authentication: {0}")]
    Missing(&'static str),
}

// ---------------------------------------------------------------------------
// HMAC-SHA256
// ---------------------------------------------------------------------------

/// Signature header value for `body`: `sha256=<lowercase hex>`.
pub fn sign_body(secret: &[u8], body: &[u8]) -> Result<String, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
    mac.update(body);
    Ok(format!(
        "{SIGNATURE_PREFIX}{}",
        hex_encode(&mac.finalize().into_bytes())
    ))
}

/// Verify a signature header value. The `sha256=` prefix is optional.
pub fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> Result<(), SignatureError> {
    let hex = signature
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .unwrap_or(signature.trim());
    let expected = hex_decode(hex).ok_or(SignatureError::SignatureMismatch)?;

    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::SignatureMismatch)
}

/// Check a trigger request. With no secret configured, every request passes.
pub fn authorize_trigger(
    secret: Option<&str>,
    body: &[u8],
    signature: Option<&str>,
) -> Result<(), SignatureError> {
    let Some(secret) = secret else {
        return Ok(());
    };
    let signature = signature.ok_or(SignatureError::Missing("X-Flowline-Signature header required"))?;
    verify_signature(secret.as_bytes(), body, signature)
}

// ---------------------------------------------------------------------------
// Bearer tokens
// ---------------------------------------------------------------------------

/// Compare an `Authorization` header value against the expected token.
pub fn verify_bearer_token(expected: &str, provided: &str) -> Result<(), SignatureError> {
    let token = provided.strip_prefix("Bearer ").unwrap_or(provided);

    if constant_time_eq(expected.as_bytes(), token.as_bytes()) {
        Ok(())
    } else {
        Err(SignatureError::TokenMismatch)
    }
}

/// Check an operator request. With no token configured, every request passes.
pub fn authorize_operator(expected: Option<&str>, header: Option<&str>) -> Result<(), SignatureError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let header = header.ok_or(SignatureError::Missing("Authorization header required"))?;
    verify_bearer_token(expected, header)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// XOR-accumulating comparison; time does not depend on where bytes differ.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"trigger-secret";
    const BODY: &[u8] = br#"{"workflow_id":"leads","payload":{"email":"a@b.c"}}"#;

    #[test]
    fn test_signed_body_verifies() {
        let sig = sign_body(SECRET, BODY).unwrap();
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
        assert_eq!(verify_signature(SECRET, BODY, &sig), Ok(()));
        // Bare hex is accepted too.
        assert_eq!(verify_signature(SECRET, BODY, &sig["sha256=".len()..]), Ok(()));
    }

    #[test]
    fn test_tampered_body_or_wrong_secret_fails() {
        let sig = sign_body(SECRET, BODY).unwrap();
        assert_eq!(
            verify_signature(SECRET, b"{}", &sig),
            Err(SignatureError::SignatureMismatch)
        );
        assert_eq!(
            verify_signature(b"other", BODY, &sig),
            Err(SignatureError::SignatureMismatch)
        );
    }

    #[test]
    fn test_malformed_hex_fails() {
        for bad in ["sha256=xyz", "sha256=abc", "", "sha256=é0"] {
            assert_eq!(
                verify_signature(SECRET, BODY, bad),
                Err(SignatureError::SignatureMismatch),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_authorize_trigger_without_secret_passes() {
        assert_eq!(authorize_trigger(None, BODY, None), Ok(()));
        assert!(matches!(
            authorize_trigger(Some("trigger-secret"), BODY, None),
            Err(SignatureError::Missing(_))
        ));
        let sig = sign_body(SECRET, BODY).unwrap();
        assert_eq!(authorize_trigger(Some("trigger-secret"), BODY, Some(&sig)), Ok(()));
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(verify_bearer_token("tok", "Bearer tok"), Ok(()));
        assert_eq!(verify_bearer_token("tok", "tok"), Ok(()));
        assert_eq!(
            verify_bearer_token("tok", "Bearer tok2"),
            Err(SignatureError::TokenMismatch)
        );
        assert_eq!(authorize_operator(None, None), Ok(()));
        assert!(matches!(
            authorize_operator(Some("tok"), None),
            Err(SignatureError::Missing(_))
        ));
    }
}
