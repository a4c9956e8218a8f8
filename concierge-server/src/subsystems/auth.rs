//! HS256 JSON Web Token verification for `/api/verify-token`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(&'static str),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    NotYetValid,
    #[error("invalid signing key")]
    InvalidKey,
}

fn mac(secret: &str) -> Result<HmacSha256, TokenError> {
    <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()).map_err(|_| TokenError::InvalidKey)
}

fn decode_json(segment: &str) -> Result<Value, TokenError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| TokenError::Malformed("segment is not base64url"))?;
    serde_json::from_slice(&bytes).map_err(|_| TokenError::Malformed("segment is not JSON"))
}

/// Check signature, `exp` and `nbf`; returns the decoded claims.
pub fn verify_token(token: &str, secret: &str, now: i64) -> Result<Value, TokenError> {
    let mut parts = token.trim().split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TokenError::Malformed("expected three segments"));
    };

    let header_json = decode_json(header)?;
    let alg = header_json.get("alg").and_then(Value::as_str).unwrap_or("");
    if alg != "HS256" {
        return Err(TokenError::UnsupportedAlgorithm(alg.to_string()));
    }

    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| TokenError::Malformed("signature is not base64url"))?;
    let mut m = mac(secret)?;
    m.update(header.as_bytes());
    m.update(b".");
    m.update(payload.as_bytes());
    m.verify_slice(&signature).map_err(|_| TokenError::BadSignature)?;

    let claims = decode_json(payload)?;
    if !claims.is_object() {
        return Err(TokenError::Malformed("claims must be an object"));
    }
    if let Some(exp) = claims.get("exp").and_then(Value::as_i64) {
        if now >= exp {
            return Err(TokenError::Expired);
        }
    }
    if let Some(nbf) = claims.get("nbf").and_then(Value::as_i64) {
        if now < nbf {
            return Err(TokenError::NotYetValid);
        }
    }
    Ok(claims)
}

pub fn sign_token(claims: &Value, secret: &str) -> Result<String, TokenError> {
    let header = URL_SAFE_NO_PAD.encode(json!({"alg": "HS256", "typ": "JWT"}).to_string());
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    let mut m = mac(secret)?;
    m.update(header.as_bytes());
    m.update(b".");
    m.update(payload.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(m.finalize().into_bytes());
    Ok(format!("{header}.{payload}.{signature}"))
}
