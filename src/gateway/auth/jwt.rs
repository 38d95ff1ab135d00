use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

use crate::gateway::crypto::hmac_sha256_verify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwtClaims {
    pub user_id: i64,
    pub token_id: Option<i64>,
    pub exp: Option<i64>,
    pub nbf: Option<i64>,
}

#[derive(Deserialize)]
struct Header {
    alg: String,
}

#[derive(Deserialize)]
struct RawClaims {
    #[serde(default)]
    user_id: Option<serde_json::Value>,
    #[serde(default)]
    sub: Option<serde_json::Value>,
    #[serde(default)]
    token_id: Option<serde_json::Value>,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    nbf: Option<i64>,
}

/// Three dot-separated segments.
pub fn looks_like_jwt(token: &str) -> bool {
    token.split('.').count() == 3 && !token.contains(' ')
}

/// Verifies an HS256 token and its time claims, returning the subject.
pub fn verify_hs256(token: &str, secret: &str, now: i64, leeway: i64) -> Result<JwtClaims, String> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err("malformed jwt".to_string());
    };

    let header_raw = URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|_| "malformed jwt header".to_string())?;
    let header: Header =
        serde_json::from_slice(&header_raw).map_err(|_| "malformed jwt header".to_string())?;
    if !header.alg.eq_ignore_ascii_case("HS256") {
        return Err(format!("unsupported jwt alg: {}", header.alg));
    }

    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| "malformed jwt signature".to_string())?;
    let signing_input = format!("{header}.{payload}", header = token_head(token));
    if !hmac_sha256_verify(secret.as_bytes(), signing_input.as_bytes(), &signature) {
        return Err("invalid jwt signature".to_string());
    }

    let payload_raw = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| "malformed jwt payload".to_string())?;
    let claims: RawClaims =
        serde_json::from_slice(&payload_raw).map_err(|_| "malformed jwt payload".to_string())?;

    if let Some(exp) = claims.exp {
        if exp.saturating_add(leeway) < now {
            return Err("jwt expired".to_string());
        }
    }
    if let Some(nbf) = claims.nbf {
        if nbf.saturating_sub(leeway) > now {
            return Err("jwt not yet valid".to_string());
        }
    }

    let user_id = claims
        .user_id
        .as_ref()
        .and_then(claim_i64)
        .or_else(|| claims.sub.as_ref().and_then(claim_i64))
        .filter(|id| *id > 0)
        .ok_or_else(|| "jwt has no numeric user id".to_string())?;

    Ok(JwtClaims {
        user_id,
        token_id: claims.token_id.as_ref().and_then(claim_i64),
        exp: claims.exp,
        nbf: claims.nbf,
    })
}

fn token_head(token: &str) -> &str {
    match token.find('.') {
        Some(idx) => &token[..idx],
        None => token,
    }
}

fn claim_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(number) => number.as_i64(),
        serde_json::Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) fn sign_hs256(claims: &serde_json::Value, secret: &str) -> String {
    use crate::gateway::crypto::hmac_sha256;

    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    let signature = hmac_sha256(secret.as_bytes(), format!("{header}.{payload}").as_bytes());
    format!("{header}.{payload}.{}", URL_SAFE_NO_PAD.encode(signature))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn accepts_valid_token_with_string_sub() {
        let token = sign_hs256(&json!({"sub": "42", "exp": 2_000, "nbf": 1_000}), "s3cret");
        let claims = verify_hs256(&token, "s3cret", 1_500, 0).expect("valid");
        assert_eq!(claims.user_id, 42);
        assert!(looks_like_jwt(&token));
    }

    #[test]
    fn rejects_bad_signature_and_time_window() {
        let token = sign_hs256(&json!({"user_id": 7, "exp": 2_000, "nbf": 1_000}), "s3cret");
        assert_eq!(
            verify_hs256(&token, "other", 1_500, 0).unwrap_err(),
            "invalid jwt signature"
        );
        assert_eq!(verify_hs256(&token, "s3cret", 2_001, 0).unwrap_err(), "jwt expired");
        assert_eq!(
            verify_hs256(&token, "s3cret", 999, 0).unwrap_err(),
            "jwt not yet valid"
        );
        assert!(verify_hs256(&token, "s3cret", 2_010, 30).is_ok());
    }

    #[test]
    fn rejects_missing_subject() {
        let token = sign_hs256(&json!({"exp": 2_000}), "s3cret");
        assert!(verify_hs256(&token, "s3cret", 1_000, 0).is_err());
    }
}
