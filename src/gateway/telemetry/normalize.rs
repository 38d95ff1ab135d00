//! Stable, low-cardinality renderings of request attributes for telemetry rows.

use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use crate::gateway::crypto::{hex_encode, sha256_hex};

const USER_AGENT_LIMIT: usize = 512;

/// Path without query, duplicate slashes, trailing slash, or id-like segments.
/// With `keyed` the HTTP verb is prefixed, e.g. `POST /v1/threads/:id`.
pub fn normalize_url(path: &str, method: &str, keyed: bool) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let segments: Vec<&str> = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| if is_id_segment(segment) { ":id" } else { segment })
        .collect();
    let normalized = format!("/{}", segments.join("/"));
    if keyed {
        format!("{} {normalized}", method.trim().to_ascii_uppercase())
    } else {
        normalized
    }
}

fn is_id_segment(segment: &str) -> bool {
    segment.chars().all(|c| c.is_ascii_digit()) || uuid_regex().is_match(segment)
}

fn uuid_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .expect("uuid regex is valid")
    })
}

/// Hash of the sorted top-level parameter names and their JSON types. Values never
/// contribute, so two requests with the same shape share a digest.
pub fn param_digest(body: &[u8], query: Option<&str>) -> String {
    let mut pairs: Vec<(String, &'static str)> = match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => map
            .iter()
            .map(|(key, value)| (key.clone(), shape(value)))
            .collect(),
        _ => query
            .unwrap_or_default()
            .split('&')
            .filter_map(|pair| pair.split('=').next())
            .filter(|key| !key.is_empty())
            .map(|key| (key.to_string(), "string"))
            .collect(),
    };
    if pairs.is_empty() {
        return String::new();
    }
    pairs.sort();
    pairs.dedup_by(|a, b| a.0 == b.0);

    let canonical: String = pairs
        .iter()
        .map(|(key, shape)| format!("{key}={shape};"))
        .collect();
    let mut digest = sha256_hex(canonical.as_bytes());
    digest.truncate(32);
    digest
}

fn shape(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Masks values of cookies whose name looks credential-bearing.
pub fn sanitize_cookies(cookies: &str) -> String {
    if cookies.trim().is_empty() {
        return String::new();
    }
    sensitive_cookie_regex()
        .replace_all(cookies, "${name}=***")
        .into_owned()
}

fn sensitive_cookie_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        RegexBuilder::new(r"(?P<name>[^=;\s]*(?:session|token|auth|jwt|csrf|sess|password)[^=;]*)=[^;]*")
            .case_insensitive(true)
            .build()
            .expect("cookie regex is valid")
    })
}

/// First 16 bytes of SHA-256 over the raw `Authorization` header, hex encoded.
pub fn auth_fingerprint(authorization: Option<&str>) -> String {
    match authorization.filter(|value| !value.is_empty()) {
        Some(value) => {
            use sha2::{Digest, Sha256};
            let digest = Sha256::digest(value.as_bytes());
            hex_encode(&digest[..16])
        }
        None => String::new(),
    }
}

pub fn sanitize_user_agent(user_agent: &str) -> String {
    let escaped = user_agent
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;");
    match escaped.char_indices().nth(USER_AGENT_LIMIT) {
        Some((idx, _)) => escaped[..idx].to_string(),
        None => escaped,
    }
}

pub fn categorize_error(status: u16) -> Option<&'static str> {
    match status {
        400..=499 => Some("client_error"),
        500.. => Some("server_error"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_normalization_is_stable() {
        assert_eq!(normalize_url("/v1//threads/123/messages/?limit=5", "get", false), "/v1/threads/:id/messages");
        assert_eq!(
            normalize_url("/v1/files/3f2504e0-4f89-11d3-9a0c-0305e82c3301", "delete", true),
            "DELETE /v1/files/:id"
        );
        assert_eq!(normalize_url("/", "GET", false), "/");
        assert_eq!(normalize_url("/v1/chat/completions", "post", true), "POST /v1/chat/completions");
    }

    #[test]
    fn param_digest_depends_on_shape_only() {
        let a = param_digest(br#"{"model":"gpt-4o","stream":true,"messages":[]}"#, None);
        let b = param_digest(br#"{"messages":[{"role":"user"}],"model":"other","stream":false}"#, None);
        let c = param_digest(br#"{"model":"gpt-4o","stream":"yes","messages":[]}"#, None);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
        assert_eq!(param_digest(b"", None), "");
        assert_eq!(param_digest(b"", Some("b=1&a=2")), param_digest(b"", Some("a=9&b=0")));
    }

    #[test]
    fn cookies_are_masked() {
        assert_eq!(
            sanitize_cookies("theme=dark; session_id=abc; XSRF-TOKEN=zzz; lang=en"),
            "theme=dark; session_id=***; XSRF-TOKEN=***; lang=en"
        );
        assert_eq!(sanitize_cookies(""), "");
    }

    #[test]
    fn fingerprint_and_error_category() {
        assert_eq!(auth_fingerprint(Some("Bearer sk-1")).len(), 32);
        assert_eq!(auth_fingerprint(None), "");
        assert_eq!(categorize_error(404), Some("client_error"));
        assert_eq!(categorize_error(503), Some("server_error"));
        assert_eq!(categorize_error(200), None);
        assert_eq!(sanitize_user_agent("<x>"), "&lt;x&gt;");
    }
}
