use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::auth::AuthContext;
use super::auth::mtls::TlsPeer;
use super::crypto::new_request_id;
use super::store_types::BillingMode;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    User,
    Token,
}

impl SubjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Token => "token",
        }
    }
}

/// Billing subject, rendered as `"user:<id>"` or `"token:<id>"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectKey {
    pub subject_type: SubjectType,
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid subject key: {0}")]
pub struct InvalidSubjectKey(pub String);

impl SubjectKey {
    pub fn user(id: i64) -> Self {
        Self {
            subject_type: SubjectType::User,
            id,
        }
    }

    pub fn token(id: i64) -> Self {
        Self {
            subject_type: SubjectType::Token,
            id,
        }
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subject_type.as_str(), self.id)
    }
}

impl FromStr for SubjectKey {
    type Err = InvalidSubjectKey;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidSubjectKey(raw.to_string());
        let (kind, id) = raw.trim().split_once(':').ok_or_else(invalid)?;
        let subject_type = match kind.trim().to_ascii_lowercase().as_str() {
            "user" => SubjectType::User,
            "token" => SubjectType::Token,
            _ => return Err(invalid()),
        };
        let id = id.trim().parse::<i64>().map_err(|_| invalid())?;
        if id <= 0 {
            return Err(invalid());
        }
        Ok(Self { subject_type, id })
    }
}

/// Per-request state. Earlier admission stages write the override fields that later
/// stages read.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub request_id: String,
    pub method: String,
    pub path: String,
    /// Lowercased header names.
    pub headers: BTreeMap<String, String>,
    pub peer_addr: Option<String>,
    pub tls: Option<TlsPeer>,
    pub body: bytes::Bytes,
    pub started_at_ms: u64,

    pub auth: Option<AuthContext>,
    pub requested_model: Option<String>,
    pub effective_model: Option<String>,
    pub billing_mode_override: Option<BillingMode>,
    pub ip_whitelisted: bool,
    pub flagged: bool,
    pub fallback_applied: bool,
    pub excluded_from_leaderboard: bool,
    pub is_playground: bool,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            request_id: new_request_id(),
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<bytes::Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_peer_addr(mut self, addr: impl Into<String>) -> Self {
        self.peer_addr = Some(addr.into());
        self
    }

    pub fn with_tls(mut self, tls: TlsPeer) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Uses `X-Request-Id` when the client supplied one.
    pub fn adopt_client_request_id(&mut self) {
        if let Some(id) = self.header("x-request-id") {
            let id = id.trim();
            if !id.is_empty() && id.len() <= 128 {
                self.request_id = id.to_string();
            }
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn is_mutating(&self) -> bool {
        matches!(self.method.as_str(), "POST" | "PUT" | "PATCH")
    }

    /// X-Forwarded-For (first hop), X-Real-IP, CF-Connecting-IP, then the socket.
    pub fn client_ip(&self) -> String {
        if let Some(forwarded) = self.header("x-forwarded-for") {
            if let Some(first) = forwarded
                .split(',')
                .map(|part| part.trim())
                .find(|part| !part.is_empty())
            {
                return first.to_string();
            }
        }
        for name in ["x-real-ip", "cf-connecting-ip"] {
            if let Some(value) = self.header(name) {
                return value.to_string();
            }
        }
        match self.peer_addr.as_deref() {
            Some(addr) => strip_port(addr).to_string(),
            None => String::new(),
        }
    }

    pub fn user_id(&self) -> Option<i64> {
        self.auth.as_ref().map(|auth| auth.user_id)
    }

    pub fn token_id(&self) -> Option<i64> {
        self.auth.as_ref().and_then(|auth| auth.token_id)
    }

    /// Token subject when authenticated by key, otherwise the user.
    pub fn subject_key(&self) -> Option<SubjectKey> {
        let auth = self.auth.as_ref()?;
        Some(match auth.token_id {
            Some(token_id) => SubjectKey::token(token_id),
            None => SubjectKey::user(auth.user_id),
        })
    }

    /// Model actually dispatched: override first, then the requested one.
    pub fn model(&self) -> Option<&str> {
        self.effective_model
            .as_deref()
            .or(self.requested_model.as_deref())
    }
}

fn strip_port(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            host
        }
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_key_round_trips_text_form() {
        let key: SubjectKey = "token:42".parse().expect("parse");
        assert_eq!(key, SubjectKey::token(42));
        assert_eq!(key.to_string(), "token:42");
        assert!("group:1".parse::<SubjectKey>().is_err());
        assert!("user:abc".parse::<SubjectKey>().is_err());
        assert!("user:0".parse::<SubjectKey>().is_err());
    }

    #[test]
    fn client_ip_precedence() {
        let ctx = RequestContext::new("post", "/v1/chat/completions")
            .with_peer_addr("10.0.0.9:5555")
            .with_header("X-Real-IP", "10.0.0.2")
            .with_header("X-Forwarded-For", " 203.0.113.7 , 10.0.0.1");
        assert_eq!(ctx.client_ip(), "203.0.113.7");

        let ctx = RequestContext::new("GET", "/").with_header("CF-Connecting-IP", "198.51.100.4");
        assert_eq!(ctx.client_ip(), "198.51.100.4");

        let ctx = RequestContext::new("GET", "/").with_peer_addr("[2001:db8::1]:443");
        assert_eq!(ctx.client_ip(), "2001:db8::1");

        let ctx = RequestContext::new("GET", "/").with_peer_addr("192.0.2.1:80");
        assert_eq!(ctx.client_ip(), "192.0.2.1");
    }

    #[test]
    fn method_is_normalized() {
        let ctx = RequestContext::new("patch", "/x");
        assert!(ctx.is_mutating());
        assert!(!RequestContext::new("GET", "/x").is_mutating());
    }
}
