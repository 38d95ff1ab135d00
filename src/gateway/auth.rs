//! Credential checks run before anything else touches the request.
//!
//! Methods are tried in the configured order. A method that finds no credential of its
//! kind is skipped; the first failure is reported when no method succeeds. Every
//! attempt leaves an [`AuthAuditEntry`] in the log and in `auth_audit_logs`.

pub mod jwt;
pub mod mtls;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::cache::Cache;
use super::config::{AuthConfig, AuthMethod};
use super::context::RequestContext;
use super::crypto::sha256_hex;
use super::ip_protection::ip_matches;
use super::store::SqliteStore;
use super::store_types::{AuthAuditEntry, BillingMode, UserRecord};
use super::{Clock, GatewayError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub method: AuthMethod,
    pub user_id: i64,
    pub token_id: Option<i64>,
    pub token_key: Option<String>,
    pub unlimited_quota: bool,
    pub remain_quota: i64,
    pub model_limits: Vec<String>,
    pub allowed_ips: Vec<String>,
    pub billing_mode: Option<BillingMode>,
    pub cert_cn: Option<String>,
    pub banned: bool,
    pub redirect_model: Option<String>,
}

impl AuthContext {
    fn for_user(method: AuthMethod, user: &UserRecord) -> Self {
        Self {
            method,
            user_id: user.id,
            token_id: None,
            token_key: None,
            unlimited_quota: false,
            remain_quota: user.quota,
            model_limits: Vec::new(),
            allowed_ips: Vec::new(),
            billing_mode: None,
            cert_cn: None,
            banned: user.banned,
            redirect_model: user.redirect_model.clone(),
        }
    }

    /// Empty model limits allow every model.
    pub fn allows_model(&self, model: &str) -> bool {
        let model = model.trim();
        self.model_limits.is_empty()
            || self
                .model_limits
                .iter()
                .any(|allowed| allowed.trim().eq_ignore_ascii_case(model))
    }
}

enum Attempt {
    Skipped,
    Accepted(AuthContext),
    Rejected(String),
}

pub struct Authenticator {
    store: SqliteStore,
    cache: Arc<dyn Cache>,
    config: AuthConfig,
    clock: Arc<dyn Clock>,
}

impl Authenticator {
    pub fn new(
        store: SqliteStore,
        cache: Arc<dyn Cache>,
        config: AuthConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cache,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub async fn authenticate(&self, ctx: &RequestContext) -> Result<AuthContext, GatewayError> {
        let started_ms = self.clock.now_epoch_millis();
        let mut last_method = self.config.methods.first().copied();
        let mut first_error: Option<String> = None;
        let mut accepted = None;

        for method in &self.config.methods {
            let attempt = match method {
                AuthMethod::ApiKey => self.try_api_key(ctx).await,
                AuthMethod::Jwt => self.try_jwt(ctx).await,
                AuthMethod::Mtls => self.try_mtls(ctx).await,
            };
            match attempt {
                Attempt::Skipped => continue,
                Attempt::Accepted(auth) => {
                    last_method = Some(*method);
                    accepted = Some(auth);
                    break;
                }
                Attempt::Rejected(reason) => {
                    if first_error.is_none() {
                        last_method = Some(*method);
                        first_error = Some(reason);
                    }
                }
            }
        }

        let outcome = match accepted {
            Some(auth) => self.check_encryption_key(ctx, auth).await,
            None => Err(first_error.unwrap_or_else(|| "missing credentials".to_string())),
        };

        let latency_ms = self.clock.now_epoch_millis().saturating_sub(started_ms);
        let method = last_method.map(AuthMethod::as_str).unwrap_or("none");
        self.audit(ctx, method, outcome.as_ref().err(), latency_ms)
            .await;

        outcome.map_err(|reason| {
            if reason == ENCRYPTION_MISMATCH {
                GatewayError::SchemaInvalid { reason }
            } else {
                GatewayError::Unauthenticated { reason }
            }
        })
    }

    /// Claims `replay:<id>` for the replay window. Cache failures let the request through.
    pub async fn guard_replay(&self, request_id: &str) -> Result<(), GatewayError> {
        if !self.config.replay_protection {
            return Ok(());
        }
        let key = format!("replay:{request_id}");
        let ttl = Duration::from_secs(self.config.replay_window_secs.max(1));
        match self.cache.set_nx(&key, "1", ttl).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::warn!(request_id, "replayed request id rejected");
                Err(GatewayError::Replay {
                    request_id: request_id.to_string(),
                })
            }
            Err(err) => {
                tracing::debug!(request_id, error = %err, "replay guard skipped");
                Ok(())
            }
        }
    }

    async fn try_api_key(&self, ctx: &RequestContext) -> Attempt {
        let Some(bearer) = bearer_token(ctx) else {
            return Attempt::Skipped;
        };
        if jwt::looks_like_jwt(bearer) {
            return Attempt::Skipped;
        }
        let key = bearer.strip_prefix("sk-").unwrap_or(bearer);

        let token = match self.store.get_token_by_key(key).await {
            Ok(Some(token)) => token,
            Ok(None) => return Attempt::Rejected("invalid api key".to_string()),
            Err(err) => return Attempt::Rejected(format!("token lookup failed: {err}")),
        };
        if !token.is_usable_at(self.clock.now_unix()) {
            return Attempt::Rejected("api key disabled or expired".to_string());
        }
        if !token.allowed_ips.is_empty() {
            let ip = ctx.client_ip();
            if !token.allowed_ips.iter().any(|pattern| ip_matches(pattern, &ip)) {
                return Attempt::Rejected(format!("client ip {ip} not allowed for this key"));
            }
        }
        if let Err(reason) = self.enabled_user(token.user_id).await {
            return Attempt::Rejected(reason);
        }

        Attempt::Accepted(AuthContext {
            method: AuthMethod::ApiKey,
            user_id: token.user_id,
            token_id: Some(token.id),
            token_key: Some(token.key),
            unlimited_quota: token.unlimited_quota,
            remain_quota: token.remain_quota,
            model_limits: token.model_limits,
            allowed_ips: token.allowed_ips,
            billing_mode: token.billing_mode,
            cert_cn: None,
            banned: false,
            redirect_model: None,
        })
    }

    async fn try_jwt(&self, ctx: &RequestContext) -> Attempt {
        let Some(secret) = self.config.jwt_secret.as_deref().filter(|s| !s.is_empty()) else {
            return Attempt::Skipped;
        };
        let Some(bearer) = bearer_token(ctx).filter(|token| jwt::looks_like_jwt(token)) else {
            return Attempt::Skipped;
        };

        let leeway = i64::try_from(self.config.jwt_leeway_secs).unwrap_or(0);
        let claims = match jwt::verify_hs256(bearer, secret, self.clock.now_unix(), leeway) {
            Ok(claims) => claims,
            Err(reason) => return Attempt::Rejected(reason),
        };
        let user = match self.enabled_user(claims.user_id).await {
            Ok(user) => user,
            Err(reason) => return Attempt::Rejected(reason),
        };
        let mut auth = AuthContext::for_user(AuthMethod::Jwt, &user);
        let Some(token_id) = claims.token_id else {
            return Attempt::Accepted(auth);
        };

        // A claimed token must belong to the claimed user and still be usable.
        let token = match self.store.get_token(token_id).await {
            Ok(Some(token)) if token.user_id == user.id => token,
            Ok(_) => return Attempt::Rejected("token does not belong to user".to_string()),
            Err(err) => return Attempt::Rejected(format!("token lookup failed: {err}")),
        };
        if !token.is_usable_at(self.clock.now_unix()) {
            return Attempt::Rejected("token disabled or expired".to_string());
        }
        auth.token_id = Some(token.id);
        auth.unlimited_quota = token.unlimited_quota;
        auth.remain_quota = token.remain_quota;
        auth.model_limits = token.model_limits;
        auth.allowed_ips = token.allowed_ips;
        auth.billing_mode = token.billing_mode;
        Attempt::Accepted(auth)
    }

    async fn try_mtls(&self, ctx: &RequestContext) -> Attempt {
        let Some(peer) = ctx.tls.as_ref() else {
            return Attempt::Skipped;
        };
        let cn = match peer.check_validity(self.clock.now_unix()) {
            Ok(cn) => cn.to_string(),
            Err(reason) => return Attempt::Rejected(reason),
        };

        let user_id = match self.config.mtls_users.get(&cn) {
            Some(user_id) => *user_id,
            None => match self.store.get_user_by_username(&cn).await {
                Ok(Some(user)) => user.id,
                Ok(None) => {
                    return Attempt::Rejected(format!("no user mapped to certificate {cn}"));
                }
                Err(err) => return Attempt::Rejected(format!("user lookup failed: {err}")),
            },
        };
        match self.enabled_user(user_id).await {
            Ok(user) => {
                let mut auth = AuthContext::for_user(AuthMethod::Mtls, &user);
                auth.cert_cn = Some(cn);
                Attempt::Accepted(auth)
            }
            Err(reason) => Attempt::Rejected(reason),
        }
    }

    async fn enabled_user(&self, user_id: i64) -> Result<UserRecord, String> {
        match self.store.get_user(user_id).await {
            Ok(Some(user)) if user.is_enabled() => Ok(user),
            Ok(Some(_)) => Err("user disabled".to_string()),
            Ok(None) => Err("user not found".to_string()),
            Err(err) => Err(format!("user lookup failed: {err}")),
        }
    }

    async fn check_encryption_key(
        &self,
        ctx: &RequestContext,
        mut auth: AuthContext,
    ) -> Result<AuthContext, String> {
        let user = self
            .store
            .get_user(auth.user_id)
            .await
            .map_err(|err| format!("user lookup failed: {err}"))?;
        let Some(user) = user else {
            return Ok(auth);
        };
        auth.banned = user.banned;
        auth.redirect_model = user.redirect_model.clone();
        if !user.encryption_enabled {
            return Ok(auth);
        }
        let expected = user.encryption_key_hash.unwrap_or_default();
        match ctx.header("x-encryption-key") {
            Some(key) if !expected.is_empty() && sha256_hex(key.as_bytes()) == expected => Ok(auth),
            _ => Err(ENCRYPTION_MISMATCH.to_string()),
        }
    }

    async fn audit(
        &self,
        ctx: &RequestContext,
        method: &str,
        error: Option<&String>,
        latency_ms: u64,
    ) {
        let client_ip = ctx.client_ip();
        let tls = ctx.tls.as_ref();
        let payload = error.map(|_| truncate_payload(&ctx.body, self.config.audit_payload_limit));
        let entry = AuthAuditEntry {
            request_id: ctx.request_id.clone(),
            occurred_at: self.clock.now_unix(),
            method: method.to_string(),
            result: if error.is_some() { "failure" } else { "success" }.to_string(),
            client_ip,
            tls_version: tls.and_then(|peer| peer.version.clone()),
            tls_cipher: tls.and_then(|peer| peer.cipher.clone()),
            peer_cn: tls.and_then(|peer| peer.common_name.clone()),
            latency_ms: i64::try_from(latency_ms).unwrap_or(i64::MAX),
            error: error.cloned(),
            payload,
        };

        match &entry.error {
            Some(reason) => tracing::warn!(
                request_id = %entry.request_id,
                method = %entry.method,
                client_ip = %entry.client_ip,
                latency_ms = entry.latency_ms,
                error = %reason,
                "authentication failed"
            ),
            None => tracing::info!(
                request_id = %entry.request_id,
                method = %entry.method,
                client_ip = %entry.client_ip,
                latency_ms = entry.latency_ms,
                "authentication succeeded"
            ),
        }

        if let Err(err) = self.store.insert_auth_audit(&entry).await {
            tracing::warn!(request_id = %entry.request_id, error = %err, "auth audit persist failed");
        }
    }
}

const ENCRYPTION_MISMATCH: &str = "encryption key mismatch";

fn bearer_token(ctx: &RequestContext) -> Option<&str> {
    let value = ctx.header("authorization")?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// POST/PUT/PATCH with a JSON content type needs a non-empty JSON body.
pub fn validate_schema(
    method: &str,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<(), GatewayError> {
    if !matches!(method.to_ascii_uppercase().as_str(), "POST" | "PUT" | "PATCH") {
        return Ok(());
    }
    let is_json = content_type.is_some_and(|value| {
        value
            .split(';')
            .next()
            .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
    });
    if !is_json {
        return Ok(());
    }
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(GatewayError::SchemaInvalid {
            reason: "request body is empty".to_string(),
        });
    }
    serde_json::from_slice::<serde::de::IgnoredAny>(body)
        .map(|_| ())
        .map_err(|err| GatewayError::SchemaInvalid {
            reason: format!("request body is not valid json: {err}"),
        })
}

fn truncate_payload(body: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= limit {
        return text.into_owned();
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::gateway::ManualClock;
    use crate::gateway::cache::MemoryCache;
    use crate::gateway::store_types::TokenRecord;

    const NOW: u64 = 1_700_000_000;

    async fn fixture() -> (tempfile::TempDir, SqliteStore, Authenticator, i64) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("auth.sqlite"));
        store.init().await.expect("init");
        let user_id = store
            .insert_user(&user("alice"))
            .await
            .expect("user");
        store
            .insert_token(&token(user_id, "abc123", Vec::new()))
            .await
            .expect("token");

        let clock = Arc::new(ManualClock::new(NOW));
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new(clock.clone()));
        let config = AuthConfig {
            jwt_secret: Some("jwt-secret".to_string()),
            ..AuthConfig::default()
        };
        let auth = Authenticator::new(store.clone(), cache, config, clock);
        (dir, store, auth, user_id)
    }

    fn user(name: &str) -> UserRecord {
        UserRecord {
            id: 0,
            username: name.to_string(),
            quota: 500,
            used_quota: 0,
            status: 1,
            banned: false,
            redirect_model: None,
            encryption_key_hash: None,
            encryption_enabled: false,
            created_at: NOW as i64,
        }
    }

    fn token(user_id: i64, key: &str, allowed_ips: Vec<String>) -> TokenRecord {
        TokenRecord {
            id: 0,
            user_id,
            key: key.to_string(),
            name: "default".to_string(),
            status: 1,
            remain_quota: 100,
            unlimited_quota: false,
            model_limits: Vec::new(),
            allowed_ips,
            billing_mode: None,
            plan_assignment_id: None,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn api_key_with_sk_prefix_authenticates() {
        let (_dir, store, auth, user_id) = fixture().await;
        let ctx = RequestContext::new("POST", "/v1/chat/completions")
            .with_header("Authorization", "Bearer sk-abc123");
        let result = auth.authenticate(&ctx).await.expect("auth");
        assert_eq!(result.user_id, user_id);
        assert_eq!(result.method, AuthMethod::ApiKey);
        assert_eq!(result.remain_quota, 100);

        let audit = store.list_auth_audit(10).await.expect("audit");
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].result, "success");
        assert!(audit[0].payload.is_none());
    }

    #[tokio::test]
    async fn unknown_key_fails_and_audits_truncated_payload() {
        let (_dir, store, auth, _) = fixture().await;
        let body = "x".repeat(4096);
        let ctx = RequestContext::new("POST", "/v1/chat/completions")
            .with_header("Authorization", "Bearer sk-nope")
            .with_body(body);
        let err = auth.authenticate(&ctx).await.expect_err("reject");
        assert_eq!(err.status_code(), 401);

        let audit = store.list_auth_audit(10).await.expect("audit");
        assert_eq!(audit[0].result, "failure");
        assert_eq!(audit[0].payload.as_deref().map(str::len), Some(1024));
    }

    #[tokio::test]
    async fn missing_credentials_rejected() {
        let (_dir, _store, auth, _) = fixture().await;
        let err = auth
            .authenticate(&RequestContext::new("GET", "/v1/models"))
            .await
            .expect_err("reject");
        assert!(matches!(err, GatewayError::Unauthenticated { reason } if reason == "missing credentials"));
    }

    #[tokio::test]
    async fn allowed_ips_restrict_key() {
        let (_dir, store, auth, user_id) = fixture().await;
        store
            .insert_token(&token(user_id, "ipbound", vec!["10.1.0.0/16".to_string()]))
            .await
            .expect("token");

        let inside = RequestContext::new("GET", "/v1/models")
            .with_header("Authorization", "Bearer ipbound")
            .with_peer_addr("10.1.4.2:3000");
        assert!(auth.authenticate(&inside).await.is_ok());

        let outside = RequestContext::new("GET", "/v1/models")
            .with_header("Authorization", "Bearer ipbound")
            .with_peer_addr("10.2.0.1:3000");
        assert!(auth.authenticate(&outside).await.is_err());
    }

    #[tokio::test]
    async fn jwt_and_mtls_resolve_users() {
        let (_dir, _store, auth, user_id) = fixture().await;
        let jwt = jwt::sign_hs256(
            &json!({"user_id": user_id, "exp": NOW + 60}),
            "jwt-secret",
        );
        let ctx = RequestContext::new("GET", "/v1/models")
            .with_header("Authorization", format!("Bearer {jwt}"));
        let result = auth.authenticate(&ctx).await.expect("jwt");
        assert_eq!(result.method, AuthMethod::Jwt);
        assert_eq!(result.token_id, None);

        let peer = mtls::TlsPeer {
            common_name: Some("alice".to_string()),
            not_before: Some(NOW as i64 - 10),
            not_after: Some(NOW as i64 + 10),
            ..mtls::TlsPeer::default()
        };
        let ctx = RequestContext::new("GET", "/v1/models").with_tls(peer);
        let result = auth.authenticate(&ctx).await.expect("mtls");
        assert_eq!(result.method, AuthMethod::Mtls);
        assert_eq!(result.user_id, user_id);
        assert_eq!(result.cert_cn.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn jwt_token_claim_must_belong_to_user() {
        let (_dir, store, auth, user_id) = fixture().await;
        let mut limited = token(user_id, "limited", Vec::new());
        limited.model_limits = vec!["gpt-4o-mini".to_string()];
        let own_token = store.insert_token(&limited).await.expect("token");
        let mallory = store.insert_user(&user("mallory")).await.expect("user");
        let foreign_token = store
            .insert_token(&token(mallory, "mallorykey", Vec::new()))
            .await
            .expect("token");

        let bearer = |token_id: i64| {
            let jwt = jwt::sign_hs256(
                &json!({"user_id": user_id, "token_id": token_id, "exp": NOW + 60}),
                "jwt-secret",
            );
            RequestContext::new("GET", "/v1/models")
                .with_header("Authorization", format!("Bearer {jwt}"))
        };

        let result = auth.authenticate(&bearer(own_token)).await.expect("own token");
        assert_eq!(result.token_id, Some(own_token));
        assert!(!result.allows_model("gpt-4o"));

        let err = auth
            .authenticate(&bearer(foreign_token))
            .await
            .expect_err("foreign token");
        assert!(matches!(err, GatewayError::Unauthenticated { reason } if reason == "token does not belong to user"));
        assert!(auth.authenticate(&bearer(9_999)).await.is_err());
    }

    #[tokio::test]
    async fn disabled_user_rejected() {
        let (_dir, store, auth, _) = fixture().await;
        let mut disabled = user("bob");
        disabled.status = 2;
        let bob = store.insert_user(&disabled).await.expect("user");
        store
            .insert_token(&token(bob, "bobkey", Vec::new()))
            .await
            .expect("token");
        let ctx = RequestContext::new("GET", "/v1/models")
            .with_header("Authorization", "Bearer bobkey");
        assert!(auth.authenticate(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn encryption_key_mismatch_is_validation_error() {
        let (_dir, store, auth, _) = fixture().await;
        let mut carol = user("carol");
        carol.encryption_enabled = true;
        carol.encryption_key_hash = Some(sha256_hex(b"open-sesame"));
        let carol_id = store.insert_user(&carol).await.expect("user");
        store
            .insert_token(&token(carol_id, "carolkey", Vec::new()))
            .await
            .expect("token");

        let wrong = RequestContext::new("GET", "/v1/models")
            .with_header("Authorization", "Bearer carolkey")
            .with_header("X-Encryption-Key", "nope");
        let err = auth.authenticate(&wrong).await.expect_err("mismatch");
        assert_eq!(err.status_code(), 400);

        let right = RequestContext::new("GET", "/v1/models")
            .with_header("Authorization", "Bearer carolkey")
            .with_header("X-Encryption-Key", "open-sesame");
        assert!(auth.authenticate(&right).await.is_ok());
    }

    #[tokio::test]
    async fn replay_guard_rejects_second_use() {
        let (_dir, _store, auth, _) = fixture().await;
        auth.guard_replay("req-1").await.expect("first");
        let err = auth.guard_replay("req-1").await.expect_err("second");
        assert!(matches!(err, GatewayError::Replay { .. }));
        auth.guard_replay("req-2").await.expect("other id");
    }

    #[tokio::test]
    async fn replay_guard_skips_when_cache_down() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("auth.sqlite"));
        let clock = Arc::new(ManualClock::new(NOW));
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        cache.set_available(false);
        let auth = Authenticator::new(store, cache, AuthConfig::default(), clock);
        auth.guard_replay("req-1").await.expect("skip");
        auth.guard_replay("req-1").await.expect("skip");
    }

    #[test]
    fn schema_validation() {
        assert!(validate_schema("GET", Some("application/json"), b"").is_ok());
        assert!(validate_schema("POST", Some("text/plain"), b"").is_ok());
        assert!(validate_schema("POST", Some("application/json; charset=utf-8"), b" ").is_err());
        assert!(validate_schema("PATCH", Some("application/json"), b"{oops").is_err());
        assert!(validate_schema("PUT", Some("application/json"), br#"{"a":1}"#).is_ok());
    }
}
