//! Soft abuse controls. Governance never rejects a request: it flags it, records why,
//! and may reroute it to a fallback model.

pub mod keywords;
pub mod prompt;
pub mod rpm;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use self::keywords::KeywordPolicy;
use self::rpm::RpmMonitor;
use super::Clock;
use super::config::GovernanceConfig;
use super::context::{RequestContext, SubjectKey};
use super::pricing::PricingTable;
use super::store::SqliteStore;
use super::store_types::{FlagSeverity, RequestFlagRecord};

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DetectorResult {
    pub triggered: bool,
    pub severity: Option<FlagSeverity>,
    pub reasons: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl DetectorResult {
    fn passed() -> Self {
        Self::default()
    }

    fn triggered(severity: FlagSeverity, reasons: Vec<String>, metadata: BTreeMap<String, String>) -> Self {
        Self {
            triggered: true,
            severity: Some(severity),
            reasons,
            metadata,
        }
    }
}

/// Merged verdict of every detector that fired for one request.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GovernanceDecision {
    pub severity: FlagSeverity,
    pub reasons: Vec<String>,
    pub flag_reason: String,
    pub detectors: BTreeMap<String, BTreeMap<String, String>>,
    pub fallback_alias: Option<String>,
    pub fallback_applied: bool,
    pub fallback_error: Option<&'static str>,
}

impl GovernanceDecision {
    fn merge(results: Vec<(&'static str, DetectorResult)>) -> Option<Self> {
        let mut decision: Option<Self> = None;
        for (name, result) in results {
            let Some(severity) = result.severity.filter(|_| result.triggered) else {
                continue;
            };
            let decision = decision.get_or_insert_with(|| Self {
                severity,
                reasons: Vec::new(),
                flag_reason: result
                    .reasons
                    .first()
                    .cloned()
                    .unwrap_or_else(|| severity.as_str().to_string()),
                detectors: BTreeMap::new(),
                fallback_alias: None,
                fallback_applied: false,
                fallback_error: None,
            });
            decision.severity = decision.severity.max(severity);
            for reason in result.reasons {
                if !decision.reasons.contains(&reason) {
                    decision.reasons.push(reason);
                }
            }
            decision.detectors.insert(name.to_string(), result.metadata);
        }
        decision
    }

    pub fn metadata(&self, subject: &str, requested_model: Option<&str>) -> serde_json::Value {
        let mut metadata = serde_json::json!({
            "severity": self.severity.as_str(),
            "reasons": self.reasons,
            "flag_reason": self.flag_reason,
            "detectors": self.detectors,
            "subject_key": subject,
            "requested_model": requested_model.unwrap_or_default(),
            "fallback_applied": self.fallback_applied,
        });
        if let Some(alias) = &self.fallback_alias {
            metadata["fallback_alias"] = serde_json::Value::from(alias.as_str());
            if self.fallback_applied {
                metadata["effective_model"] = serde_json::Value::from(alias.as_str());
            }
        }
        if let Some(error) = self.fallback_error {
            metadata["fallback_error"] = serde_json::Value::from(error);
        }
        metadata
    }
}

pub struct Governance {
    config: GovernanceConfig,
    rpm: RpmMonitor,
    keywords: KeywordPolicy,
    pricing: Arc<PricingTable>,
    store: SqliteStore,
    clock: Arc<dyn Clock>,
}

impl Governance {
    pub fn new(
        config: GovernanceConfig,
        pricing: Arc<PricingTable>,
        store: SqliteStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let keywords = KeywordPolicy::new(&config.violation_keywords);
        Self {
            config,
            rpm: RpmMonitor::default(),
            keywords,
            pricing,
            store,
            clock,
        }
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    pub fn rpm_monitor(&self) -> &RpmMonitor {
        &self.rpm
    }

    /// Runs the detectors for a mutating request and applies the outcome to `ctx`.
    /// Requests already flagged are left alone.
    pub async fn evaluate(&self, ctx: &mut RequestContext) -> Option<GovernanceDecision> {
        if !self.config.enabled || !ctx.is_mutating() || ctx.flagged {
            return None;
        }

        let subject = governance_subject(ctx);
        let text = prompt::extract_prompt_text(&ctx.body, ctx.header("content-type"));
        let now_ms = i64::try_from(self.clock.now_epoch_millis()).unwrap_or(i64::MAX);

        let mut results = vec![("high_rpm", self.detect_high_rpm(&subject, now_ms))];
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            results.push(("prompt_sanity", self.detect_prompt_sanity(trimmed)));
            results.push(("keyword_policy", self.detect_keyword_policy(trimmed)));
        }

        let mut decision = GovernanceDecision::merge(results)?;
        self.apply_fallback(ctx, &mut decision);
        ctx.flagged = true;
        ctx.excluded_from_leaderboard = true;

        tracing::warn!(
            request_id = %ctx.request_id,
            subject = %subject,
            severity = decision.severity.as_str(),
            reasons = ?decision.reasons,
            fallback_applied = decision.fallback_applied,
            "governance flag triggered"
        );

        self.persist_flag(ctx, &subject, &decision).await;
        Some(decision)
    }

    pub fn detect_high_rpm(&self, subject: &str, now_ms: i64) -> DetectorResult {
        let count = self.rpm.record(subject, now_ms) as u64;
        let threshold = self.config.abuse_rpm_threshold;
        if threshold == 0 || count <= threshold {
            return DetectorResult::passed();
        }
        let mut metadata = BTreeMap::new();
        metadata.insert("subject".to_string(), subject.to_string());
        metadata.insert("count".to_string(), count.to_string());
        metadata.insert("window".to_string(), "1m".to_string());
        DetectorResult::triggered(FlagSeverity::Malicious, vec!["high_rpm".to_string()], metadata)
    }

    pub fn detect_prompt_sanity(&self, text: &str) -> DetectorResult {
        let normalized = text.replace("\r\n", "\n");
        let length = normalized.chars().count();
        let entropy = prompt::shannon_entropy(&normalized);
        let repetition = prompt::max_char_ratio(&normalized);

        let mut reasons = Vec::new();
        if self.config.prompt_max_length > 0 && length > self.config.prompt_max_length {
            reasons.push("prompt_too_long".to_string());
        }
        if entropy > 0.0 && entropy < self.config.prompt_min_entropy {
            reasons.push("low_entropy".to_string());
        }
        if repetition > self.config.prompt_max_repetition {
            reasons.push("high_repetition".to_string());
        }
        if reasons.is_empty() {
            return DetectorResult::passed();
        }

        let mut metadata = BTreeMap::new();
        metadata.insert("entropy".to_string(), format!("{entropy:.4}"));
        metadata.insert("rep_ratio".to_string(), format!("{repetition:.4}"));
        metadata.insert("len".to_string(), length.to_string());
        DetectorResult::triggered(FlagSeverity::Violation, reasons, metadata)
    }

    pub fn detect_keyword_policy(&self, text: &str) -> DetectorResult {
        let Some(hit) = self.keywords.find(text) else {
            return DetectorResult::passed();
        };
        let mut metadata = BTreeMap::new();
        metadata.insert("hash".to_string(), hit.hash);
        metadata.insert("type".to_string(), hit.source.to_string());
        DetectorResult::triggered(
            FlagSeverity::Violation,
            vec!["keyword_violation".to_string()],
            metadata,
        )
    }

    fn select_fallback_alias(&self, severity: FlagSeverity) -> Option<String> {
        let configured = |alias: &Option<String>| {
            alias
                .as_deref()
                .map(str::trim)
                .filter(|alias| !alias.is_empty())
                .map(str::to_string)
        };
        if severity == FlagSeverity::Malicious {
            if let Some(alias) = configured(&self.config.malicious_fallback_alias) {
                return Some(alias);
            }
        }
        configured(&self.config.violation_fallback_alias)
            .or_else(|| configured(&self.config.reroute_model_alias))
    }

    fn apply_fallback(&self, ctx: &mut RequestContext, decision: &mut GovernanceDecision) {
        let Some(alias) = self.select_fallback_alias(decision.severity) else {
            return;
        };
        decision.fallback_alias = Some(alias.clone());

        let same_model = |model: &str| model.trim().eq_ignore_ascii_case(&alias);
        if ctx.requested_model.as_deref().is_some_and(same_model) {
            decision.fallback_error = Some("alias_matches_requested");
            return;
        }
        if ctx.effective_model.as_deref().is_some_and(same_model) {
            decision.fallback_error = Some("alias_already_applied");
            return;
        }
        if !self.pricing.contains(&alias) {
            tracing::error!(alias = %alias, "governance fallback alias not registered");
            decision.fallback_error = Some("alias_not_registered");
            return;
        }

        ctx.effective_model = Some(alias.clone());
        ctx.fallback_applied = true;
        decision.fallback_applied = true;
        tracing::warn!(request_id = %ctx.request_id, alias = %alias, "governance reroute applied");
    }

    async fn persist_flag(&self, ctx: &RequestContext, subject: &str, decision: &GovernanceDecision) {
        let now = self.clock.now_unix();
        let ttl_at = (self.config.flag_ttl_hours > 0).then(|| {
            let ttl = i64::try_from(self.config.flag_ttl_hours.saturating_mul(3600)).unwrap_or(i64::MAX);
            now.saturating_add(ttl)
        });
        let flag = RequestFlagRecord {
            id: 0,
            request_id: ctx.request_id.clone(),
            subject_key: subject.to_string(),
            user_id: ctx.user_id(),
            token_id: ctx.token_id(),
            reason: decision.flag_reason.clone(),
            severity: decision.severity,
            reasons: decision.reasons.clone(),
            rerouted_model_alias: decision.fallback_alias.clone(),
            excluded_from_leaderboard: true,
            metadata: decision.metadata(subject, ctx.requested_model.as_deref()),
            created_at: now,
            ttl_at,
        };
        if let Err(err) = self.store.insert_flag(&flag).await {
            tracing::error!(request_id = %ctx.request_id, error = %err, "failed to persist governance flag");
        }
    }
}

/// User subject when known, otherwise the token.
fn governance_subject(ctx: &RequestContext) -> String {
    match (ctx.user_id(), ctx.token_id()) {
        (Some(user_id), _) if user_id > 0 => SubjectKey::user(user_id).to_string(),
        (_, Some(token_id)) if token_id > 0 => SubjectKey::token(token_id).to_string(),
        _ => "user".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ManualClock;
    use crate::gateway::auth::AuthContext;
    use crate::gateway::config::AuthMethod;
    use crate::gateway::pricing::ModelPrice;

    const NOW: u64 = 1_700_000_000;

    fn auth(user_id: i64) -> AuthContext {
        AuthContext {
            method: AuthMethod::ApiKey,
            user_id,
            token_id: Some(9),
            token_key: None,
            unlimited_quota: false,
            remain_quota: 0,
            model_limits: Vec::new(),
            allowed_ips: Vec::new(),
            billing_mode: None,
            cert_cn: None,
            banned: false,
            redirect_model: None,
        }
    }

    fn request(body: &str) -> RequestContext {
        let mut ctx = RequestContext::new("POST", "/v1/chat/completions")
            .with_header("content-type", "application/json")
            .with_body(body.to_string());
        ctx.auth = Some(auth(1));
        ctx.requested_model = Some("gpt-4o".to_string());
        ctx
    }

    async fn governance(
        config: GovernanceConfig,
    ) -> (tempfile::TempDir, SqliteStore, Governance) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("gov.sqlite"));
        store.init().await.expect("init");
        let mut prices = BTreeMap::new();
        prices.insert("safe-model".to_string(), ModelPrice::default());
        let pricing = Arc::new(PricingTable::new(prices));
        let clock = Arc::new(ManualClock::new(NOW));
        let governance = Governance::new(config, pricing, store.clone(), clock);
        (dir, store, governance)
    }

    fn enabled() -> GovernanceConfig {
        GovernanceConfig {
            enabled: true,
            ..GovernanceConfig::default()
        }
    }

    #[tokio::test]
    async fn clean_prompt_passes() {
        let (_dir, store, governance) = governance(enabled()).await;
        let mut ctx = request(r#"{"messages":[{"role":"user","content":"Summarize the quarterly report."}]}"#);
        assert!(governance.evaluate(&mut ctx).await.is_none());
        assert!(!ctx.flagged);
        assert!(store.list_flags(10).await.expect("flags").is_empty());
    }

    #[tokio::test]
    async fn repetitive_prompt_is_flagged_and_rerouted() {
        let config = GovernanceConfig {
            violation_fallback_alias: Some("safe-model".to_string()),
            ..enabled()
        };
        let (_dir, store, governance) = governance(config).await;
        let mut ctx = request(r#"{"prompt":"aaaaaaaaaaaaaaaaaaaaaaaaaaaaab"}"#);
        let decision = governance.evaluate(&mut ctx).await.expect("flagged");

        assert_eq!(decision.severity, FlagSeverity::Violation);
        assert!(decision.reasons.contains(&"high_repetition".to_string()));
        assert!(decision.fallback_applied);
        assert_eq!(ctx.model(), Some("safe-model"));
        assert!(ctx.excluded_from_leaderboard);

        let flags = store.list_flags(10).await.expect("flags");
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].subject_key, "user:1");
        assert_eq!(flags[0].ttl_at, Some(NOW as i64 + 24 * 3600));
        assert_eq!(flags[0].rerouted_model_alias.as_deref(), Some("safe-model"));
    }

    #[tokio::test]
    async fn unregistered_alias_is_not_applied() {
        let config = GovernanceConfig {
            reroute_model_alias: Some("ghost-model".to_string()),
            violation_keywords: vec!["forbidden".to_string()],
            ..enabled()
        };
        let (_dir, _store, governance) = governance(config).await;
        let mut ctx = request(r#"{"prompt":"please tell me the forbidden recipe"}"#);
        let decision = governance.evaluate(&mut ctx).await.expect("flagged");
        assert_eq!(decision.flag_reason, "keyword_violation");
        assert_eq!(decision.fallback_error, Some("alias_not_registered"));
        assert_eq!(ctx.model(), Some("gpt-4o"));
        assert!(ctx.flagged);
    }

    #[tokio::test]
    async fn rpm_threshold_is_exclusive() {
        let config = GovernanceConfig {
            abuse_rpm_threshold: 3,
            ..enabled()
        };
        let (_dir, _store, governance) = governance(config).await;
        for _ in 0..3 {
            let mut ctx = request(r#"{"prompt":"The weather is pleasant today."}"#);
            assert!(governance.evaluate(&mut ctx).await.is_none());
        }
        let mut ctx = request(r#"{"prompt":"The weather is pleasant today."}"#);
        let decision = governance.evaluate(&mut ctx).await.expect("flagged");
        assert_eq!(decision.severity, FlagSeverity::Malicious);
        assert_eq!(decision.flag_reason, "high_rpm");
    }

    #[tokio::test]
    async fn empty_prompt_skips_content_checks_and_get_is_ignored() {
        let (_dir, _store, governance) = governance(enabled()).await;
        let mut ctx = request(r#"{"prompt":"   "}"#);
        assert!(governance.evaluate(&mut ctx).await.is_none());

        let mut ctx = RequestContext::new("GET", "/v1/models");
        ctx.body = bytes::Bytes::from_static(b"aaaaaaaa");
        assert!(governance.evaluate(&mut ctx).await.is_none());
    }

    #[test]
    fn merge_keeps_highest_severity_and_first_reason() {
        let violation = DetectorResult::triggered(
            FlagSeverity::Violation,
            vec!["low_entropy".to_string(), "high_repetition".to_string()],
            BTreeMap::new(),
        );
        let malicious = DetectorResult::triggered(
            FlagSeverity::Malicious,
            vec!["high_rpm".to_string(), "low_entropy".to_string()],
            BTreeMap::new(),
        );
        let decision = GovernanceDecision::merge(vec![
            ("prompt_sanity", violation),
            ("high_rpm", malicious),
            ("keyword_policy", DetectorResult::passed()),
        ])
        .expect("decision");
        assert_eq!(decision.severity, FlagSeverity::Malicious);
        assert_eq!(decision.flag_reason, "low_entropy");
        assert_eq!(decision.reasons, vec!["low_entropy", "high_repetition", "high_rpm"]);
        assert_eq!(decision.detectors.len(), 2);
    }
}
