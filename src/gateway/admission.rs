//! The process-wide [`Heimdall`] state and the per-request hot path.
//!
//! `admit` runs authentication, replay and schema checks, IP protection, rate limits,
//! user security state, governance and billing preparation in that order. The caller
//! dispatches upstream and reports back through `complete`, which commits or rolls
//! back the charge and hands a telemetry row to the pipeline.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::anomaly::AnomalyEngine;
use super::anomaly::enforcement::{DirectiveAction, DirectiveBook, spawn_listener};
use super::auth::{Authenticator, validate_schema};
use super::billing::{BillingEngine, ChargeOutcome, CommitParams, PreparedCharge, RelayInfo};
use super::cache::{Cache, MemoryCache};
use super::config::GatewayConfig;
use super::context::RequestContext;
use super::governance::{Governance, GovernanceDecision};
use super::ip_protection::{IpProtection, IpVerdict};
use super::limits::{LimitScope, RateLimiter, WindowLimit};
use super::observability::{Observability, ObservabilitySnapshot};
use super::pricing::PricingTable;
use super::scheduler::{Scheduler, SchedulerParts};
use super::store::{SqliteStore, StoreError};
use super::telemetry::{
    GeoLocator, HttpGeoLocator, ResponseSummary, TelemetryPipeline, TelemetrySink, request_log,
};
use super::upstream::{HttpUpstream, RelayFormat, Upstream, UpstreamRequest, UpstreamResponse, Usage};
use super::vouchers::VoucherService;
use super::{Clock, GatewayError, SystemClock};
use crate::HeimdallError;

/// Admission result carried to `complete`.
#[derive(Clone, Debug)]
pub struct Admission {
    pub prepared: PreparedCharge,
    pub governance: Option<GovernanceDecision>,
}

/// What the relay observed after dispatch.
#[derive(Clone, Debug, Default)]
pub struct Completion {
    pub status: u16,
    pub response_size: usize,
    pub upstream_provider: String,
    pub usage: Usage,
    pub error_message: Option<String>,
}

impl Completion {
    pub fn from_response(provider: &str, response: &UpstreamResponse) -> Self {
        Self {
            status: response.status,
            response_size: response.body.len(),
            upstream_provider: provider.to_string(),
            usage: response.usage,
            error_message: None,
        }
    }
}

pub struct HeimdallBuilder {
    config: GatewayConfig,
    cache: Option<Arc<dyn Cache>>,
    clock: Option<Arc<dyn Clock>>,
    upstream: Option<Arc<dyn Upstream>>,
    geo: Option<Arc<dyn GeoLocator>>,
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl HeimdallBuilder {
    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn upstream(mut self, upstream: Arc<dyn Upstream>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn geo_locator(mut self, geo: Arc<dyn GeoLocator>) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn telemetry_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Opens the store (creating the schema), picks the cache and starts telemetry.
    /// Must run inside a Tokio runtime.
    pub async fn build(self) -> Result<Heimdall, HeimdallError> {
        let config = self.config;
        config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = SqliteStore::new(&config.database_path);
        store.init().await?;

        let cache = match self.cache {
            Some(cache) => cache,
            None => default_cache(&config, clock.clone())?,
        };
        let upstream = match self.upstream {
            Some(upstream) => Some(upstream),
            None if config.upstream.base_url.is_some() => {
                Some(Arc::new(HttpUpstream::new(&config.upstream).map_err(|err| {
                    HeimdallError::Config(super::config::ConfigError::Invalid(err.to_string()))
                })?) as Arc<dyn Upstream>)
            }
            None => None,
        };
        let geo = match self.geo {
            Some(geo) => Some(geo),
            None => match config.telemetry.geolocation_url.as_deref() {
                Some(url) if config.telemetry.geolocation_enabled => Some(Arc::new(
                    HttpGeoLocator::new(
                        url,
                        Duration::from_millis(config.telemetry.geolocation_timeout_ms.max(1)),
                    )?,
                ) as Arc<dyn GeoLocator>),
                _ => None,
            },
        };

        let pricing = Arc::new(PricingTable::new(config.pricing.clone()));
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(store.clone()) as Arc<dyn TelemetrySink>);
        let telemetry = Arc::new(TelemetryPipeline::start(
            config.telemetry.clone(),
            sink,
            cache.clone(),
            geo,
            clock.clone(),
        ));
        let anomaly = Arc::new(AnomalyEngine::new(
            store.clone(),
            cache.clone(),
            config.anomaly.clone(),
            config.anonymization_secret.clone(),
            clock.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(SchedulerParts {
            store: store.clone(),
            config: config.scheduler.clone(),
            anomaly_config: config.anomaly.clone(),
            governance: config.governance.clone(),
            public_logs: config.public_logs.clone(),
            anonymization_secret: config.anonymization_secret.clone(),
            anomaly: anomaly.clone(),
            telemetry: Some(telemetry.clone()),
            clock: clock.clone(),
        }));

        tracing::info!(
            database = %config.database_path.display(),
            upstream = upstream.as_ref().map(|u| u.provider()).unwrap_or("none"),
            billing = config.billing.enabled,
            governance = config.governance.enabled,
            "heimdall initialised"
        );

        Ok(Heimdall {
            authenticator: Authenticator::new(
                store.clone(),
                cache.clone(),
                config.auth.clone(),
                clock.clone(),
            ),
            limiter: RateLimiter::new(cache.clone(), config.rate_limit.clone(), clock.clone()),
            ip_protection: IpProtection::new(
                store.clone(),
                cache.clone(),
                config.ip_protection.clone(),
                clock.clone(),
            ),
            governance: Governance::new(
                config.governance.clone(),
                pricing.clone(),
                store.clone(),
                clock.clone(),
            ),
            billing: BillingEngine::new(
                store.clone(),
                config.billing.clone(),
                config.anonymization_secret.clone(),
                clock.clone(),
            ),
            vouchers: VoucherService::new(store.clone(), clock.clone()),
            directives: Arc::new(DirectiveBook::new(clock.clone())),
            observability: Mutex::new(Observability::default()),
            pricing,
            telemetry,
            anomaly,
            scheduler,
            upstream,
            cache,
            store,
            clock,
            config,
        })
    }
}

#[cfg(feature = "gateway-store-redis")]
fn default_cache(
    config: &GatewayConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn Cache>, HeimdallError> {
    match config.redis_url.as_deref() {
        Some(url) => Ok(Arc::new(super::cache::RedisCache::new(url)?)),
        None => Ok(Arc::new(MemoryCache::new(clock))),
    }
}

#[cfg(not(feature = "gateway-store-redis"))]
fn default_cache(
    config: &GatewayConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn Cache>, HeimdallError> {
    if config.redis_url.is_some() {
        tracing::warn!("redis_url set but built without gateway-store-redis; using memory cache");
    }
    Ok(Arc::new(MemoryCache::new(clock)))
}

pub struct Heimdall {
    config: GatewayConfig,
    store: SqliteStore,
    cache: Arc<dyn Cache>,
    clock: Arc<dyn Clock>,
    authenticator: Authenticator,
    limiter: RateLimiter,
    ip_protection: IpProtection,
    governance: Governance,
    billing: BillingEngine,
    pricing: Arc<PricingTable>,
    telemetry: Arc<TelemetryPipeline>,
    anomaly: Arc<AnomalyEngine>,
    scheduler: Arc<Scheduler>,
    directives: Arc<DirectiveBook>,
    vouchers: VoucherService,
    upstream: Option<Arc<dyn Upstream>>,
    observability: Mutex<Observability>,
}

impl Heimdall {
    pub fn builder(config: GatewayConfig) -> HeimdallBuilder {
        HeimdallBuilder {
            config,
            cache: None,
            clock: None,
            upstream: None,
            geo: None,
            sink: None,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    pub fn billing(&self) -> &BillingEngine {
        &self.billing
    }

    pub fn ip_protection(&self) -> &IpProtection {
        &self.ip_protection
    }

    pub fn telemetry(&self) -> &TelemetryPipeline {
        &self.telemetry
    }

    pub fn anomaly(&self) -> &AnomalyEngine {
        &self.anomaly
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn directives(&self) -> &DirectiveBook {
        &self.directives
    }

    pub fn vouchers(&self) -> &VoucherService {
        &self.vouchers
    }

    pub fn upstream(&self) -> Option<&Arc<dyn Upstream>> {
        self.upstream.as_ref()
    }

    /// Starts the directive listener and, on the leader, the scheduler loops.
    pub fn start_background(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = vec![spawn_listener(
            self.cache.clone(),
            self.directives.clone(),
            shutdown.clone(),
        )];
        handles.extend(self.scheduler.start(shutdown));
        handles
    }

    /// Drains telemetry; background tasks stop through their cancellation token.
    pub async fn shutdown(&self) {
        self.telemetry.shutdown().await;
    }

    fn observe(&self, f: impl FnOnce(&mut Observability)) {
        if let Ok(mut observability) = self.observability.lock() {
            f(&mut observability);
        }
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        let stats = self.telemetry.stats();
        self.observability
            .lock()
            .map(|obs| obs.snapshot_with_telemetry(stats.dropped, stats.spilled, stats.persisted))
            .unwrap_or_default()
    }

    pub async fn record_login(&self, user_id: i64, client_ip: &str) -> Result<(), StoreError> {
        self.store
            .record_login(user_id, client_ip, self.clock.now_unix())
            .await
    }

    /// Runs every admission stage. A rejection is counted and logged to telemetry
    /// before it is returned.
    pub async fn admit(&self, ctx: &mut RequestContext) -> Result<Admission, GatewayError> {
        self.observe(Observability::record_request);
        if ctx.started_at_ms == 0 {
            ctx.started_at_ms = self.clock.now_epoch_millis();
        }
        ctx.adopt_client_request_id();
        if ctx.requested_model.is_none() {
            ctx.requested_model = model_from_body(&ctx.body);
        }

        match self.run_admission(ctx).await {
            Ok(admission) => {
                self.observe(Observability::record_admitted);
                tracing::debug!(
                    request_id = %ctx.request_id,
                    user_id = ?ctx.user_id(),
                    model = ?ctx.model(),
                    mode = admission.prepared.mode.as_str(),
                    "request admitted"
                );
                Ok(admission)
            }
            Err(err) => {
                self.reject(ctx, &err);
                Err(err)
            }
        }
    }

    async fn run_admission(&self, ctx: &mut RequestContext) -> Result<Admission, GatewayError> {
        let auth = self.authenticator.authenticate(ctx).await?;
        ctx.auth = Some(auth.clone());
        self.authenticator.guard_replay(&ctx.request_id).await?;
        validate_schema(&ctx.method, ctx.header("content-type"), &ctx.body)?;

        let ip = ctx.client_ip();
        if self.ip_protection.check(&ip).await? == IpVerdict::Whitelisted {
            ctx.ip_whitelisted = true;
        }
        if self.limiter.enabled() && !ctx.ip_whitelisted {
            if let Err(err) = self.check_rate_limits(ctx, &ip).await {
                self.ip_protection.record_violation(&ip, "rate_limit").await;
                return Err(err);
            }
        }

        self.apply_security_state(ctx).await?;
        if let Some(model) = ctx.requested_model.as_deref() {
            if !auth.allows_model(model) {
                return Err(GatewayError::UserBlocked {
                    code: "model_not_allowed",
                    reason: format!("token has no access to model {model}"),
                });
            }
        }

        let governance = self.governance.evaluate(ctx).await;
        if let Some(decision) = &governance {
            let applied = decision.fallback_applied;
            self.observe(|obs| obs.record_flagged(applied));
        }

        let subject = ctx.subject_key().ok_or_else(|| GatewayError::Unauthenticated {
            reason: "no subject".to_string(),
        })?;
        let relay = RelayInfo {
            user_id: auth.user_id,
            token_id: auth.token_id,
            model: ctx.model().unwrap_or_default().to_string(),
            billing_mode_override: ctx.billing_mode_override.or(auth.billing_mode),
        };
        let prepared = self
            .billing
            .prepare_charge(&subject.to_string(), &relay)
            .await?;
        Ok(Admission {
            prepared,
            governance,
        })
    }

    async fn check_rate_limits(&self, ctx: &RequestContext, ip: &str) -> Result<(), GatewayError> {
        let key_id = match (ctx.token_id(), ctx.user_id()) {
            (Some(token_id), _) => token_id.to_string(),
            (None, Some(user_id)) => format!("user:{user_id}"),
            (None, None) => return Ok(()),
        };
        self.limiter
            .check(LimitScope::Token, &key_id, self.limiter.default_limit(LimitScope::Token))
            .await?;
        if ip.is_empty() {
            return Ok(());
        }
        let ip_limit = match self.ip_protection.rule_for(ip).await {
            Some(rule) => WindowLimit {
                max_requests: rule.max_requests,
                window: Duration::from_secs(rule.window_secs.max(1)),
            },
            None => self.limiter.default_limit(LimitScope::Ip),
        };
        self.limiter.check(LimitScope::Ip, ip, ip_limit).await?;
        Ok(())
    }

    /// Banned users and live block/ban directives are rejected; redirects become the
    /// effective model.
    async fn apply_security_state(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        let Some(auth) = ctx.auth.as_ref() else {
            return Ok(());
        };
        let user_id = auth.user_id;
        if auth.banned {
            return Err(GatewayError::UserBlocked {
                code: "user_banned",
                reason: "user is banned".to_string(),
            });
        }
        let mut redirect = auth.redirect_model.clone();

        if let Some(directive) = self.directives.lookup(self.cache.as_ref(), user_id).await {
            if directive.rejects_requests() {
                self.observe(Observability::record_directive_rejection);
                tracing::warn!(
                    request_id = %ctx.request_id,
                    user_id,
                    action = ?directive.action,
                    "request rejected by security directive"
                );
                return Err(GatewayError::UserBlocked {
                    code: "heimdall_block",
                    reason: if directive.message.is_empty() {
                        "access suspended by security policy".to_string()
                    } else {
                        directive.message
                    },
                });
            }
            if directive.action == DirectiveAction::Redirect && directive.redirect_model.is_some() {
                redirect = directive.redirect_model;
            }
        }

        if let Some(model) = redirect {
            if ctx.requested_model.as_deref() != Some(model.as_str()) {
                tracing::info!(request_id = %ctx.request_id, user_id, model = %model, "user redirect applied");
                ctx.effective_model = Some(model);
            }
        }
        Ok(())
    }

    fn reject(&self, ctx: &RequestContext, err: &GatewayError) {
        let kind = err.kind();
        self.observe(|obs| obs.record_rejected(kind));
        tracing::info!(
            request_id = %ctx.request_id,
            kind,
            status = err.status_code(),
            error = %err,
            "request rejected"
        );
        let summary = ResponseSummary {
            status: err.status_code(),
            response_size: 0,
            upstream_provider: String::new(),
            error_message: Some(err.to_string()),
        };
        self.telemetry
            .enqueue(request_log(ctx, &summary, self.clock.now_epoch_millis()));
    }

    /// Commits the charge for a successful dispatch, rolls it back otherwise, and
    /// enqueues the telemetry row either way.
    pub async fn complete(
        &self,
        ctx: &RequestContext,
        admission: &Admission,
        completion: &Completion,
    ) -> Result<Option<ChargeOutcome>, GatewayError> {
        let now_ms = self.clock.now_epoch_millis();
        let succeeded = (200..300).contains(&completion.status);
        let outcome = if succeeded {
            self.commit(ctx, admission, completion, now_ms).await.map(Some)
        } else {
            self.billing.rollback_charge(&ctx.request_id).await.map(|_| None)
        };
        match &outcome {
            Ok(Some(_)) => self.observe(Observability::record_commit),
            Ok(None) => self.observe(Observability::record_rollback),
            Err(err) => {
                let kind = err.kind();
                self.observe(|obs| obs.record_rejected(kind));
                tracing::warn!(request_id = %ctx.request_id, error = %err, "billing commit failed");
            }
        }

        let summary = ResponseSummary {
            status: match &outcome {
                Err(err) => err.status_code(),
                Ok(_) => completion.status,
            },
            response_size: completion.response_size,
            upstream_provider: completion.upstream_provider.clone(),
            error_message: match &outcome {
                Err(err) => Some(err.to_string()),
                Ok(_) => completion.error_message.clone(),
            },
        };
        self.telemetry.enqueue(request_log(ctx, &summary, now_ms));
        outcome
    }

    async fn commit(
        &self,
        ctx: &RequestContext,
        admission: &Admission,
        completion: &Completion,
        now_ms: u64,
    ) -> Result<ChargeOutcome, GatewayError> {
        let Some(auth) = ctx.auth.as_ref() else {
            return Err(GatewayError::Unauthenticated {
                reason: "request was not authenticated".to_string(),
            });
        };
        let model = ctx.model().unwrap_or_default().to_string();
        let amount = self
            .pricing
            .amount(admission.prepared.metric, &model, completion.usage.total());
        let params = CommitParams {
            request_id: ctx.request_id.clone(),
            user_id: auth.user_id,
            token_id: auth.token_id,
            unlimited_quota: auth.unlimited_quota,
            is_playground: ctx.is_playground,
            model_alias: model,
            upstream_provider: completion.upstream_provider.clone(),
            prompt_tokens: completion.usage.prompt_tokens,
            completion_tokens: completion.usage.completion_tokens,
            latency_ms: i64::try_from(now_ms.saturating_sub(ctx.started_at_ms)).unwrap_or(i64::MAX),
            amount,
            is_public: self.config.public_logs.enabled && !ctx.excluded_from_leaderboard,
        };
        self.billing.commit_charge(&admission.prepared, &params).await
    }

    /// Full relay: admit, dispatch to the configured upstream, then complete.
    pub async fn relay(&self, ctx: &mut RequestContext) -> Result<UpstreamResponse, GatewayError> {
        let admission = self.admit(ctx).await?;
        let Some(upstream) = self.upstream.clone() else {
            let err = GatewayError::Upstream {
                message: "no upstream configured".to_string(),
            };
            self.abandon(ctx, &admission, &err).await;
            return Err(err);
        };

        let request = UpstreamRequest {
            request_id: ctx.request_id.clone(),
            method: ctx.method.clone(),
            path: ctx.path.clone(),
            format: RelayFormat::from_path(&ctx.path),
            requested_model: ctx.requested_model.clone(),
            effective_model: ctx.effective_model.clone(),
            body: ctx.body.clone(),
        };
        let response = match upstream.dispatch(request).await {
            Ok(response) => response,
            Err(err) => {
                self.observe(|obs| obs.record_upstream_call(false));
                self.abandon(ctx, &admission, &err).await;
                return Err(err);
            }
        };
        self.observe(|obs| obs.record_upstream_call(response.is_success()));

        let completion = Completion::from_response(upstream.provider(), &response);
        self.complete(ctx, &admission, &completion).await?;
        Ok(response)
    }

    async fn abandon(&self, ctx: &RequestContext, admission: &Admission, err: &GatewayError) {
        let completion = Completion {
            status: err.status_code(),
            error_message: Some(err.to_string()),
            ..Completion::default()
        };
        if let Err(rollback) = self.complete(ctx, admission, &completion).await {
            tracing::warn!(request_id = %ctx.request_id, error = %rollback, "rollback failed");
        }
    }
}

fn model_from_body(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value
        .get("model")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|model| !model.is_empty())
        .map(str::to_string)
}
