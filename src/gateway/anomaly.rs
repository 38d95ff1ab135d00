//! Behavioural anomaly detection over per-user telemetry windows.
//!
//! The engine builds a [`DetectionContext`] per active user, runs every registered
//! [`AnomalyDetector`], stores what they find (deduplicated per user and rule for an
//! hour) and hands new anomalies to the [`enforcement::Enforcer`].

pub mod aggregation;
pub mod detectors;
pub mod enforcement;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use self::aggregation::{DeviceAggregate, IpAggregate, aggregate_devices, aggregate_ips};
use self::detectors::{AbnormalLoginRatio, HighRequestRatio, QuotaSpike, UnusualDeviceActivity};
use self::enforcement::Enforcer;
use super::Clock;
use super::cache::Cache;
use super::config::AnomalyConfig;
use super::context::SubjectKey;
use super::crypto::anonymize_subject;
use super::store::{SqliteStore, StoreError};
use super::store_types::{
    AnomalyBaselineRecord, AnomalySeverity, AnomalyStatus, SecurityAnomalyRecord,
};

pub const METRIC_QUOTA_USAGE: &str = "quota_usage";
pub const METRIC_LOGIN_RATIO: &str = "login_ratio";
pub const METRIC_REQUEST_COUNT: &str = "request_count";

const DEDUP_WINDOW_SECS: i64 = 3600;
const ACTIVE_USER_LOOKBACK_SECS: i64 = 7 * 86_400;
const BASELINE_WINDOW_SECS: i64 = 30 * 86_400;
const MAX_WINDOW_ROWS: usize = 50_000;

/// Everything the detectors see about one user and one window.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DetectionContext {
    pub user_id: i64,
    pub window_start: i64,
    pub window_end: i64,
    pub request_count: u64,
    pub quota_used: i64,
    pub login_count: u64,
    pub unique_ips: usize,
    pub unique_devices: usize,
    pub devices: Vec<DeviceAggregate>,
    pub ips: Vec<IpAggregate>,
    pub baselines: BTreeMap<String, AnomalyBaselineRecord>,
}

impl DetectionContext {
    pub fn baseline(&self, metric: &str) -> Option<&AnomalyBaselineRecord> {
        self.baselines.get(metric)
    }

    /// `<user>_<rule>_<hour bucket of the window start>`.
    pub fn dedup_key(&self, rule: &str) -> String {
        format!("{}_{}_{}", self.user_id, rule, self.window_start / 3600)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionResult {
    pub rule_type: &'static str,
    pub severity: AnomalySeverity,
    pub message: String,
    pub threshold: f64,
    pub actual_value: f64,
    pub baseline: f64,
    pub deviation_percent: f64,
    pub evidence: Value,
    pub dedup_key: String,
}

pub trait AnomalyDetector: Send + Sync {
    fn rule_type(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// `Some` when the rule fired.
    fn detect(&self, ctx: &DetectionContext) -> Option<DetectionResult>;
}

/// How long an anomaly of `severity` is kept before TTL cleanup removes it.
pub fn ttl_for_severity(severity: AnomalySeverity) -> i64 {
    const DAY: i64 = 86_400;
    match severity {
        AnomalySeverity::Critical => DAY,
        AnomalySeverity::High => 7 * DAY,
        AnomalySeverity::Medium => 14 * DAY,
        AnomalySeverity::Low => 30 * DAY,
        AnomalySeverity::Malicious => 14 * DAY,
    }
}

pub fn risk_score_for(severity: AnomalySeverity) -> f64 {
    match severity {
        AnomalySeverity::Low => 20.0,
        AnomalySeverity::Medium => 40.0,
        AnomalySeverity::High => 60.0,
        AnomalySeverity::Critical => 85.0,
        AnomalySeverity::Malicious => 100.0,
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub users_scanned: usize,
    pub anomalies_recorded: usize,
    pub duplicates_skipped: usize,
    pub enforced: usize,
    pub failures: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BaselineReport {
    pub users: usize,
    pub baselines_written: usize,
    pub failures: usize,
}

#[derive(Default)]
struct UserOutcome {
    recorded: usize,
    duplicates: usize,
    enforced: usize,
}

pub struct AnomalyEngine {
    store: SqliteStore,
    config: AnomalyConfig,
    anonymization_secret: String,
    detectors: Vec<Box<dyn AnomalyDetector>>,
    enforcer: Enforcer,
    clock: Arc<dyn Clock>,
}

impl AnomalyEngine {
    /// Engine with the four built-in detectors tuned from `config`.
    pub fn new(
        store: SqliteStore,
        cache: Arc<dyn Cache>,
        config: AnomalyConfig,
        anonymization_secret: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let detectors: Vec<Box<dyn AnomalyDetector>> = vec![
            Box::new(QuotaSpike {
                threshold_percent: config.quota_spike_percent,
            }),
            Box::new(AbnormalLoginRatio {
                default_baseline: config.login_ratio_baseline,
            }),
            Box::new(HighRequestRatio {
                threshold: config.request_ratio_threshold,
            }),
            Box::new(UnusualDeviceActivity {
                new_device_requests: config.new_device_requests,
                ip_change_threshold: config.ip_change_threshold,
            }),
        ];
        let enforcer = Enforcer::new(store.clone(), cache, config.clone(), clock.clone());
        Self {
            store,
            config,
            anonymization_secret: anonymization_secret.into(),
            detectors,
            enforcer,
            clock,
        }
    }

    pub fn add_detector(&mut self, detector: Box<dyn AnomalyDetector>) {
        self.detectors.push(detector);
    }

    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.rule_type()).collect()
    }

    pub fn enforcer(&self) -> &Enforcer {
        &self.enforcer
    }

    async fn subject_hashes(&self, user_id: i64) -> Result<Vec<String>, StoreError> {
        let mut subjects = vec![SubjectKey::user(user_id)];
        for token_id in self.store.token_ids_for_user(user_id).await? {
            subjects.push(SubjectKey::token(token_id));
        }
        Ok(subjects
            .iter()
            .map(|subject| anonymize_subject(&self.anonymization_secret, &subject.to_string()))
            .collect())
    }

    pub async fn build_context(
        &self,
        user_id: i64,
        window_end: i64,
    ) -> Result<DetectionContext, StoreError> {
        let window_start = window_end.saturating_sub(self.config.window_secs as i64);
        let logs = self
            .store
            .heimdall_logs_for_user(user_id, window_start, window_end, MAX_WINDOW_ROWS)
            .await?;
        let quota_used = self
            .store
            .charged_amount(self.subject_hashes(user_id).await?, window_start, window_end)
            .await?;
        let login_count = self.store.count_logins(user_id, window_start).await?;

        let devices = aggregate_devices(&logs);
        let ips = aggregate_ips(&logs);
        let unique_ips = logs
            .iter()
            .filter(|log| !log.client_ip.is_empty())
            .map(|log| log.client_ip.as_str())
            .collect::<BTreeSet<_>>()
            .len();

        let mut baselines = BTreeMap::new();
        for metric in [METRIC_QUOTA_USAGE, METRIC_LOGIN_RATIO, METRIC_REQUEST_COUNT] {
            if let Some(baseline) = self.store.get_baseline(user_id, metric).await? {
                baselines.insert(metric.to_string(), baseline);
            }
        }

        Ok(DetectionContext {
            user_id,
            window_start,
            window_end,
            request_count: logs.len() as u64,
            quota_used,
            login_count,
            unique_ips,
            unique_devices: devices.len(),
            devices,
            ips,
            baselines,
        })
    }

    fn record_for(
        &self,
        ctx: &DetectionContext,
        result: &DetectionResult,
        now: i64,
    ) -> SecurityAnomalyRecord {
        let mut evidence = result.evidence.clone();
        if let Value::Object(map) = &mut evidence {
            map.insert("dedup_key".to_string(), json!(result.dedup_key));
            map.insert("threshold".to_string(), json!(result.threshold));
            map.insert("actual_value".to_string(), json!(result.actual_value));
            map.insert(
                "window".to_string(),
                json!({"start": ctx.window_start, "end": ctx.window_end}),
            );
        }
        SecurityAnomalyRecord {
            id: 0,
            user_id: ctx.user_id,
            token_id: None,
            rule_type: result.rule_type.to_string(),
            severity: result.severity,
            message: result.message.clone(),
            evidence,
            risk_score: risk_score_for(result.severity),
            status: AnomalyStatus::Pending,
            action_taken: None,
            detected_at: now,
            actioned_at: None,
            ttl_until: Some(now.saturating_add(ttl_for_severity(result.severity))),
            reviewed_by: None,
            reviewed_at: None,
            review_decision: None,
            review_rationale: None,
        }
    }

    async fn process_user(&self, user_id: i64, now: i64) -> Result<UserOutcome, StoreError> {
        let ctx = self.build_context(user_id, now).await?;
        let mut outcome = UserOutcome::default();
        for detector in &self.detectors {
            let Some(result) = detector.detect(&ctx) else {
                continue;
            };
            let duplicate = self
                .store
                .recent_unresolved_anomaly(user_id, result.rule_type, now - DEDUP_WINDOW_SECS)
                .await?;
            if duplicate.is_some() {
                outcome.duplicates += 1;
                continue;
            }
            let mut record = self.record_for(&ctx, &result, now);
            record.id = self.store.insert_anomaly(&record).await?;
            outcome.recorded += 1;
            tracing::warn!(
                user_id,
                anomaly_id = record.id,
                rule = result.rule_type,
                severity = %result.severity,
                deviation = result.deviation_percent,
                "anomaly detected"
            );
            let action = self.enforcer.enforce(&record).await?;
            if action != super::store_types::EnforcementAction::Log {
                outcome.enforced += 1;
            }
        }
        Ok(outcome)
    }

    /// Runs every detector for `user_id` over the window ending now.
    pub async fn scan_user(&self, user_id: i64) -> Result<SweepReport, StoreError> {
        let outcome = self.process_user(user_id, self.clock.now_unix()).await?;
        Ok(SweepReport {
            users_scanned: 1,
            anomalies_recorded: outcome.recorded,
            duplicates_skipped: outcome.duplicates,
            enforced: outcome.enforced,
            failures: 0,
        })
    }

    /// Scans users active in the last week with at most `concurrency` in flight.
    /// Cancellation stops new users from being picked up.
    pub async fn sweep(&self, shutdown: &CancellationToken) -> Result<SweepReport, StoreError> {
        let now = self.clock.now_unix();
        let mut users = self
            .store
            .active_user_ids(now - ACTIVE_USER_LOOKBACK_SECS)
            .await?;
        users.truncate(self.config.batch_size.max(1));

        let mut report = SweepReport::default();
        let mut results = futures_util::stream::iter(users)
            .take_while(|_| std::future::ready(!shutdown.is_cancelled()))
            .map(|user_id| async move { (user_id, self.process_user(user_id, now).await) })
            .buffer_unordered(self.config.concurrency.max(1));
        while let Some((user_id, result)) = results.next().await {
            report.users_scanned += 1;
            match result {
                Ok(outcome) => {
                    report.anomalies_recorded += outcome.recorded;
                    report.duplicates_skipped += outcome.duplicates;
                    report.enforced += outcome.enforced;
                }
                Err(err) => {
                    report.failures += 1;
                    tracing::error!(user_id, error = %err, "anomaly scan failed");
                }
            }
        }
        tracing::info!(
            users = report.users_scanned,
            anomalies = report.anomalies_recorded,
            duplicates = report.duplicates_skipped,
            failures = report.failures,
            "anomaly sweep finished"
        );
        Ok(report)
    }

    /// Recomputes the 30-day baselines of every recently active user.
    pub async fn refresh_baselines(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<BaselineReport, StoreError> {
        let now = self.clock.now_unix();
        let users = self
            .store
            .active_user_ids(now - ACTIVE_USER_LOOKBACK_SECS)
            .await?;
        let mut report = BaselineReport::default();
        for user_id in users {
            if shutdown.is_cancelled() {
                break;
            }
            report.users += 1;
            match self.refresh_user_baselines(user_id, now).await {
                Ok(written) => report.baselines_written += written,
                Err(err) => {
                    report.failures += 1;
                    tracing::error!(user_id, error = %err, "baseline refresh failed");
                }
            }
        }
        Ok(report)
    }

    async fn refresh_user_baselines(&self, user_id: i64, now: i64) -> Result<usize, StoreError> {
        let since = now - BASELINE_WINDOW_SECS;
        let requests = self.store.count_user_requests(user_id, since).await?;
        let logins = self.store.count_logins(user_id, since).await?;
        let charged = self
            .store
            .charged_amount(self.subject_hashes(user_id).await?, since, now)
            .await?;

        let mut baselines = vec![
            (METRIC_QUOTA_USAGE, charged as f64, requests),
            (
                METRIC_REQUEST_COUNT,
                requests as f64 / (BASELINE_WINDOW_SECS / 3600) as f64,
                requests,
            ),
        ];
        if logins > 0 {
            baselines.push((METRIC_LOGIN_RATIO, requests as f64 / logins as f64, logins));
        }

        let mut written = 0;
        for (metric, value, sample) in baselines {
            if sample == 0 {
                continue;
            }
            self.store
                .upsert_baseline(&AnomalyBaselineRecord {
                    user_id,
                    metric_type: metric.to_string(),
                    baseline_value: value,
                    window_size_seconds: BASELINE_WINDOW_SECS,
                    sample_size: i64::try_from(sample).unwrap_or(i64::MAX),
                    updated_at: now,
                })
                .await?;
            written += 1;
        }
        Ok(written)
    }

    pub async fn list(
        &self,
        status: Option<AnomalyStatus>,
        limit: usize,
    ) -> Result<Vec<SecurityAnomalyRecord>, StoreError> {
        self.store.list_anomalies(status, limit).await
    }

    /// Confirms an anomaly; any enforcement stays in place.
    pub async fn approve(
        &self,
        id: i64,
        reviewer: i64,
        rationale: Option<&str>,
    ) -> Result<SecurityAnomalyRecord, StoreError> {
        self.review(id, AnomalyStatus::Approved, reviewer, "approve", rationale)
            .await
    }

    /// Dismisses an anomaly and rolls back its ban or redirect.
    pub async fn ignore(
        &self,
        id: i64,
        reviewer: i64,
        rationale: Option<&str>,
    ) -> Result<SecurityAnomalyRecord, StoreError> {
        let anomaly = self
            .store
            .get_anomaly(id)
            .await?
            .ok_or_else(|| StoreError::not_found("anomaly", id))?;
        self.enforcer.rollback(&anomaly).await?;
        self.review(id, AnomalyStatus::Ignored, reviewer, "ignore", rationale)
            .await
    }

    async fn review(
        &self,
        id: i64,
        status: AnomalyStatus,
        reviewer: i64,
        decision: &str,
        rationale: Option<&str>,
    ) -> Result<SecurityAnomalyRecord, StoreError> {
        let now = self.clock.now_unix();
        self.store
            .review_anomaly(id, status, reviewer, decision, rationale, now)
            .await?;
        tracing::info!(anomaly_id = id, reviewer, decision, "anomaly reviewed");
        self.store
            .get_anomaly(id)
            .await?
            .ok_or_else(|| StoreError::not_found("anomaly", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ManualClock;
    use crate::gateway::cache::MemoryCache;
    use crate::gateway::store_types::{EnforcementAction, HeimdallRequestLog, UserRecord};

    const NOW: u64 = 1_700_000_000;

    async fn setup() -> (tempfile::TempDir, SqliteStore, Arc<MemoryCache>, AnomalyEngine, i64) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("gateway.sqlite"));
        let user_id = store
            .insert_user(&UserRecord {
                id: 0,
                username: "burst".to_string(),
                quota: 1_000,
                used_quota: 0,
                status: 1,
                banned: false,
                redirect_model: None,
                encryption_key_hash: None,
                encryption_enabled: false,
                created_at: 0,
            })
            .await
            .expect("user");
        let clock = Arc::new(ManualClock::new(NOW));
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        let engine = AnomalyEngine::new(
            store.clone(),
            cache.clone(),
            AnomalyConfig::default(),
            "secret",
            clock,
        );
        (dir, store, cache, engine, user_id)
    }

    fn burst(user_id: i64, count: usize) -> Vec<HeimdallRequestLog> {
        (0..count)
            .map(|i| HeimdallRequestLog {
                request_id: format!("req-{i}"),
                occurred_at: NOW as i64 - 1800 + (i as i64 % 1000),
                client_ip: "198.51.100.4".to_string(),
                client_device_id: "cli".to_string(),
                model_name: "gpt-4o".to_string(),
                user_id: Some(user_id),
                ..HeimdallRequestLog::default()
            })
            .collect()
    }

    #[tokio::test]
    async fn context_counts_the_window() {
        let (_dir, store, _cache, engine, user_id) = setup().await;
        store.insert_heimdall_logs(&burst(user_id, 12)).await.expect("logs");
        store
            .record_login(user_id, "198.51.100.4", NOW as i64 - 60)
            .await
            .expect("login");

        let ctx = engine.build_context(user_id, NOW as i64).await.expect("ctx");
        assert_eq!(ctx.request_count, 12);
        assert_eq!(ctx.login_count, 1);
        assert_eq!(ctx.unique_ips, 1);
        assert_eq!(ctx.unique_devices, 1);
        assert_eq!(ctx.quota_used, 0);
        assert!(ctx.baselines.is_empty());
    }

    #[tokio::test]
    async fn sweep_records_enforces_and_dedups() {
        let (_dir, store, cache, engine, user_id) = setup().await;
        store.insert_heimdall_logs(&burst(user_id, 1001)).await.expect("logs");
        let shutdown = CancellationToken::new();

        let report = engine.sweep(&shutdown).await.expect("sweep");
        assert_eq!(report.users_scanned, 1);
        // Request burst without logins, plus a fresh device above the volume limit.
        assert_eq!(report.anomalies_recorded, 2);
        assert_eq!(report.enforced, 1);

        let anomalies = engine.list(None, 10).await.expect("list");
        assert_eq!(anomalies.len(), 2);
        let device = anomalies
            .iter()
            .find(|a| a.rule_type == "unusual_device_activity")
            .expect("device anomaly");
        assert_eq!(device.status, AnomalyStatus::Pending);
        let anomaly = anomalies
            .iter()
            .find(|a| a.rule_type == "high_request_ratio")
            .expect("ratio anomaly");
        assert_eq!(anomaly.status, AnomalyStatus::Actioned);
        assert_eq!(anomaly.action_taken, Some(EnforcementAction::Block));
        assert_eq!(anomaly.ttl_until, Some(NOW as i64 + 7 * 86_400));
        assert!(
            cache
                .get(&enforcement::directive_key(user_id))
                .await
                .expect("get")
                .is_some()
        );

        let again = engine.sweep(&shutdown).await.expect("sweep");
        assert_eq!(again.anomalies_recorded, 0);
        assert_eq!(again.duplicates_skipped, 2);

        let ignored = engine.ignore(anomaly.id, 1, Some("batch job")).await.expect("ignore");
        assert_eq!(ignored.status, AnomalyStatus::Ignored);
        assert_eq!(ignored.review_decision.as_deref(), Some("ignore"));
        assert!(
            cache
                .get(&enforcement::directive_key(user_id))
                .await
                .expect("get")
                .is_none()
        );
    }

    #[tokio::test]
    async fn baselines_follow_activity() {
        let (_dir, store, _cache, engine, user_id) = setup().await;
        store.insert_heimdall_logs(&burst(user_id, 40)).await.expect("logs");
        store
            .record_login(user_id, "198.51.100.4", NOW as i64 - 600)
            .await
            .expect("login");
        store
            .record_login(user_id, "198.51.100.4", NOW as i64 - 300)
            .await
            .expect("login");

        let report = engine
            .refresh_baselines(&CancellationToken::new())
            .await
            .expect("refresh");
        assert_eq!(report.users, 1);
        assert_eq!(report.baselines_written, 3);

        let ratio = store
            .get_baseline(user_id, METRIC_LOGIN_RATIO)
            .await
            .expect("get")
            .expect("baseline");
        assert_eq!(ratio.baseline_value, 20.0);
        assert_eq!(ratio.sample_size, 2);
        let usage = store
            .get_baseline(user_id, METRIC_QUOTA_USAGE)
            .await
            .expect("get")
            .expect("baseline");
        assert_eq!(usage.sample_size, 40);
    }

    #[test]
    fn ttl_and_risk_follow_severity() {
        assert_eq!(ttl_for_severity(AnomalySeverity::Critical), 86_400);
        assert_eq!(ttl_for_severity(AnomalySeverity::Low), 30 * 86_400);
        assert!(risk_score_for(AnomalySeverity::Critical) > 80.0);
        assert!(risk_score_for(AnomalySeverity::Low) <= 30.0);
    }
}
