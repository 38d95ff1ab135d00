//! Turning anomalies into user restrictions, and carrying those restrictions to every
//! gateway node through the cache.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::gateway::Clock;
use crate::gateway::cache::Cache;
use crate::gateway::config::AnomalyConfig;
use crate::gateway::store::{SqliteStore, StoreError};
use crate::gateway::store_types::{AnomalySeverity, EnforcementAction, SecurityAnomalyRecord};

pub const DIRECTIVE_CHANNEL: &str = "heimdall:directives";
pub const DIRECTIVE_TTL: Duration = Duration::from_secs(3600);

pub fn directive_key(user_id: i64) -> String {
    format!("heimdall:directive:{user_id}")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveAction {
    Ban,
    Block,
    Redirect,
    /// Lifts whatever directive the user had.
    Clear,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    pub user_id: i64,
    pub action: DirectiveAction,
    #[serde(default)]
    pub anomaly_id: Option<i64>,
    #[serde(default)]
    pub severity: Option<AnomalySeverity>,
    pub timestamp: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub redirect_model: Option<String>,
}

impl Directive {
    pub fn is_live_at(&self, now: i64) -> bool {
        now < self.timestamp.saturating_add(DIRECTIVE_TTL.as_secs() as i64)
    }

    pub fn rejects_requests(&self) -> bool {
        matches!(self.action, DirectiveAction::Ban | DirectiveAction::Block)
    }
}

/// Latest live directive per user.
pub struct DirectiveBook {
    entries: RwLock<HashMap<i64, Directive>>,
    clock: Arc<dyn Clock>,
}

impl DirectiveBook {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn apply(&self, directive: Directive) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        match directive.action {
            DirectiveAction::Clear => {
                entries.remove(&directive.user_id);
            }
            _ => {
                let newer = entries
                    .get(&directive.user_id)
                    .is_none_or(|current| current.timestamp <= directive.timestamp);
                if newer {
                    entries.insert(directive.user_id, directive);
                }
            }
        }
    }

    pub fn get(&self, user_id: i64) -> Option<Directive> {
        let now = self.clock.now_unix();
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(&user_id).cloned())
            .filter(|directive| directive.is_live_at(now))
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Book entry first, then the per-user cache key written by the publisher.
    pub async fn lookup(&self, cache: &dyn Cache, user_id: i64) -> Option<Directive> {
        if let Some(directive) = self.get(user_id) {
            return Some(directive);
        }
        let raw = match cache.get(&directive_key(user_id)).await {
            Ok(raw) => raw?,
            Err(err) => {
                tracing::debug!(user_id, error = %err, "directive lookup skipped");
                return None;
            }
        };
        let directive: Directive = serde_json::from_str(&raw).ok()?;
        if directive.action == DirectiveAction::Clear
            || !directive.is_live_at(self.clock.now_unix())
        {
            return None;
        }
        self.apply(directive.clone());
        Some(directive)
    }
}

/// Feeds `book` from the directive channel until `shutdown`; resubscribes after errors.
pub fn spawn_listener(
    cache: Arc<dyn Cache>,
    book: Arc<DirectiveBook>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut stream = match cache.subscribe(DIRECTIVE_CHANNEL).await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(error = %err, "directive subscribe failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                    }
                }
            };
            tracing::info!(channel = DIRECTIVE_CHANNEL, "directive listener subscribed");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    message = stream.next() => match message {
                        Some(raw) => match serde_json::from_str::<Directive>(&raw) {
                            Ok(directive) => {
                                tracing::info!(
                                    user_id = directive.user_id,
                                    action = ?directive.action,
                                    "directive received"
                                );
                                book.apply(directive);
                            }
                            Err(err) => tracing::warn!(error = %err, "undecodable directive"),
                        },
                        None => break,
                    },
                }
            }
            tracing::warn!("directive stream closed, resubscribing");
        }
    })
}

pub struct Enforcer {
    store: SqliteStore,
    cache: Arc<dyn Cache>,
    config: AnomalyConfig,
    clock: Arc<dyn Clock>,
}

impl Enforcer {
    pub fn new(
        store: SqliteStore,
        cache: Arc<dyn Cache>,
        config: AnomalyConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cache,
            config,
            clock,
        }
    }

    pub fn determine_action(&self, anomaly: &SecurityAnomalyRecord) -> EnforcementAction {
        if anomaly.severity == AnomalySeverity::Malicious {
            if self.config.auto_ban_enabled {
                return EnforcementAction::Ban;
            }
            if self.config.auto_block_enabled {
                return EnforcementAction::Block;
            }
        }
        if anomaly.risk_score > 80.0 {
            EnforcementAction::Ban
        } else if anomaly.risk_score > 50.0 {
            EnforcementAction::Block
        } else if anomaly.risk_score > 30.0 {
            EnforcementAction::Redirect
        } else {
            EnforcementAction::Log
        }
    }

    /// Applies the action for a pending anomaly and marks it actioned. `Log`, and a
    /// redirect without a configured violation model, leave it pending for review.
    pub async fn enforce(
        &self,
        anomaly: &SecurityAnomalyRecord,
    ) -> Result<EnforcementAction, StoreError> {
        if !self.config.auto_enforcement_enabled {
            return Ok(EnforcementAction::Log);
        }
        let action = self.determine_action(anomaly);
        let directive_action = match action {
            EnforcementAction::Log => return Ok(action),
            EnforcementAction::Ban => {
                self.store.set_user_banned(anomaly.user_id, true).await?;
                DirectiveAction::Ban
            }
            EnforcementAction::Block => DirectiveAction::Block,
            EnforcementAction::Redirect => {
                // Nothing to redirect to: leave the anomaly for review.
                let Some(model) = self.config.violation_redirect_model.as_deref() else {
                    return Ok(EnforcementAction::Log);
                };
                self.store
                    .set_user_redirect(anomaly.user_id, Some(model))
                    .await?;
                DirectiveAction::Redirect
            }
        };

        let now = self.clock.now_unix();
        self.publish(&Directive {
            user_id: anomaly.user_id,
            action: directive_action,
            anomaly_id: Some(anomaly.id),
            severity: Some(anomaly.severity),
            timestamp: now,
            message: anomaly.message.clone(),
            redirect_model: self.config.violation_redirect_model.clone(),
        })
        .await;
        self.store
            .mark_anomaly_actioned(anomaly.id, action, now)
            .await?;
        tracing::warn!(
            user_id = anomaly.user_id,
            anomaly_id = anomaly.id,
            rule = %anomaly.rule_type,
            action = %action,
            "security enforcement applied"
        );
        Ok(action)
    }

    /// Reverses a ban or redirect and clears the user's directive.
    pub async fn rollback(&self, anomaly: &SecurityAnomalyRecord) -> Result<(), StoreError> {
        match anomaly.action_taken {
            Some(EnforcementAction::Ban) => {
                self.store.set_user_banned(anomaly.user_id, false).await?;
            }
            Some(EnforcementAction::Redirect) => {
                self.store.set_user_redirect(anomaly.user_id, None).await?;
            }
            Some(EnforcementAction::Block) => {}
            Some(EnforcementAction::Log) | None => return Ok(()),
        }
        self.publish(&Directive {
            user_id: anomaly.user_id,
            action: DirectiveAction::Clear,
            anomaly_id: Some(anomaly.id),
            severity: Some(anomaly.severity),
            timestamp: self.clock.now_unix(),
            message: "enforcement rolled back".to_string(),
            redirect_model: None,
        })
        .await;
        tracing::info!(user_id = anomaly.user_id, anomaly_id = anomaly.id, "enforcement rolled back");
        Ok(())
    }

    /// Stores the directive under its user key and announces it. Cache failures are
    /// logged; the store already holds the durable part.
    pub async fn publish(&self, directive: &Directive) {
        let payload = match serde_json::to_string(directive) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, "directive encode failed");
                return;
            }
        };
        let key = directive_key(directive.user_id);
        let stored = match directive.action {
            DirectiveAction::Clear => self.cache.del(&key).await,
            _ => self.cache.set(&key, &payload, Some(DIRECTIVE_TTL)).await,
        };
        if let Err(err) = stored {
            tracing::warn!(user_id = directive.user_id, error = %err, "directive key write failed");
        }
        if let Err(err) = self.cache.publish(DIRECTIVE_CHANNEL, &payload).await {
            tracing::warn!(user_id = directive.user_id, error = %err, "directive publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ManualClock;
    use crate::gateway::cache::MemoryCache;
    use crate::gateway::store_types::{AnomalyStatus, UserRecord};

    const NOW: u64 = 1_700_000_000;

    fn anomaly(user_id: i64, severity: AnomalySeverity, risk_score: f64) -> SecurityAnomalyRecord {
        SecurityAnomalyRecord {
            id: 0,
            user_id,
            token_id: None,
            rule_type: "quota_spike".to_string(),
            severity,
            message: "spike".to_string(),
            evidence: serde_json::json!({}),
            risk_score,
            status: AnomalyStatus::Pending,
            action_taken: None,
            detected_at: NOW as i64,
            actioned_at: None,
            ttl_until: None,
            reviewed_by: None,
            reviewed_at: None,
            review_decision: None,
            review_rationale: None,
        }
    }

    async fn setup(
        config: AnomalyConfig,
    ) -> (tempfile::TempDir, SqliteStore, Arc<MemoryCache>, Enforcer, i64) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("gateway.sqlite"));
        let user_id = store
            .insert_user(&UserRecord {
                id: 0,
                username: "mallory".to_string(),
                quota: 0,
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
        let enforcer = Enforcer::new(store.clone(), cache.clone(), config, clock);
        (dir, store, cache, enforcer, user_id)
    }

    #[tokio::test]
    async fn action_follows_severity_and_risk() {
        let (_dir, _store, _cache, enforcer, _) = setup(AnomalyConfig::default()).await;
        let pick = |severity, risk| enforcer.determine_action(&anomaly(1, severity, risk));
        assert_eq!(pick(AnomalySeverity::Malicious, 0.0), EnforcementAction::Block);
        assert_eq!(pick(AnomalySeverity::Critical, 85.0), EnforcementAction::Ban);
        assert_eq!(pick(AnomalySeverity::High, 60.0), EnforcementAction::Block);
        assert_eq!(pick(AnomalySeverity::Medium, 40.0), EnforcementAction::Redirect);
        assert_eq!(pick(AnomalySeverity::Low, 20.0), EnforcementAction::Log);
    }

    #[tokio::test]
    async fn ban_updates_user_and_publishes_directive() {
        let (_dir, store, cache, enforcer, user_id) = setup(AnomalyConfig::default()).await;
        let mut stream = cache.subscribe(DIRECTIVE_CHANNEL).await.expect("subscribe");
        let mut record = anomaly(user_id, AnomalySeverity::Critical, 90.0);
        record.id = store.insert_anomaly(&record).await.expect("insert");

        assert_eq!(enforcer.enforce(&record).await.expect("enforce"), EnforcementAction::Ban);
        assert!(store.get_user(user_id).await.expect("get").expect("user").banned);

        let raw = stream.next().await.expect("directive");
        let directive: Directive = serde_json::from_str(&raw).expect("decode");
        assert_eq!(directive.action, DirectiveAction::Ban);
        assert!(cache.get(&directive_key(user_id)).await.expect("get").is_some());

        let stored = store.get_anomaly(record.id).await.expect("get").expect("anomaly");
        assert_eq!(stored.status, AnomalyStatus::Actioned);
        enforcer.rollback(&stored).await.expect("rollback");
        assert!(!store.get_user(user_id).await.expect("get").expect("user").banned);
        assert!(cache.get(&directive_key(user_id)).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn book_keeps_latest_live_directive() {
        let clock = Arc::new(ManualClock::new(NOW));
        let cache = MemoryCache::new(clock.clone());
        let book = DirectiveBook::new(clock.clone());
        let directive = |action, timestamp| Directive {
            user_id: 3,
            action,
            anomaly_id: None,
            severity: None,
            timestamp,
            message: String::new(),
            redirect_model: None,
        };
        book.apply(directive(DirectiveAction::Block, NOW as i64));
        book.apply(directive(DirectiveAction::Redirect, NOW as i64 - 10));
        assert_eq!(book.get(3).map(|d| d.action), Some(DirectiveAction::Block));

        clock.advance(Duration::from_secs(3601));
        assert!(book.get(3).is_none());

        book.apply(directive(DirectiveAction::Clear, NOW as i64 + 4000));
        assert!(book.is_empty());

        let fresh = directive(DirectiveAction::Ban, NOW as i64 + 3601);
        cache
            .set(&directive_key(3), &serde_json::to_string(&fresh).expect("json"), None)
            .await
            .expect("set");
        assert_eq!(
            book.lookup(&cache, 3).await.map(|d| d.action),
            Some(DirectiveAction::Ban)
        );
        assert_eq!(book.len(), 1);
    }
}
