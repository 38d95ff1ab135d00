//! Leader-only housekeeping: plan cycle resets, TTL cleanup, baseline refresh and the
//! anomaly sweep.

pub mod cleanup;
pub mod cycle_reset;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use self::cleanup::{CleanupPolicy, CleanupReport, run_ttl_cleanup};
use self::cycle_reset::{CycleResetReport, reset_expired_cycles};
use super::Clock;
use super::anomaly::{AnomalyEngine, BaselineReport, SweepReport};
use super::config::{AnomalyConfig, GovernanceConfig, PublicLogsConfig, SchedulerConfig};
use super::store::{SqliteStore, StoreError};
use super::telemetry::TelemetryPipeline;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Job {
    CycleReset,
    TtlCleanup,
    BaselineRefresh,
    AnomalySweep,
}

impl Job {
    pub const ALL: [Job; 4] = [
        Job::CycleReset,
        Job::TtlCleanup,
        Job::BaselineRefresh,
        Job::AnomalySweep,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Job::CycleReset => "cycle_reset",
            Job::TtlCleanup => "ttl_cleanup",
            Job::BaselineRefresh => "baseline_refresh",
            Job::AnomalySweep => "anomaly_sweep",
        }
    }

    /// Accepts both `cycle_reset` and `cycle-reset`.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|job| job.as_str() == normalized)
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobReport {
    CycleReset(CycleResetReport),
    TtlCleanup(CleanupReport),
    BaselineRefresh(BaselineReport),
    AnomalySweep(SweepReport),
    /// The job is switched off by configuration.
    Disabled { name: &'static str },
}

pub struct Scheduler {
    store: SqliteStore,
    config: SchedulerConfig,
    anomaly_config: AnomalyConfig,
    flag_ttl_hours: u64,
    public_logs: PublicLogsConfig,
    anonymization_secret: String,
    anomaly: Arc<AnomalyEngine>,
    telemetry: Option<Arc<TelemetryPipeline>>,
    clock: Arc<dyn Clock>,
}

pub struct SchedulerParts {
    pub store: SqliteStore,
    pub config: SchedulerConfig,
    pub anomaly_config: AnomalyConfig,
    pub governance: GovernanceConfig,
    pub public_logs: PublicLogsConfig,
    pub anonymization_secret: String,
    pub anomaly: Arc<AnomalyEngine>,
    pub telemetry: Option<Arc<TelemetryPipeline>>,
    pub clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(parts: SchedulerParts) -> Self {
        Self {
            store: parts.store,
            config: parts.config,
            anomaly_config: parts.anomaly_config,
            flag_ttl_hours: parts.governance.flag_ttl_hours,
            public_logs: parts.public_logs,
            anonymization_secret: parts.anonymization_secret,
            anomaly: parts.anomaly,
            telemetry: parts.telemetry,
            clock: parts.clock,
        }
    }

    fn interval(&self, job: Job) -> Duration {
        let secs = match job {
            Job::CycleReset => self.config.cycle_reset_interval_secs,
            Job::TtlCleanup => self.config.ttl_cleanup_interval_secs,
            Job::BaselineRefresh => self.config.baseline_refresh_interval_secs,
            Job::AnomalySweep => self.anomaly_config.sweep_interval_secs,
        };
        Duration::from_secs(secs.max(1))
    }

    fn enabled(&self, job: Job) -> bool {
        match job {
            Job::BaselineRefresh | Job::AnomalySweep => self.anomaly_config.enabled,
            Job::CycleReset | Job::TtlCleanup => true,
        }
    }

    /// Runs `job` once now. Cancellation stops it after the current item.
    pub async fn run_job(
        &self,
        job: Job,
        shutdown: &CancellationToken,
    ) -> Result<JobReport, StoreError> {
        if !self.enabled(job) {
            return Ok(JobReport::Disabled { name: job.as_str() });
        }
        let now = self.clock.now_unix();
        let report = match job {
            Job::CycleReset => JobReport::CycleReset(
                reset_expired_cycles(&self.store, &self.anonymization_secret, now, shutdown)
                    .await?,
            ),
            Job::TtlCleanup => JobReport::TtlCleanup(
                run_ttl_cleanup(
                    &self.store,
                    CleanupPolicy {
                        flag_ttl_hours: self.flag_ttl_hours,
                        public_logs: &self.public_logs,
                    },
                    self.telemetry.as_deref(),
                    now,
                )
                .await,
            ),
            Job::BaselineRefresh => {
                JobReport::BaselineRefresh(self.anomaly.refresh_baselines(shutdown).await?)
            }
            Job::AnomalySweep => JobReport::AnomalySweep(self.anomaly.sweep(shutdown).await?),
        };
        tracing::info!(job = %job, report = ?report, "scheduler job finished");
        Ok(report)
    }

    /// Spawns one loop per job: run at start, then every interval, until `shutdown`.
    /// Followers and a disabled scheduler spawn nothing.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        if !self.config.enabled || !self.config.leader {
            tracing::info!(
                enabled = self.config.enabled,
                leader = self.config.leader,
                "scheduler not started"
            );
            return Vec::new();
        }
        Job::ALL
            .into_iter()
            .filter(|job| self.enabled(*job))
            .map(|job| {
                let scheduler = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { scheduler.job_loop(job, shutdown).await })
            })
            .collect()
    }

    async fn job_loop(&self, job: Job, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval(job));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.run_job(job, &shutdown).await {
                        tracing::error!(job = %job, error = %err, "scheduler job failed");
                    }
                }
            }
        }
        tracing::debug!(job = %job, "scheduler loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ManualClock;
    use crate::gateway::cache::MemoryCache;
    use crate::gateway::store_types::{FlagSeverity, RequestFlagRecord};

    const NOW: u64 = 1_700_000_000;

    fn scheduler(store: &SqliteStore, config: SchedulerConfig) -> Arc<Scheduler> {
        let clock = Arc::new(ManualClock::new(NOW));
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        let anomaly = Arc::new(AnomalyEngine::new(
            store.clone(),
            cache,
            AnomalyConfig::default(),
            "secret",
            clock.clone(),
        ));
        Arc::new(Scheduler::new(SchedulerParts {
            store: store.clone(),
            config,
            anomaly_config: AnomalyConfig::default(),
            governance: GovernanceConfig::default(),
            public_logs: PublicLogsConfig::default(),
            anonymization_secret: "secret".to_string(),
            anomaly,
            telemetry: None,
            clock,
        }))
    }

    #[test]
    fn job_names_parse() {
        assert_eq!(Job::parse("cycle-reset"), Some(Job::CycleReset));
        assert_eq!(Job::parse(" TTL_CLEANUP "), Some(Job::TtlCleanup));
        assert_eq!(Job::parse("nope"), None);
        for job in Job::ALL {
            assert_eq!(Job::parse(job.as_str()), Some(job));
        }
    }

    #[tokio::test]
    async fn ttl_cleanup_drops_stale_flags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("gateway.sqlite"));
        let flag = |request_id: &str, created_at: i64| RequestFlagRecord {
            id: 0,
            request_id: request_id.to_string(),
            subject_key: "user:1".to_string(),
            user_id: Some(1),
            token_id: None,
            reason: "keyword".to_string(),
            severity: FlagSeverity::Violation,
            reasons: vec!["keyword".to_string()],
            rerouted_model_alias: None,
            excluded_from_leaderboard: true,
            metadata: serde_json::json!({}),
            created_at,
            ttl_at: None,
        };
        store.insert_flag(&flag("old", NOW as i64 - 25 * 3600)).await.expect("flag");
        store.insert_flag(&flag("new", NOW as i64 - 3600)).await.expect("flag");

        let scheduler = scheduler(&store, SchedulerConfig::default());
        let report = scheduler
            .run_job(Job::TtlCleanup, &CancellationToken::new())
            .await
            .expect("cleanup");
        let JobReport::TtlCleanup(report) = report else {
            panic!("unexpected report {report:?}");
        };
        assert_eq!(report.flags, 1);
        assert_eq!(report.failures, 0);
        let left = store.list_flags(10).await.expect("flags");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].request_id, "new");
    }

    #[tokio::test]
    async fn followers_do_not_start_jobs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("gateway.sqlite"));
        let follower = scheduler(
            &store,
            SchedulerConfig {
                leader: false,
                ..SchedulerConfig::default()
            },
        );
        assert!(follower.start(CancellationToken::new()).is_empty());
    }

    #[tokio::test]
    async fn leader_runs_every_job_until_cancelled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("gateway.sqlite"));
        let shutdown = CancellationToken::new();
        let handles = scheduler(&store, SchedulerConfig::default()).start(shutdown.clone());
        assert_eq!(handles.len(), Job::ALL.len());
        shutdown.cancel();
        for handle in handles {
            handle.await.expect("job loop");
        }
    }
}
