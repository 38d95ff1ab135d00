//! Hourly TTL sweep over flags, public logs, vouchers, anomalies, IP bans and spill files.

use serde::{Deserialize, Serialize};

use crate::gateway::config::PublicLogsConfig;
use crate::gateway::store::SqliteStore;
use crate::gateway::telemetry::TelemetryPipeline;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub flags: usize,
    pub public_logs: usize,
    pub voucher_batches: usize,
    pub voucher_codes: usize,
    pub anomalies: usize,
    pub ip_bans: usize,
    pub disk_segments: usize,
    pub failures: usize,
}

pub struct CleanupPolicy<'a> {
    pub flag_ttl_hours: u64,
    pub public_logs: &'a PublicLogsConfig,
}

/// Each step runs independently; a failing step is logged and counted.
pub async fn run_ttl_cleanup(
    store: &SqliteStore,
    policy: CleanupPolicy<'_>,
    telemetry: Option<&TelemetryPipeline>,
    now: i64,
) -> CleanupReport {
    let mut report = CleanupReport::default();
    let flag_ttl_secs = i64::try_from(policy.flag_ttl_hours.saturating_mul(3600)).unwrap_or(i64::MAX);

    match store.delete_expired_flags(now, flag_ttl_secs).await {
        Ok(removed) => report.flags = removed,
        Err(err) => {
            report.failures += 1;
            tracing::warn!(error = %err, "flag cleanup failed");
        }
    }

    if policy.public_logs.enabled {
        let retention = i64::try_from(policy.public_logs.retention_days.saturating_mul(86_400))
            .unwrap_or(i64::MAX);
        match store.delete_public_logs_before(now.saturating_sub(retention)).await {
            Ok(removed) => report.public_logs = removed,
            Err(err) => {
                report.failures += 1;
                tracing::warn!(error = %err, "public log cleanup failed");
            }
        }
    }

    match store.expire_voucher_batches(now).await {
        Ok((batches, codes)) => {
            report.voucher_batches = batches;
            report.voucher_codes = codes;
        }
        Err(err) => {
            report.failures += 1;
            tracing::warn!(error = %err, "voucher expiry failed");
        }
    }

    match store.delete_expired_anomalies(now).await {
        Ok(removed) => report.anomalies = removed,
        Err(err) => {
            report.failures += 1;
            tracing::warn!(error = %err, "anomaly cleanup failed");
        }
    }

    match store.lift_expired_ip_bans(now).await {
        Ok(lifted) => report.ip_bans = lifted,
        Err(err) => {
            report.failures += 1;
            tracing::warn!(error = %err, "ip ban expiry failed");
        }
    }

    if let Some(telemetry) = telemetry {
        report.disk_segments = telemetry.cleanup_disk_queue().await;
    }

    tracing::info!(
        flags = report.flags,
        public_logs = report.public_logs,
        voucher_batches = report.voucher_batches,
        anomalies = report.anomalies,
        ip_bans = report.ip_bans,
        disk_segments = report.disk_segments,
        "ttl cleanup finished"
    );
    report
}
