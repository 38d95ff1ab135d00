use serde_json::json;

use super::{
    AnomalyDetector, DetectionContext, DetectionResult, METRIC_LOGIN_RATIO, METRIC_QUOTA_USAGE,
};
use crate::gateway::store_types::AnomalySeverity;

/// Maps a deviation percentage onto a severity. Non-finite deviations are `medium`.
pub fn severity_for_deviation(deviation: f64, high_at: f64, critical_at: f64) -> AnomalySeverity {
    if !deviation.is_finite() {
        return AnomalySeverity::Medium;
    }
    if deviation >= critical_at {
        AnomalySeverity::Critical
    } else if deviation >= high_at {
        AnomalySeverity::High
    } else if deviation >= 100.0 {
        AnomalySeverity::Medium
    } else {
        AnomalySeverity::Low
    }
}

fn deviation_percent(actual: f64, expected: f64) -> f64 {
    (actual - expected) / expected * 100.0
}

/// Quota consumed well beyond what the request volume explains.
#[derive(Clone, Debug)]
pub struct QuotaSpike {
    pub threshold_percent: f64,
}

impl Default for QuotaSpike {
    fn default() -> Self {
        Self {
            threshold_percent: 150.0,
        }
    }
}

impl AnomalyDetector for QuotaSpike {
    fn rule_type(&self) -> &'static str {
        "quota_spike"
    }

    fn description(&self) -> &'static str {
        "quota consumption without matching request volume"
    }

    fn detect(&self, ctx: &DetectionContext) -> Option<DetectionResult> {
        let baseline = ctx.baseline(METRIC_QUOTA_USAGE)?;
        if baseline.baseline_value <= 0.0 || baseline.sample_size <= 0 {
            return None;
        }
        let per_request = baseline.baseline_value / baseline.sample_size as f64;
        let expected = per_request * ctx.request_count as f64;
        let threshold = expected * (1.0 + self.threshold_percent / 100.0);
        let actual = ctx.quota_used as f64;
        if actual <= threshold {
            return None;
        }
        let deviation = deviation_percent(actual, expected);
        Some(DetectionResult {
            rule_type: self.rule_type(),
            severity: severity_for_deviation(deviation, 200.0, 400.0),
            message: format!("quota spike: used {}, expected ~{expected:.0}", ctx.quota_used),
            threshold,
            actual_value: actual,
            baseline: expected,
            deviation_percent: deviation,
            evidence: json!({
                "expected_quota": expected,
                "actual_quota": actual,
                "request_count": ctx.request_count,
                "deviation_percent": deviation,
                "baseline_value": baseline.baseline_value,
            }),
            dedup_key: ctx.dedup_key(self.rule_type()),
        })
    }
}

/// Requests per login far above the user's own history.
#[derive(Clone, Debug)]
pub struct AbnormalLoginRatio {
    pub default_baseline: f64,
}

impl Default for AbnormalLoginRatio {
    fn default() -> Self {
        Self {
            default_baseline: 100.0,
        }
    }
}

impl AnomalyDetector for AbnormalLoginRatio {
    fn rule_type(&self) -> &'static str {
        "abnormal_login_ratio"
    }

    fn description(&self) -> &'static str {
        "request-to-login ratio above twice the baseline"
    }

    fn detect(&self, ctx: &DetectionContext) -> Option<DetectionResult> {
        if ctx.login_count < 1 {
            return None;
        }
        let ratio = ctx.request_count as f64 / ctx.login_count as f64;
        let baseline = ctx
            .baseline(METRIC_LOGIN_RATIO)
            .map(|baseline| baseline.baseline_value)
            .filter(|value| *value > 0.0)
            .unwrap_or(self.default_baseline);
        let threshold = baseline * 2.0;
        if ratio <= threshold {
            return None;
        }
        let deviation = deviation_percent(ratio, baseline);
        Some(DetectionResult {
            rule_type: self.rule_type(),
            severity: severity_for_deviation(deviation, 150.0, 400.0),
            message: format!(
                "abnormal login ratio: {ratio:.0} requests per login (baseline {baseline:.0})"
            ),
            threshold,
            actual_value: ratio,
            baseline,
            deviation_percent: deviation,
            evidence: json!({
                "request_count": ctx.request_count,
                "login_count": ctx.login_count,
                "actual_ratio": ratio,
                "baseline_ratio": baseline,
                "deviation_percent": deviation,
            }),
            dedup_key: ctx.dedup_key(self.rule_type()),
        })
    }
}

/// Heavy traffic with no logins, or a ratio above a fixed threshold.
#[derive(Clone, Debug)]
pub struct HighRequestRatio {
    pub threshold: f64,
}

impl Default for HighRequestRatio {
    fn default() -> Self {
        Self { threshold: 500.0 }
    }
}

const NO_LOGIN_REQUEST_LIMIT: u64 = 1000;

impl AnomalyDetector for HighRequestRatio {
    fn rule_type(&self) -> &'static str {
        "high_request_ratio"
    }

    fn description(&self) -> &'static str {
        "unusually high request-to-login ratio"
    }

    fn detect(&self, ctx: &DetectionContext) -> Option<DetectionResult> {
        if ctx.login_count == 0 {
            if ctx.request_count <= NO_LOGIN_REQUEST_LIMIT {
                return None;
            }
            return Some(DetectionResult {
                rule_type: self.rule_type(),
                severity: AnomalySeverity::High,
                message: format!(
                    "high request volume without login: {} requests",
                    ctx.request_count
                ),
                threshold: self.threshold,
                actual_value: ctx.request_count as f64,
                baseline: 0.0,
                deviation_percent: 100.0,
                evidence: json!({
                    "request_count": ctx.request_count,
                    "login_count": 0,
                }),
                dedup_key: ctx.dedup_key(self.rule_type()),
            });
        }

        let ratio = ctx.request_count as f64 / ctx.login_count as f64;
        if ratio <= self.threshold {
            return None;
        }
        let deviation = deviation_percent(ratio, self.threshold);
        Some(DetectionResult {
            rule_type: self.rule_type(),
            severity: severity_for_deviation(deviation, 100.0, 300.0),
            message: format!("high request-to-login ratio: {ratio:.0} requests per login"),
            threshold: self.threshold,
            actual_value: ratio,
            baseline: self.threshold,
            deviation_percent: deviation,
            evidence: json!({
                "request_count": ctx.request_count,
                "login_count": ctx.login_count,
                "request_ratio": ratio,
                "threshold": self.threshold,
                "deviation_percent": deviation,
            }),
            dedup_key: ctx.dedup_key(self.rule_type()),
        })
    }
}

/// Busy devices that appeared recently, and devices hopping across many IPs.
#[derive(Clone, Debug)]
pub struct UnusualDeviceActivity {
    pub new_device_requests: u64,
    pub ip_change_threshold: usize,
}

impl Default for UnusualDeviceActivity {
    fn default() -> Self {
        Self {
            new_device_requests: 100,
            ip_change_threshold: 5,
        }
    }
}

const NEW_DEVICE_WINDOW_SECS: i64 = 24 * 3600;

impl AnomalyDetector for UnusualDeviceActivity {
    fn rule_type(&self) -> &'static str {
        "unusual_device_activity"
    }

    fn description(&self) -> &'static str {
        "new high-volume devices or devices using many IPs"
    }

    fn detect(&self, ctx: &DetectionContext) -> Option<DetectionResult> {
        let recent_since = ctx.window_end.saturating_sub(NEW_DEVICE_WINDOW_SECS);
        for device in &ctx.devices {
            if device.first_seen_at >= recent_since
                && device.request_count > self.new_device_requests
            {
                let threshold = self.new_device_requests as f64;
                let actual = device.request_count as f64;
                return Some(DetectionResult {
                    rule_type: self.rule_type(),
                    severity: AnomalySeverity::Medium,
                    message: format!(
                        "new device {} sent {} requests",
                        device.device_id, device.request_count
                    ),
                    threshold,
                    actual_value: actual,
                    baseline: threshold,
                    deviation_percent: deviation_percent(actual, threshold.max(1.0)),
                    evidence: json!({
                        "device_id": device.device_id,
                        "request_count": device.request_count,
                        "unique_ips": device.unique_ips.len(),
                        "ips": device.unique_ips,
                        "first_seen": device.first_seen_at,
                        "last_seen": device.last_seen_at,
                    }),
                    dedup_key: ctx.dedup_key(&format!("device_{}", device.device_id)),
                });
            }

            if device.unique_ips.len() > self.ip_change_threshold {
                let threshold = self.ip_change_threshold as f64;
                let actual = device.unique_ips.len() as f64;
                return Some(DetectionResult {
                    rule_type: self.rule_type(),
                    severity: AnomalySeverity::High,
                    message: format!(
                        "device {} used {} different IPs",
                        device.device_id,
                        device.unique_ips.len()
                    ),
                    threshold,
                    actual_value: actual,
                    baseline: threshold,
                    deviation_percent: deviation_percent(actual, threshold.max(1.0)),
                    evidence: json!({
                        "device_id": device.device_id,
                        "ip_count": device.unique_ips.len(),
                        "ips": device.unique_ips,
                        "request_count": device.request_count,
                    }),
                    dedup_key: ctx.dedup_key(&format!("device_multi_ip_{}", device.device_id)),
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::gateway::anomaly::aggregation::DeviceAggregate;
    use crate::gateway::store_types::AnomalyBaselineRecord;

    const END: i64 = 1_700_000_000;

    fn context(requests: u64, logins: u64, quota: i64) -> DetectionContext {
        DetectionContext {
            user_id: 7,
            window_start: END - 3600,
            window_end: END,
            request_count: requests,
            quota_used: quota,
            login_count: logins,
            unique_ips: 0,
            unique_devices: 0,
            devices: Vec::new(),
            ips: Vec::new(),
            baselines: BTreeMap::new(),
        }
    }

    fn baseline(metric: &str, value: f64, sample: i64) -> AnomalyBaselineRecord {
        AnomalyBaselineRecord {
            user_id: 7,
            metric_type: metric.to_string(),
            baseline_value: value,
            window_size_seconds: 30 * 86_400,
            sample_size: sample,
            updated_at: END,
        }
    }

    #[test]
    fn severity_bands() {
        assert_eq!(severity_for_deviation(450.0, 200.0, 400.0), AnomalySeverity::Critical);
        assert_eq!(severity_for_deviation(250.0, 200.0, 400.0), AnomalySeverity::High);
        assert_eq!(severity_for_deviation(120.0, 200.0, 400.0), AnomalySeverity::Medium);
        assert_eq!(severity_for_deviation(50.0, 200.0, 400.0), AnomalySeverity::Low);
        assert_eq!(severity_for_deviation(f64::INFINITY, 200.0, 400.0), AnomalySeverity::Medium);
    }

    #[test]
    fn quota_spike_needs_a_baseline() {
        let detector = QuotaSpike::default();
        let mut ctx = context(10, 1, 500);
        assert!(detector.detect(&ctx).is_none());

        // 10 quota per request => expected 100, tolerance up to 250.
        ctx.baselines
            .insert(METRIC_QUOTA_USAGE.to_string(), baseline(METRIC_QUOTA_USAGE, 1000.0, 100));
        let result = detector.detect(&ctx).expect("spike");
        assert_eq!(result.rule_type, "quota_spike");
        assert_eq!(result.severity, AnomalySeverity::Critical);
        assert_eq!(result.baseline, 100.0);

        ctx.quota_used = 250;
        assert!(detector.detect(&ctx).is_none());
    }

    #[test]
    fn login_ratio_uses_default_baseline() {
        let detector = AbnormalLoginRatio::default();
        assert!(detector.detect(&context(500, 0, 0)).is_none());
        assert!(detector.detect(&context(200, 1, 0)).is_none());
        let result = detector.detect(&context(300, 1, 0)).expect("ratio");
        assert_eq!(result.severity, AnomalySeverity::High);
        assert_eq!(result.evidence["baseline_ratio"], 100.0);
    }

    #[test]
    fn high_request_ratio_without_logins() {
        let detector = HighRequestRatio::default();
        assert!(detector.detect(&context(1000, 0, 0)).is_none());
        let result = detector.detect(&context(1001, 0, 0)).expect("volume");
        assert_eq!(result.severity, AnomalySeverity::High);
        let result = detector.detect(&context(1200, 1, 0)).expect("ratio");
        assert_eq!(result.severity, AnomalySeverity::High);
        assert!(detector.detect(&context(500, 1, 0)).is_none());
    }

    #[test]
    fn device_rules() {
        let detector = UnusualDeviceActivity::default();
        let mut ctx = context(0, 0, 0);
        ctx.devices.push(DeviceAggregate {
            device_id: "phone".to_string(),
            request_count: 101,
            unique_ips: vec!["203.0.113.1".to_string()],
            unique_models: Vec::new(),
            first_seen_at: END - 60,
            last_seen_at: END,
        });
        let result = detector.detect(&ctx).expect("new device");
        assert_eq!(result.severity, AnomalySeverity::Medium);

        ctx.devices[0].request_count = 3;
        ctx.devices[0].unique_ips = (1..=6).map(|i| format!("203.0.113.{i}")).collect();
        let result = detector.detect(&ctx).expect("multi ip");
        assert_eq!(result.severity, AnomalySeverity::High);
        assert_eq!(result.evidence["ip_count"], 6);
    }
}
