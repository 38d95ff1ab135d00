use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub requests: u64,
    pub admitted: u64,
    pub rejected: BTreeMap<String, u64>,
    pub flagged: u64,
    pub fallback_applied: u64,
    pub directive_rejections: u64,
    pub upstream_calls: u64,
    pub upstream_failures: u64,
    pub charges_committed: u64,
    pub charges_rolled_back: u64,
    pub telemetry_dropped: u64,
    pub telemetry_spilled: u64,
    pub telemetry_persisted: u64,
}

#[derive(Debug, Default)]
pub struct Observability {
    snapshot: ObservabilitySnapshot,
}

fn bump(counter: &mut u64) {
    *counter = counter.saturating_add(1);
}

impl Observability {
    pub fn record_request(&mut self) {
        bump(&mut self.snapshot.requests);
    }

    pub fn record_admitted(&mut self) {
        bump(&mut self.snapshot.admitted);
    }

    pub fn record_rejected(&mut self, kind: &str) {
        bump(self.snapshot.rejected.entry(kind.to_string()).or_default());
    }

    pub fn record_flagged(&mut self, fallback_applied: bool) {
        bump(&mut self.snapshot.flagged);
        if fallback_applied {
            bump(&mut self.snapshot.fallback_applied);
        }
    }

    pub fn record_directive_rejection(&mut self) {
        bump(&mut self.snapshot.directive_rejections);
    }

    pub fn record_upstream_call(&mut self, ok: bool) {
        bump(&mut self.snapshot.upstream_calls);
        if !ok {
            bump(&mut self.snapshot.upstream_failures);
        }
    }

    pub fn record_commit(&mut self) {
        bump(&mut self.snapshot.charges_committed);
    }

    pub fn record_rollback(&mut self) {
        bump(&mut self.snapshot.charges_rolled_back);
    }

    /// Telemetry numbers live in the pipeline; they are copied in when a snapshot is taken.
    pub fn snapshot_with_telemetry(&self, dropped: u64, spilled: u64, persisted: u64) -> ObservabilitySnapshot {
        let mut snapshot = self.snapshot.clone();
        snapshot.telemetry_dropped = dropped;
        snapshot.telemetry_spilled = spilled;
        snapshot.telemetry_persisted = persisted;
        snapshot
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        self.snapshot.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_rejections_by_kind() {
        let mut obs = Observability::default();
        obs.record_request();
        obs.record_request();
        obs.record_rejected("rate_limited");
        obs.record_rejected("rate_limited");
        obs.record_flagged(true);
        let snapshot = obs.snapshot_with_telemetry(1, 2, 3);
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.rejected.get("rate_limited"), Some(&2));
        assert_eq!(snapshot.fallback_applied, 1);
        assert_eq!(snapshot.telemetry_persisted, 3);
    }
}
