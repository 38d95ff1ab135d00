use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Per-subject request timestamps over a sliding window.
#[derive(Debug)]
pub struct RpmMonitor {
    window_ms: i64,
    buckets: Mutex<HashMap<String, VecDeque<i64>>>,
}

impl Default for RpmMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl RpmMonitor {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Records a hit at `now_ms` and returns the count inside the window, this hit included.
    pub fn record(&self, key: &str, now_ms: i64) -> usize {
        let Ok(mut buckets) = self.buckets.lock() else {
            return 0;
        };
        let cutoff = now_ms.saturating_sub(self.window_ms);
        let hits = buckets.entry(key.to_string()).or_default();
        while hits.front().is_some_and(|at| *at <= cutoff) {
            hits.pop_front();
        }
        hits.push_back(now_ms);
        hits.len()
    }

    /// Drops subjects idle for a whole window.
    pub fn prune(&self, now_ms: i64) {
        if let Ok(mut buckets) = self.buckets.lock() {
            let cutoff = now_ms.saturating_sub(self.window_ms);
            buckets.retain(|_, hits| hits.back().is_some_and(|at| *at > cutoff));
        }
    }

    pub fn reset(&self) {
        if let Ok(mut buckets) = self.buckets.lock() {
            buckets.clear();
        }
    }

    pub fn tracked_subjects(&self) -> usize {
        self.buckets.lock().map(|buckets| buckets.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_within_window_only() {
        let monitor = RpmMonitor::default();
        assert_eq!(monitor.record("user:1", 0), 1);
        assert_eq!(monitor.record("user:1", 30_000), 2);
        assert_eq!(monitor.record("user:1", 60_000), 2);
        assert_eq!(monitor.record("user:2", 60_000), 1);

        monitor.prune(200_000);
        assert_eq!(monitor.tracked_subjects(), 0);
    }
}
