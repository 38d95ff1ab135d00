//! IP bans, allow/deny lists, per-IP limit rules and violation-driven auto-bans.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::cache::Cache;
use super::config::IpProtectionConfig;
use super::store::{SqliteStore, StoreError};
use super::store_types::{IpBanRecord, IpListKind, IpRateLimitRule};
use super::{Clock, GatewayError};

/// Violation counts that trigger a ban, with the ban length (`None` = permanent).
const AUTO_BAN_STEPS: [(i64, Option<Duration>); 3] = [
    (100, None),
    (50, Some(Duration::from_secs(24 * 3600))),
    (20, Some(Duration::from_secs(3600))),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpVerdict {
    Allowed,
    /// On the allow list; rate limits are skipped.
    Whitelisted,
}

pub struct IpProtection {
    store: SqliteStore,
    cache: Arc<dyn Cache>,
    config: IpProtectionConfig,
    clock: Arc<dyn Clock>,
}

impl IpProtection {
    pub fn new(
        store: SqliteStore,
        cache: Arc<dyn Cache>,
        config: IpProtectionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cache,
            config,
            clock,
        }
    }

    /// Store failures let the request through.
    pub async fn check(&self, ip: &str) -> Result<IpVerdict, GatewayError> {
        if !self.config.enabled || ip.is_empty() {
            return Ok(IpVerdict::Allowed);
        }
        match self.evaluate(ip).await {
            Ok(verdict) => verdict,
            Err(err) => {
                tracing::warn!(ip, error = %err, "ip protection lookup failed, allowing");
                Ok(IpVerdict::Allowed)
            }
        }
    }

    async fn evaluate(&self, ip: &str) -> Result<Result<IpVerdict, GatewayError>, StoreError> {
        let now = self.clock.now_unix();
        if let Some(ban) = self.store.active_ip_ban(ip, now).await? {
            return Ok(Err(GatewayError::IpBlocked {
                reason: ban_reason(&ban),
            }));
        }

        let entries = self.store.list_ip_entries().await?;
        if let Some(entry) = entries
            .iter()
            .find(|entry| entry.kind == IpListKind::Deny && ip_matches(&entry.ip_pattern, ip))
        {
            return Ok(Err(GatewayError::IpBlocked {
                reason: format!(
                    "IP in blacklist: {}",
                    entry.reason.as_deref().unwrap_or_default()
                ),
            }));
        }
        if entries
            .iter()
            .any(|entry| entry.kind == IpListKind::Allow && ip_matches(&entry.ip_pattern, ip))
        {
            return Ok(Ok(IpVerdict::Whitelisted));
        }
        Ok(Ok(IpVerdict::Allowed))
    }

    /// Most specific rule covering `ip`: exact address, then the narrowest CIDR.
    pub async fn rule_for(&self, ip: &str) -> Option<IpRateLimitRule> {
        let rules = match self.store.list_ip_rate_limits().await {
            Ok(rules) => rules,
            Err(err) => {
                tracing::warn!(ip, error = %err, "ip rate limit rules unavailable");
                return None;
            }
        };
        rules
            .into_iter()
            .filter(|rule| ip_matches(&rule.ip_pattern, ip))
            .max_by_key(|rule| pattern_specificity(&rule.ip_pattern))
    }

    /// Counts a rate-limit violation and bans at 20, 50 and 100 violations.
    /// Returns the running count when the cache is reachable.
    pub async fn record_violation(&self, ip: &str, reason: &str) -> Option<i64> {
        if !self.config.enabled || ip.is_empty() {
            return None;
        }
        let key = format!("ip_violations:{ip}");
        let ttl = Duration::from_secs(self.config.violation_ttl_secs.max(1));
        let count = match self.cache.incr(&key, ttl).await {
            Ok(count) => count,
            Err(err) => {
                tracing::debug!(ip, error = %err, "violation counter unavailable");
                return None;
            }
        };
        tracing::info!(ip, count, reason, "ip violation recorded");

        if !self.config.auto_ban {
            return Some(count);
        }
        // Ban only when a threshold is crossed, not on every later violation.
        if let Some((_, duration)) = AUTO_BAN_STEPS.iter().find(|(at, _)| count == *at) {
            let ban_reason = format!("Auto-ban: {count} violations ({reason})");
            if let Err(err) = self.ban(ip, &ban_reason, *duration).await {
                tracing::warn!(ip, error = %err, "auto-ban failed");
            }
        }
        Some(count)
    }

    pub async fn ban(
        &self,
        ip: &str,
        reason: &str,
        duration: Option<Duration>,
    ) -> Result<i64, StoreError> {
        let now = self.clock.now_unix();
        let expires_at = duration
            .map(|duration| now.saturating_add(i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)));
        let id = self
            .store
            .insert_ip_ban(ip, reason, duration.is_none(), expires_at, now)
            .await?;
        tracing::warn!(ip, reason, expires_at, "ip banned");
        Ok(id)
    }

    pub async fn unban(&self, ip: &str) -> Result<bool, StoreError> {
        let lifted = self.store.lift_ip_ban(ip).await?;
        if lifted > 0 {
            tracing::info!(ip, "ip ban lifted");
        }
        Ok(lifted > 0)
    }

    pub async fn bans(&self) -> Result<Vec<IpBanRecord>, StoreError> {
        self.store.list_ip_bans(self.clock.now_unix()).await
    }
}

fn ban_reason(ban: &IpBanRecord) -> String {
    let mut reason = format!("IP banned: {}", ban.reason);
    if !ban.permanent {
        if let Some(at) = ban.expires_at.and_then(format_rfc3339) {
            reason.push_str(&format!(" (expires at {at})"));
        }
    }
    reason
}

fn format_rfc3339(unix: i64) -> Option<String> {
    OffsetDateTime::from_unix_timestamp(unix)
        .ok()
        .and_then(|at| at.format(&Rfc3339).ok())
}

/// Exact address or CIDR containment.
pub fn ip_matches(pattern: &str, ip: &str) -> bool {
    let pattern = pattern.trim();
    let ip = ip.trim();
    if pattern == ip {
        return true;
    }
    let Ok(addr) = ip.parse::<IpAddr>() else {
        return false;
    };
    match parse_cidr(pattern) {
        Some((network, prefix)) => cidr_contains(network, prefix, addr),
        None => pattern.parse::<IpAddr>().is_ok_and(|exact| exact == addr),
    }
}

pub fn is_valid_ip_pattern(pattern: &str) -> bool {
    let pattern = pattern.trim();
    parse_cidr(pattern).is_some() || pattern.parse::<IpAddr>().is_ok()
}

fn parse_cidr(pattern: &str) -> Option<(IpAddr, u8)> {
    let (network, prefix) = pattern.split_once('/')?;
    let network = network.trim().parse::<IpAddr>().ok()?;
    let prefix = prefix.trim().parse::<u8>().ok()?;
    let max = if network.is_ipv4() { 32 } else { 128 };
    (prefix <= max).then_some((network, prefix))
}

fn cidr_contains(network: IpAddr, prefix: u8, addr: IpAddr) -> bool {
    match (network, addr) {
        (IpAddr::V4(network), IpAddr::V4(addr)) => {
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) };
            u32::from(network) & mask == u32::from(addr) & mask
        }
        (IpAddr::V6(network), IpAddr::V6(addr)) => {
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - u32::from(prefix)) };
            u128::from(network) & mask == u128::from(addr) & mask
        }
        _ => false,
    }
}

/// Exact addresses rank above every CIDR; narrower CIDRs rank above wider ones.
fn pattern_specificity(pattern: &str) -> u16 {
    match parse_cidr(pattern.trim()) {
        Some((_, prefix)) => u16::from(prefix),
        None => 256,
    }
}
