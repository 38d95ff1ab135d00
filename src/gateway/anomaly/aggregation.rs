//! Per-device and per-IP rollups of a user's telemetry window.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::gateway::store_types::HeimdallRequestLog;

pub const UNKNOWN_DEVICE: &str = "unknown";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAggregate {
    pub device_id: String,
    pub request_count: u64,
    pub unique_ips: Vec<String>,
    pub unique_models: Vec<String>,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAggregate {
    pub ip: String,
    /// `/24` for IPv4, `/64` for IPv6.
    pub subnet: String,
    pub request_count: u64,
    pub unique_devices: usize,
    pub unique_models: Vec<String>,
    pub last_activity_at: i64,
}

pub fn normalize_device_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        UNKNOWN_DEVICE.to_string()
    } else {
        trimmed.to_ascii_lowercase()
    }
}

#[derive(Default)]
struct DeviceAcc {
    count: u64,
    ips: BTreeSet<String>,
    models: BTreeSet<String>,
    first: Option<i64>,
    last: Option<i64>,
}

/// Groups rows by normalized device id; rows without one land on `unknown`.
pub fn aggregate_devices(logs: &[HeimdallRequestLog]) -> Vec<DeviceAggregate> {
    let mut devices: BTreeMap<String, DeviceAcc> = BTreeMap::new();
    for log in logs {
        let acc = devices
            .entry(normalize_device_id(&log.client_device_id))
            .or_default();
        acc.count += 1;
        if !log.client_ip.is_empty() {
            acc.ips.insert(log.client_ip.clone());
        }
        if !log.model_name.is_empty() {
            acc.models.insert(log.model_name.clone());
        }
        acc.first = Some(acc.first.map_or(log.occurred_at, |first| first.min(log.occurred_at)));
        acc.last = Some(acc.last.map_or(log.occurred_at, |last| last.max(log.occurred_at)));
    }
    devices
        .into_iter()
        .map(|(device_id, acc)| DeviceAggregate {
            device_id,
            request_count: acc.count,
            unique_ips: acc.ips.into_iter().collect(),
            unique_models: acc.models.into_iter().collect(),
            first_seen_at: acc.first.unwrap_or_default(),
            last_seen_at: acc.last.unwrap_or_default(),
        })
        .collect()
}

#[derive(Default)]
struct IpAcc {
    count: u64,
    devices: BTreeSet<String>,
    models: BTreeSet<String>,
    last: i64,
}

/// Groups rows by client IP, skipping rows without one.
pub fn aggregate_ips(logs: &[HeimdallRequestLog]) -> Vec<IpAggregate> {
    let mut ips: BTreeMap<String, IpAcc> = BTreeMap::new();
    for log in logs.iter().filter(|log| !log.client_ip.is_empty()) {
        let acc = ips.entry(log.client_ip.clone()).or_default();
        acc.count += 1;
        if !log.client_device_id.trim().is_empty() {
            acc.devices.insert(normalize_device_id(&log.client_device_id));
        }
        if !log.model_name.is_empty() {
            acc.models.insert(log.model_name.clone());
        }
        acc.last = acc.last.max(log.occurred_at);
    }
    ips.into_iter()
        .map(|(ip, acc)| IpAggregate {
            subnet: subnet_of(&ip),
            ip,
            request_count: acc.count,
            unique_devices: acc.devices.len(),
            unique_models: acc.models.into_iter().collect(),
            last_activity_at: acc.last,
        })
        .collect()
}

fn subnet_of(ip: &str) -> String {
    match ip.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(v4)) => {
            let [a, b, c, _] = v4.octets();
            format!("{a}.{b}.{c}.0/24")
        }
        Ok(std::net::IpAddr::V6(v6)) => {
            let segments = v6.segments();
            format!(
                "{:x}:{:x}:{:x}:{:x}::/64",
                segments[0], segments[1], segments[2], segments[3]
            )
        }
        Err(_) => String::new(),
    }
}
