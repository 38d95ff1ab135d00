//! Client certificate details handed over by the TLS terminator in front of the gateway.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const HEADER_CERT_CN: &str = "x-client-cert-cn";
pub const HEADER_CERT_NOT_BEFORE: &str = "x-client-cert-not-before";
pub const HEADER_CERT_NOT_AFTER: &str = "x-client-cert-not-after";
pub const HEADER_TLS_VERSION: &str = "x-tls-version";
pub const HEADER_TLS_CIPHER: &str = "x-tls-cipher";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsPeer {
    pub version: Option<String>,
    pub cipher: Option<String>,
    pub common_name: Option<String>,
    /// Unix seconds.
    pub not_before: Option<i64>,
    /// Unix seconds.
    pub not_after: Option<i64>,
}

impl TlsPeer {
    /// None unless a client certificate common name was forwarded.
    pub fn from_headers(headers: &BTreeMap<String, String>) -> Option<Self> {
        let common_name = headers
            .get(HEADER_CERT_CN)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())?;
        let parse_ts = |name: &str| headers.get(name).and_then(|v| v.trim().parse::<i64>().ok());
        Some(Self {
            version: headers.get(HEADER_TLS_VERSION).cloned(),
            cipher: headers.get(HEADER_TLS_CIPHER).cloned(),
            common_name: Some(common_name),
            not_before: parse_ts(HEADER_CERT_NOT_BEFORE),
            not_after: parse_ts(HEADER_CERT_NOT_AFTER),
        })
    }

    pub fn check_validity(&self, now: i64) -> Result<&str, String> {
        let cn = self
            .common_name
            .as_deref()
            .filter(|cn| !cn.is_empty())
            .ok_or_else(|| "client certificate has no common name".to_string())?;
        if self.not_before.is_some_and(|at| now < at) {
            return Err("client certificate not yet valid".to_string());
        }
        if self.not_after.is_some_and(|at| now > at) {
            return Err("client certificate expired".to_string());
        }
        Ok(cn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_forwarded_headers() {
        let mut headers = BTreeMap::new();
        headers.insert(HEADER_CERT_CN.to_string(), " svc-billing ".to_string());
        headers.insert(HEADER_CERT_NOT_AFTER.to_string(), "2000".to_string());
        headers.insert(HEADER_TLS_VERSION.to_string(), "TLSv1.3".to_string());

        let peer = TlsPeer::from_headers(&headers).expect("peer");
        assert_eq!(peer.common_name.as_deref(), Some("svc-billing"));
        assert_eq!(peer.check_validity(1_000), Ok("svc-billing"));
        assert_eq!(
            peer.check_validity(2_001).unwrap_err(),
            "client certificate expired"
        );
    }

    #[test]
    fn missing_cn_yields_none() {
        assert!(TlsPeer::from_headers(&BTreeMap::new()).is_none());
    }
}
