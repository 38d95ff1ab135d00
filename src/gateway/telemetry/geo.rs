use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GeoLocation {
    pub country_code: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

#[async_trait]
pub trait GeoLocator: Send + Sync {
    /// `None` when the address is unknown or the lookup failed.
    async fn locate(&self, ip: &str) -> Option<GeoLocation>;
}

/// JSON lookup service. `{ip}` in the URL is replaced by the address; otherwise the
/// address is appended as the last path segment.
pub struct HttpGeoLocator {
    client: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
struct GeoResponse {
    #[serde(default, alias = "countryCode", alias = "country")]
    country_code: Option<String>,
    #[serde(default, alias = "regionName")]
    region: Option<String>,
    #[serde(default)]
    city: Option<String>,
}

impl HttpGeoLocator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    fn lookup_url(&self, ip: &str) -> String {
        if self.url.contains("{ip}") {
            self.url.replace("{ip}", ip)
        } else {
            format!("{}/{ip}", self.url.trim_end_matches('/'))
        }
    }
}

#[async_trait]
impl GeoLocator for HttpGeoLocator {
    async fn locate(&self, ip: &str) -> Option<GeoLocation> {
        if !is_public_ip(ip) {
            return None;
        }
        let response = match self.client.get(self.lookup_url(ip)).send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(ip, error = %err, "geolocation lookup failed");
                return None;
            }
        };
        if !response.status().is_success() {
            tracing::debug!(ip, status = %response.status(), "geolocation lookup rejected");
            return None;
        }
        let body: GeoResponse = response.json().await.ok()?;
        let clean = |value: Option<String>| value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let location = GeoLocation {
            country_code: clean(body.country_code),
            region: clean(body.region),
            city: clean(body.city),
        };
        location.country_code.is_some().then_some(location)
    }
}

/// Private, loopback and link-local addresses are never looked up.
pub fn is_public_ip(ip: &str) -> bool {
    match ip.trim().parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        Ok(IpAddr::V6(v6)) => {
            let first = v6.segments()[0];
            !(v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80)
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_addresses_are_skipped() {
        assert!(is_public_ip("8.8.8.8"));
        assert!(!is_public_ip("10.0.0.1"));
        assert!(!is_public_ip("127.0.0.1"));
        assert!(!is_public_ip("fd00::1"));
        assert!(!is_public_ip("not-an-ip"));
        assert!(is_public_ip("2001:4860::8888"));
    }

    #[test]
    fn url_template() {
        let geo = HttpGeoLocator::new("http://geo.local/json/{ip}?fields=all", Duration::from_millis(50))
            .expect("client");
        assert_eq!(geo.lookup_url("1.2.3.4"), "http://geo.local/json/1.2.3.4?fields=all");
        let geo = HttpGeoLocator::new("http://geo.local/lookup/", Duration::from_millis(50)).expect("client");
        assert_eq!(geo.lookup_url("1.2.3.4"), "http://geo.local/lookup/1.2.3.4");
    }
}
