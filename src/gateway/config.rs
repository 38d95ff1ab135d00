use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::env::Env;
use super::pricing::ModelPrice;
use super::store_types::BillingMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse toml config failed: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("parse json config failed: {0}")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "gateway-config-yaml")]
    #[error("parse yaml config failed: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: String,
    pub database_path: PathBuf,
    pub redis_url: Option<String>,
    pub admin_token: Option<String>,
    /// HMAC key for anonymized subject hashes in the audit log.
    pub anonymization_secret: String,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub ip_protection: IpProtectionConfig,
    pub billing: BillingConfig,
    pub governance: GovernanceConfig,
    pub telemetry: TelemetryConfig,
    pub scheduler: SchedulerConfig,
    pub anomaly: AnomalyConfig,
    pub public_logs: PublicLogsConfig,
    pub pricing: BTreeMap<String, ModelPrice>,
    pub upstream: UpstreamConfig,
    pub channel_update_frequency_secs: Option<u64>,
    pub batch_update_enabled: bool,
    pub json_logs: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            database_path: PathBuf::from("heimdall.sqlite"),
            redis_url: None,
            admin_token: None,
            anonymization_secret: String::new(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            ip_protection: IpProtectionConfig::default(),
            billing: BillingConfig::default(),
            governance: GovernanceConfig::default(),
            telemetry: TelemetryConfig::default(),
            scheduler: SchedulerConfig::default(),
            anomaly: AnomalyConfig::default(),
            public_logs: PublicLogsConfig::default(),
            pricing: BTreeMap::new(),
            upstream: UpstreamConfig::default(),
            channel_update_frequency_secs: None,
            batch_update_enabled: false,
            json_logs: false,
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("listen", &self.listen)
            .field("database_path", &self.database_path)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "<redacted>"))
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .field("anonymization_secret", &"<redacted>")
            .field("auth", &self.auth)
            .field("rate_limit", &self.rate_limit)
            .field("ip_protection", &self.ip_protection)
            .field("billing", &self.billing)
            .field("governance", &self.governance)
            .field("telemetry", &self.telemetry)
            .field("scheduler", &self.scheduler)
            .field("anomaly", &self.anomaly)
            .field("public_logs", &self.public_logs)
            .field("pricing", &self.pricing.keys().collect::<Vec<_>>())
            .field("upstream", &self.upstream)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    ApiKey,
    Jwt,
    Mtls,
}

impl AuthMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::Jwt => "jwt",
            Self::Mtls => "mtls",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "api_key" | "apikey" | "key" => Some(Self::ApiKey),
            "jwt" => Some(Self::Jwt),
            "mtls" | "tls" => Some(Self::Mtls),
            _ => None,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub methods: Vec<AuthMethod>,
    pub jwt_secret: Option<String>,
    pub jwt_leeway_secs: u64,
    pub replay_protection: bool,
    pub replay_window_secs: u64,
    pub audit_payload_limit: usize,
    /// Certificate common name to user id.
    pub mtls_users: BTreeMap<String, i64>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            methods: vec![AuthMethod::ApiKey, AuthMethod::Jwt, AuthMethod::Mtls],
            jwt_secret: None,
            jwt_leeway_secs: 30,
            replay_protection: true,
            replay_window_secs: 300,
            audit_payload_limit: 1024,
            mtls_users: BTreeMap::new(),
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("methods", &self.methods)
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .field("jwt_leeway_secs", &self.jwt_leeway_secs)
            .field("replay_protection", &self.replay_protection)
            .field("replay_window_secs", &self.replay_window_secs)
            .field("audit_payload_limit", &self.audit_payload_limit)
            .field("mtls_users", &self.mtls_users)
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub token_requests: u64,
    pub ip_requests: u64,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token_requests: 100,
            ip_requests: 100,
            window_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IpProtectionConfig {
    pub enabled: bool,
    pub auto_ban: bool,
    pub violation_ttl_secs: u64,
}

impl Default for IpProtectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_ban: true,
            violation_ttl_secs: 3600,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub enabled: bool,
    pub default_mode: BillingMode,
    pub auto_fallback: bool,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_mode: BillingMode::Balance,
            auto_fallback: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub enabled: bool,
    pub abuse_rpm_threshold: u64,
    pub reroute_model_alias: Option<String>,
    pub violation_fallback_alias: Option<String>,
    pub malicious_fallback_alias: Option<String>,
    pub flag_ttl_hours: u64,
    pub prompt_max_length: usize,
    pub prompt_min_entropy: f64,
    pub prompt_max_repetition: f64,
    pub violation_keywords: Vec<String>,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            abuse_rpm_threshold: 3000,
            reroute_model_alias: None,
            violation_fallback_alias: None,
            malicious_fallback_alias: None,
            flag_ttl_hours: 24,
            prompt_max_length: 8192,
            prompt_min_entropy: 1.0,
            prompt_max_repetition: 0.6,
            violation_keywords: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub geolocation_enabled: bool,
    pub geolocation_url: Option<String>,
    pub geolocation_timeout_ms: u64,
    pub buffer_size: usize,
    pub worker_count: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub disk_queue_enabled: bool,
    pub disk_queue_path: PathBuf,
    pub flush_interval_ms: u64,
    pub flush_batch_size: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            geolocation_enabled: false,
            geolocation_url: None,
            geolocation_timeout_ms: 200,
            buffer_size: 10_000,
            worker_count: 5,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            disk_queue_enabled: true,
            disk_queue_path: PathBuf::from("/tmp/heimdall_queue"),
            flush_interval_ms: 5000,
            flush_batch_size: 100,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Only the leader node runs housekeeping jobs.
    pub leader: bool,
    pub cycle_reset_interval_secs: u64,
    pub ttl_cleanup_interval_secs: u64,
    pub baseline_refresh_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            leader: true,
            cycle_reset_interval_secs: 3600,
            ttl_cleanup_interval_secs: 3600,
            baseline_refresh_interval_secs: 86_400,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    pub enabled: bool,
    pub sweep_interval_secs: u64,
    pub window_secs: u64,
    pub batch_size: usize,
    pub concurrency: usize,
    pub quota_spike_percent: f64,
    pub login_ratio_baseline: f64,
    pub request_ratio_threshold: f64,
    pub new_device_requests: u64,
    pub ip_change_threshold: usize,
    pub auto_enforcement_enabled: bool,
    pub auto_ban_enabled: bool,
    pub auto_block_enabled: bool,
    pub violation_redirect_model: Option<String>,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_secs: 3600,
            window_secs: 3600,
            batch_size: 1000,
            concurrency: 5,
            quota_spike_percent: 150.0,
            login_ratio_baseline: 100.0,
            request_ratio_threshold: 500.0,
            new_device_requests: 100,
            ip_change_threshold: 5,
            auto_enforcement_enabled: true,
            auto_ban_enabled: false,
            auto_block_enabled: true,
            violation_redirect_model: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PublicLogsConfig {
    pub enabled: bool,
    pub retention_days: u64,
}

impl Default for PublicLogsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retention_days: 3,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub provider: String,
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            provider: "openai-compatible".to_string(),
            timeout_secs: 120,
        }
    }
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("provider", &self.provider)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl GatewayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let config = match ext.as_str() {
            "toml" => toml::from_str(&raw)?,
            "json" => serde_json::from_str(&raw)?,
            #[cfg(feature = "gateway-config-yaml")]
            "yaml" | "yml" => serde_yaml::from_str(&raw)?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };
        Ok(config)
    }

    pub fn from_env(env: &Env) -> Self {
        let mut config = Self::default();
        config.apply_env(env);
        config
    }

    /// Overlays environment flags on top of file values.
    pub fn apply_env(&mut self, env: &Env) {
        if let Some(value) = env.get("HEIMDALL_LISTEN_ADDR") {
            self.listen = value;
        }
        if let Some(value) = env.get("HEIMDALL_DATABASE_PATH") {
            self.database_path = PathBuf::from(value);
        }
        if let Some(value) = env.get("HEIMDALL_REDIS_URL").or_else(|| env.get("REDIS_URL")) {
            self.redis_url = Some(value);
        }
        if let Some(value) = env.get("HEIMDALL_ADMIN_TOKEN") {
            self.admin_token = Some(value);
        }
        if let Some(value) = env.get("HEIMDALL_ANONYMIZATION_SECRET") {
            self.anonymization_secret = value;
        }
        if let Some(value) = env.get_bool("HEIMDALL_JSON_LOGS") {
            self.json_logs = value;
        }

        self.apply_auth_env(env);
        self.apply_rate_limit_env(env);
        self.apply_billing_env(env);
        self.apply_governance_env(env);
        self.apply_telemetry_env(env);
        self.apply_scheduler_env(env);
        self.apply_anomaly_env(env);

        if let Some(value) = env.get_bool("PUBLIC_LOGS_ENABLED") {
            self.public_logs.enabled = value;
        }
        if let Some(value) = env.get_parsed("PUBLIC_LOGS_RETENTION_DAYS") {
            self.public_logs.retention_days = value;
        }
        if let Some(value) = env.get_parsed("CHANNEL_UPDATE_FREQUENCY") {
            self.channel_update_frequency_secs = Some(value);
        }
        if let Some(value) = env.get_bool("BATCH_UPDATE_ENABLED") {
            self.batch_update_enabled = value;
        }
        if let Some(value) = env.get("HEIMDALL_BACKEND_URL") {
            self.upstream.base_url = Some(value);
        }
        if let Some(value) = env.get("HEIMDALL_BACKEND_API_KEY") {
            self.upstream.api_key = Some(value);
        }
    }

    fn apply_auth_env(&mut self, env: &Env) {
        if let Some(methods) = env.get_list("HEIMDALL_AUTH_METHODS") {
            let parsed: Vec<AuthMethod> = methods
                .iter()
                .filter_map(|method| AuthMethod::parse(method))
                .collect();
            if !parsed.is_empty() {
                self.auth.methods = parsed;
            }
        }
        if let Some(value) = env.get("HEIMDALL_JWT_SECRET") {
            self.auth.jwt_secret = Some(value);
        }
        if let Some(value) = env.get_bool("HEIMDALL_REPLAY_PROTECTION") {
            self.auth.replay_protection = value;
        }
        if let Some(value) = env.get_parsed("HEIMDALL_REPLAY_WINDOW_SECS") {
            self.auth.replay_window_secs = value;
        }
        if let Some(value) = env.get_parsed("HEIMDALL_AUDIT_PAYLOAD_LIMIT") {
            self.auth.audit_payload_limit = value;
        }
    }

    fn apply_rate_limit_env(&mut self, env: &Env) {
        if let Some(value) = env.get_bool("HEIMDALL_RATE_LIMIT_ENABLED") {
            self.rate_limit.enabled = value;
        }
        if let Some(value) = env.get_parsed("HEIMDALL_RATE_LIMIT_REQUESTS") {
            self.rate_limit.token_requests = value;
        }
        if let Some(value) = env.get_parsed("HEIMDALL_RATE_LIMIT_IP_REQUESTS") {
            self.rate_limit.ip_requests = value;
        }
        if let Some(minutes) = env.get_parsed::<u64>("HEIMDALL_RATE_LIMIT_WINDOW_MINUTES") {
            self.rate_limit.window_secs = minutes.saturating_mul(60);
        }
        if let Some(value) = env.get_bool("HEIMDALL_IP_PROTECTION_ENABLED") {
            self.ip_protection.enabled = value;
        }
        if let Some(value) = env.get_bool("HEIMDALL_IP_AUTO_BAN") {
            self.ip_protection.auto_ban = value;
        }
    }

    fn apply_billing_env(&mut self, env: &Env) {
        if let Some(value) = env.get_bool("BILLING_ENABLED") {
            self.billing.enabled = value;
        }
        if let Some(mode) = env
            .get("BILLING_DEFAULT_MODE")
            .and_then(|raw| BillingMode::parse(&raw))
        {
            self.billing.default_mode = mode;
        }
        if let Some(value) = env.get_bool("BILLING_AUTO_FALLBACK") {
            self.billing.auto_fallback = value;
        }
    }

    fn apply_governance_env(&mut self, env: &Env) {
        let governance = &mut self.governance;
        if let Some(value) = env.get_bool("GOVERNANCE_ENABLED") {
            governance.enabled = value;
        }
        if let Some(value) = env.get_parsed("GOVERNANCE_ABUSE_RPM_THRESHOLD") {
            governance.abuse_rpm_threshold = value;
        }
        if let Some(value) = env.get("GOVERNANCE_REROUTE_MODEL_ALIAS") {
            governance.reroute_model_alias = Some(value.trim().to_string());
        }
        if let Some(value) = env.get("GOVERNANCE_VIOLATION_FALLBACK_ALIAS") {
            governance.violation_fallback_alias = Some(value.trim().to_string());
        }
        if let Some(value) = env.get("GOVERNANCE_MALICIOUS_FALLBACK_ALIAS") {
            governance.malicious_fallback_alias = Some(value.trim().to_string());
        }
        if let Some(value) = env.get_parsed("GOVERNANCE_FLAG_TTL_HOURS") {
            governance.flag_ttl_hours = value;
        }
        if let Some(value) = env.get_parsed("GOVERNANCE_PROMPT_MAX_LENGTH") {
            governance.prompt_max_length = value;
        }
        if let Some(value) = env.get_parsed("GOVERNANCE_PROMPT_MIN_ENTROPY") {
            governance.prompt_min_entropy = value;
        }
        if let Some(value) = env.get_parsed("GOVERNANCE_PROMPT_MAX_REPETITION") {
            governance.prompt_max_repetition = value;
        }
        if let Some(keywords) = env.get_list("GOVERNANCE_VIOLATION_KEYWORDS") {
            governance.violation_keywords = keywords
                .into_iter()
                .map(|keyword| keyword.to_lowercase())
                .collect();
        }
    }

    fn apply_telemetry_env(&mut self, env: &Env) {
        let telemetry = &mut self.telemetry;
        if let Some(value) = env.get_bool("HEIMDALL_TELEMETRY_ENABLED") {
            telemetry.enabled = value;
        }
        if let Some(value) = env.get_bool("HEIMDALL_GEOLOCATION_ENABLED") {
            telemetry.geolocation_enabled = value;
        }
        if let Some(value) = env.get("HEIMDALL_GEOLOCATION_URL") {
            telemetry.geolocation_url = Some(value);
        }
        if let Some(value) = env.get_parsed("HEIMDALL_BUFFER_SIZE") {
            telemetry.buffer_size = value;
        }
        if let Some(value) = env.get_parsed("HEIMDALL_WORKER_COUNT") {
            telemetry.worker_count = value;
        }
        if let Some(value) = env.get_parsed("HEIMDALL_RETRY_ATTEMPTS") {
            telemetry.retry_attempts = value;
        }
        if let Some(value) = env.get_parsed("HEIMDALL_RETRY_DELAY_MS") {
            telemetry.retry_delay_ms = value;
        }
        if let Some(value) = env.get_bool("HEIMDALL_DISK_QUEUE_ENABLED") {
            telemetry.disk_queue_enabled = value;
        }
        if let Some(value) = env.get("HEIMDALL_DISK_QUEUE_PATH") {
            telemetry.disk_queue_path = PathBuf::from(value);
        }
        if let Some(value) = env.get_parsed("HEIMDALL_FLUSH_INTERVAL_MS") {
            telemetry.flush_interval_ms = value;
        }
    }

    fn apply_scheduler_env(&mut self, env: &Env) {
        if let Some(value) = env.get_bool("SCHEDULER_ENABLED") {
            self.scheduler.enabled = value;
        }
        if let Some(value) = env.get_bool("SCHEDULER_LEADER") {
            self.scheduler.leader = value;
        }
        if let Some(value) = env.get_parsed("SCHEDULER_CYCLE_RESET_INTERVAL_SECS") {
            self.scheduler.cycle_reset_interval_secs = value;
        }
        if let Some(value) = env.get_parsed("SCHEDULER_TTL_CLEANUP_INTERVAL_SECS") {
            self.scheduler.ttl_cleanup_interval_secs = value;
        }
    }

    fn apply_anomaly_env(&mut self, env: &Env) {
        let anomaly = &mut self.anomaly;
        if let Some(value) = env.get_bool("ANOMALY_ENABLED") {
            anomaly.enabled = value;
        }
        if let Some(value) = env.get_parsed("ANOMALY_SWEEP_INTERVAL_SECS") {
            anomaly.sweep_interval_secs = value;
        }
        if let Some(value) = env.get_parsed("ANOMALY_CONCURRENCY") {
            anomaly.concurrency = value;
        }
        if let Some(value) = env.get_parsed("ANOMALY_QUOTA_SPIKE_PERCENT") {
            anomaly.quota_spike_percent = value;
        }
        if let Some(value) = env.get_parsed("ANOMALY_REQUEST_RATIO_THRESHOLD") {
            anomaly.request_ratio_threshold = value;
        }
        if let Some(value) = env.get_parsed("ANOMALY_NEW_DEVICE_REQUESTS") {
            anomaly.new_device_requests = value;
        }
        if let Some(value) = env.get_parsed("ANOMALY_IP_CHANGE_THRESHOLD") {
            anomaly.ip_change_threshold = value;
        }
        if let Some(value) = env.get_bool("ANOMALY_AUTO_ENFORCEMENT_ENABLED") {
            anomaly.auto_enforcement_enabled = value;
        }
        if let Some(value) = env.get_bool("ANOMALY_AUTO_BAN_ENABLED") {
            anomaly.auto_ban_enabled = value;
        }
        if let Some(value) = env.get("ANOMALY_VIOLATION_REDIRECT_MODEL") {
            anomaly.violation_redirect_model = Some(value);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telemetry.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "telemetry.buffer_size must be positive".to_string(),
            ));
        }
        if self.telemetry.worker_count == 0 {
            return Err(ConfigError::Invalid(
                "telemetry.worker_count must be positive".to_string(),
            ));
        }
        if self.rate_limit.enabled && self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.window_secs must be positive".to_string(),
            ));
        }
        if self.auth.methods.contains(&AuthMethod::Jwt)
            && self
                .auth
                .jwt_secret
                .as_deref()
                .is_some_and(|secret| secret.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "auth.jwt_secret must not be blank".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.governance.prompt_max_repetition) {
            return Err(ConfigError::Invalid(
                "governance.prompt_max_repetition must be within [0, 1]".to_string(),
            ));
        }
        for (alias, price) in &self.pricing {
            if alias.trim().is_empty() {
                return Err(ConfigError::Invalid("pricing alias must be non-empty".to_string()));
            }
            if price.quota_per_request < 0 || price.quota_per_1k_tokens < 0 {
                return Err(ConfigError::Invalid(format!(
                    "pricing for {alias} must be non-negative"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overlay_sets_governance_and_telemetry() {
        let env = Env::parse_dotenv(
            "GOVERNANCE_ENABLED=true\nGOVERNANCE_ABUSE_RPM_THRESHOLD=3\nGOVERNANCE_VIOLATION_KEYWORDS=Foo,BAR\nHEIMDALL_BUFFER_SIZE=64\nHEIMDALL_DISK_QUEUE_ENABLED=false\nBILLING_DEFAULT_MODE=auto\nHEIMDALL_AUTH_METHODS=jwt,api_key\n",
        );
        let config = GatewayConfig::from_env(&env);
        assert!(config.governance.enabled);
        assert_eq!(config.governance.abuse_rpm_threshold, 3);
        assert_eq!(config.governance.violation_keywords, vec!["foo", "bar"]);
        assert_eq!(config.telemetry.buffer_size, 64);
        assert!(!config.telemetry.disk_queue_enabled);
        assert_eq!(config.billing.default_mode, BillingMode::Auto);
        assert_eq!(config.auth.methods, vec![AuthMethod::Jwt, AuthMethod::ApiKey]);
    }

    #[test]
    fn loads_toml_with_partial_sections() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("heimdall.toml");
        std::fs::write(
            &path,
            "listen = \"0.0.0.0:9000\"\n[billing]\nenabled = true\nauto_fallback = true\n[pricing.gpt-4o-mini]\nquota_per_request = 1\nquota_per_1k_tokens = 2\n",
        )
        .expect("write");

        let config = GatewayConfig::load(&path).expect("load");
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert!(config.billing.enabled);
        assert!(config.billing.auto_fallback);
        assert_eq!(config.billing.default_mode, BillingMode::Balance);
        assert_eq!(config.telemetry.worker_count, 5);
        assert!(config.pricing.contains_key("gpt-4o-mini"));
        config.validate().expect("valid");
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("heimdall.ini");
        std::fs::write(&path, "x=1").expect("write");
        assert!(matches!(
            GatewayConfig::load(&path),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn debug_redacts_secrets() {
        let config = GatewayConfig {
            admin_token: Some("super-secret".to_string()),
            anonymization_secret: "hmac-secret".to_string(),
            ..GatewayConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("hmac-secret"));
    }
}
