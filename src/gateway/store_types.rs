use serde::{Deserialize, Serialize};

macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(raw: &str) -> Option<Self> {
                match raw.trim().to_ascii_lowercase().as_str() {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(BillingMode {
    Plan => "plan",
    Balance => "balance",
    Auto => "auto",
    Fallback => "fallback",
});

text_enum!(CycleType {
    Daily => "daily",
    Monthly => "monthly",
    Custom => "custom",
});

text_enum!(QuotaMetric {
    Requests => "requests",
    Tokens => "tokens",
    Credits => "credits",
});

text_enum!(RolloverPolicy {
    None => "none",
    Cap => "cap",
    Full => "full",
});

text_enum!(
    /// Ordered from least to most severe.
    AnomalySeverity {
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
        Malicious => "malicious",
    }
);

text_enum!(AnomalyStatus {
    Pending => "pending",
    Actioned => "actioned",
    Approved => "approved",
    Ignored => "ignored",
});

text_enum!(EnforcementAction {
    Log => "log",
    Redirect => "redirect",
    Block => "block",
    Ban => "ban",
});

text_enum!(GrantType {
    Credit => "credit",
    Plan => "plan",
});

text_enum!(VoucherCodeStatus {
    Available => "available",
    Issued => "issued",
    Redeemed => "redeemed",
    Expired => "expired",
});

text_enum!(IpListKind {
    Allow => "allow",
    Deny => "deny",
});

text_enum!(FlagSeverity {
    Violation => "violation",
    Malicious => "malicious",
});

impl AnomalySeverity {
    fn rank(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
            Self::Malicious => 4,
        }
    }
}

impl PartialOrd for AnomalySeverity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AnomalySeverity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl FlagSeverity {
    pub fn max(self, other: Self) -> Self {
        if self == Self::Malicious || other == Self::Malicious {
            Self::Malicious
        } else {
            Self::Violation
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub quota: i64,
    pub used_quota: i64,
    pub status: i64,
    pub banned: bool,
    pub redirect_model: Option<String>,
    pub encryption_key_hash: Option<String>,
    pub encryption_enabled: bool,
    pub created_at: i64,
}

impl UserRecord {
    pub fn is_enabled(&self) -> bool {
        self.status == 1
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: i64,
    pub user_id: i64,
    pub key: String,
    pub name: String,
    pub status: i64,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub model_limits: Vec<String>,
    pub allowed_ips: Vec<String>,
    pub billing_mode: Option<BillingMode>,
    pub plan_assignment_id: Option<i64>,
    pub expires_at: Option<i64>,
}

impl TokenRecord {
    pub fn is_usable_at(&self, now: i64) -> bool {
        self.status == 1 && self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRecord {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub cycle_type: CycleType,
    pub cycle_duration_days: i64,
    pub quota_metric: QuotaMetric,
    pub quota_amount: i64,
    pub allow_carry_over: bool,
    pub carry_limit_percent: i64,
    pub allowed_models: Vec<String>,
    pub is_active: bool,
}

impl PlanRecord {
    /// Empty list allows every model; matching ignores case and surrounding whitespace.
    pub fn allows_model(&self, model: &str) -> bool {
        if self.allowed_models.is_empty() {
            return true;
        }
        let model = model.trim();
        self.allowed_models
            .iter()
            .any(|allowed| allowed.trim().eq_ignore_ascii_case(model))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanAssignmentRecord {
    pub id: i64,
    pub subject_type: String,
    pub subject_id: i64,
    pub plan_id: i64,
    pub billing_mode: BillingMode,
    pub activated_at: i64,
    pub deactivated_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub auto_fallback_enabled: bool,
    pub rollover_amount: i64,
    pub rollover_policy: RolloverPolicy,
    pub rollover_expires_at: Option<i64>,
}

impl PlanAssignmentRecord {
    pub fn is_active_at(&self, now: i64) -> bool {
        self.activated_at <= now
            && self.deactivated_at.is_none_or(|at| now < at)
            && self.expires_at.is_none_or(|at| now < at)
    }

    /// Rollover counts toward the allowance only until it expires.
    pub fn effective_rollover(&self, now: i64) -> i64 {
        match self.rollover_expires_at {
            Some(expires_at) if expires_at <= now => 0,
            _ => self.rollover_amount.max(0),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounterRecord {
    pub id: i64,
    pub plan_assignment_id: i64,
    pub metric: QuotaMetric,
    pub cycle_start: i64,
    pub cycle_end: i64,
    pub consumed_amount: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestLogRecord {
    pub id: i64,
    pub request_id: String,
    pub occurred_at: i64,
    pub subject_type: String,
    pub anonymized_subject_hash: String,
    pub plan_id: Option<i64>,
    pub plan_assignment_id: Option<i64>,
    pub model_alias: String,
    pub upstream_provider: String,
    pub usage_metric: QuotaMetric,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub latency_ms: i64,
    pub metadata: serde_json::Value,
    pub is_public: bool,
}

impl RequestLogRecord {
    pub fn mode(&self) -> Option<BillingMode> {
        self.metadata
            .get("mode")
            .and_then(|mode| mode.as_str())
            .and_then(BillingMode::parse)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestFlagRecord {
    pub id: i64,
    pub request_id: String,
    pub subject_key: String,
    pub user_id: Option<i64>,
    pub token_id: Option<i64>,
    pub reason: String,
    pub severity: FlagSeverity,
    pub reasons: Vec<String>,
    pub rerouted_model_alias: Option<String>,
    pub excluded_from_leaderboard: bool,
    pub metadata: serde_json::Value,
    pub created_at: i64,
    pub ttl_at: Option<i64>,
}

/// One telemetry row per relayed request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeimdallRequestLog {
    pub request_id: String,
    pub occurred_at: i64,
    pub auth_key_fingerprint: String,
    pub normalized_url: String,
    pub http_method: String,
    pub http_status: u16,
    pub latency_ms: i64,
    pub client_ip: String,
    pub country_code: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub client_user_agent: String,
    pub client_device_id: String,
    pub request_size_bytes: i64,
    pub response_size_bytes: i64,
    pub param_digest: String,
    pub sanitized_cookies: String,
    pub model_name: String,
    pub upstream_provider: String,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub user_id: Option<i64>,
    pub token_id: Option<i64>,
    pub excluded_from_leaderboard: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherBatchRecord {
    pub id: i64,
    pub code_prefix: String,
    pub grant_type: GrantType,
    pub credit_amount: Option<i64>,
    pub plan_grant_id: Option<i64>,
    pub valid_from: Option<i64>,
    pub valid_until: Option<i64>,
    pub max_redemptions: i64,
    pub max_per_subject: i64,
    pub created_at: i64,
    pub deleted_at: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherCodeRecord {
    pub id: i64,
    pub batch_id: i64,
    pub code: String,
    pub status: VoucherCodeStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherRedemptionRecord {
    pub id: i64,
    pub batch_id: i64,
    pub code: String,
    pub subject_key: String,
    pub grant_type: GrantType,
    pub credit_amount: Option<i64>,
    pub plan_assignment_id: Option<i64>,
    pub redeemed_at: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpListEntry {
    pub id: i64,
    pub ip_pattern: String,
    pub kind: IpListKind,
    pub reason: Option<String>,
    pub created_at: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpBanRecord {
    pub id: i64,
    pub ip: String,
    pub reason: String,
    pub permanent: bool,
    pub expires_at: Option<i64>,
    pub created_at: i64,
    pub active: bool,
}

impl IpBanRecord {
    pub fn is_active_at(&self, now: i64) -> bool {
        self.active && (self.permanent || self.expires_at.is_none_or(|at| at > now))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRateLimitRule {
    pub id: i64,
    pub ip_pattern: String,
    pub max_requests: u64,
    pub window_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SecurityAnomalyRecord {
    pub id: i64,
    pub user_id: i64,
    pub token_id: Option<i64>,
    pub rule_type: String,
    pub severity: AnomalySeverity,
    pub message: String,
    pub evidence: serde_json::Value,
    pub risk_score: f64,
    pub status: AnomalyStatus,
    pub action_taken: Option<EnforcementAction>,
    pub detected_at: i64,
    pub actioned_at: Option<i64>,
    pub ttl_until: Option<i64>,
    pub reviewed_by: Option<i64>,
    pub reviewed_at: Option<i64>,
    pub review_decision: Option<String>,
    pub review_rationale: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnomalyBaselineRecord {
    pub user_id: i64,
    pub metric_type: String,
    pub baseline_value: f64,
    pub window_size_seconds: i64,
    pub sample_size: i64,
    pub updated_at: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthAuditEntry {
    pub request_id: String,
    pub occurred_at: i64,
    pub method: String,
    pub result: String,
    pub client_ip: String,
    pub tls_version: Option<String>,
    pub tls_cipher: Option<String>,
    pub peer_cn: Option<String>,
    pub latency_ms: i64,
    pub error: Option<String>,
    pub payload: Option<String>,
}
