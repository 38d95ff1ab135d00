//! Request admission, billing, governance and telemetry core.

pub mod admission;
pub mod anomaly;
pub mod auth;
pub mod billing;
pub mod cache;
pub mod config;
pub mod context;
pub mod crypto;
pub mod env;
pub mod governance;
pub mod http;
pub mod ip_protection;
pub mod limits;
pub mod observability;
pub mod otel;
pub mod pricing;
pub mod scheduler;
pub mod store;
pub mod store_types;
pub mod telemetry;
pub mod upstream;
pub mod vouchers;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use admission::Heimdall;
pub use config::GatewayConfig;
pub use context::{RequestContext, SubjectKey, SubjectType};
pub use env::Env;
pub use store::{SqliteStore, StoreError};

/// Snapshot returned with a `RateLimited` rejection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub limit_type: String,
    pub current_count: u64,
    pub limit: u64,
    pub window_start: i64,
    pub reset_time: i64,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication failed: {reason}")]
    Unauthenticated { reason: String },
    #[error("replayed request id: {request_id}")]
    Replay { request_id: String },
    #[error("invalid request body: {reason}")]
    SchemaInvalid { reason: String },
    #[error("ip blocked: {reason}")]
    IpBlocked { reason: String },
    #[error("user blocked: {reason}")]
    UserBlocked { code: &'static str, reason: String },
    #[error("rate limit exceeded: {}>{}", .status.limit_type, .status.limit)]
    RateLimited { status: RateLimitStatus },
    #[error(
        "plan exhausted (assignment={assignment_id}, metric={metric}, remaining={remaining}, needed={needed})"
    )]
    PlanExhausted {
        assignment_id: i64,
        metric: String,
        remaining: i64,
        needed: i64,
    },
    #[error(
        "balance insufficient (user={user_id}, token={token_id}, remaining={remaining}, needed={needed})"
    )]
    BalanceInsufficient {
        user_id: i64,
        token_id: i64,
        remaining: i64,
        needed: i64,
    },
    #[error("model restricted by plan: {model}")]
    ModelRestricted { model: String },
    #[error("store error: {message}")]
    Store { message: String },
    #[error("upstream error: {message}")]
    Upstream { message: String },
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated { .. } => "unauthenticated",
            Self::Replay { .. } => "replay",
            Self::SchemaInvalid { .. } => "schema_invalid",
            Self::IpBlocked { .. } => "ip_blocked",
            Self::UserBlocked { .. } => "user_blocked",
            Self::RateLimited { .. } => "rate_limited",
            Self::PlanExhausted { .. } => "plan_exhausted",
            Self::BalanceInsufficient { .. } => "balance_insufficient",
            Self::ModelRestricted { .. } => "model_restricted",
            Self::Store { .. } => "store",
            Self::Upstream { .. } => "upstream",
            Self::InvalidRequest { .. } => "invalid_request",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthenticated { .. } => 401,
            Self::Replay { .. } | Self::SchemaInvalid { .. } | Self::InvalidRequest { .. } => 400,
            Self::IpBlocked { .. } | Self::UserBlocked { .. } => 403,
            Self::RateLimited { .. } => 429,
            Self::PlanExhausted { .. }
            | Self::BalanceInsufficient { .. }
            | Self::ModelRestricted { .. } => 402,
            Self::Store { .. } => 500,
            Self::Upstream { .. } => 502,
        }
    }

    pub fn is_billing_rejection(&self) -> bool {
        self.status_code() == 402
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::PlanExhausted {
                assignment_id,
                metric,
                remaining,
                needed,
            } => Self::PlanExhausted {
                assignment_id,
                metric,
                remaining,
                needed,
            },
            StoreError::BalanceInsufficient {
                user_id,
                token_id,
                remaining,
                needed,
            } => Self::BalanceInsufficient {
                user_id,
                token_id,
                remaining,
                needed,
            },
            StoreError::ModelRestricted { model } => Self::ModelRestricted { model },
            other => Self::Store {
                message: other.to_string(),
            },
        }
    }
}

pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;

    fn now_epoch_millis(&self) -> u64 {
        self.now_epoch_seconds().saturating_mul(1000)
    }

    fn now_unix(&self) -> i64 {
        i64::try_from(self.now_epoch_seconds()).unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        now.as_secs()
    }

    fn now_epoch_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Settable clock for jobs replayed at a fixed instant and for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(epoch_seconds: u64) -> Self {
        Self {
            millis: AtomicU64::new(epoch_seconds.saturating_mul(1000)),
        }
    }

    pub fn set_epoch_seconds(&self, epoch_seconds: u64) {
        self.millis
            .store(epoch_seconds.saturating_mul(1000), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_seconds(&self) -> u64 {
        self.millis.load(Ordering::SeqCst) / 1000
    }

    fn now_epoch_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}
