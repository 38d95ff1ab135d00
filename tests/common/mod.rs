#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use heimdall_gateway::gateway::pricing::ModelPrice;
use heimdall_gateway::gateway::store_types::{TokenRecord, UserRecord};
use heimdall_gateway::gateway::{ManualClock, SqliteStore};
use heimdall_gateway::{GatewayConfig, Heimdall};

// 2024-02-15T13:45:00Z
pub const NOW: u64 = 1_708_004_700;

pub fn can_bind_localhost() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(err) => panic!("failed to bind localhost for httpmock tests: {err}"),
    }
}

pub fn config(dir: &Path) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.database_path = dir.join("heimdall.sqlite");
    config.telemetry.disk_queue_path = dir.join("queue");
    config.telemetry.worker_count = 1;
    config.anonymization_secret = "test-secret".to_string();
    config.pricing = BTreeMap::from([(
        "gpt-4o".to_string(),
        ModelPrice {
            quota_per_request: 2,
            quota_per_1k_tokens: 10,
        },
    )]);
    config
}

pub struct Seeded {
    pub user_id: i64,
    pub token_id: i64,
}

pub async fn seed_account(store: &SqliteStore, username: &str, key: &str, quota: i64) -> Seeded {
    let user_id = store
        .insert_user(&UserRecord {
            id: 0,
            username: username.to_string(),
            quota,
            used_quota: 0,
            status: 1,
            banned: false,
            redirect_model: None,
            encryption_key_hash: None,
            encryption_enabled: false,
            created_at: 0,
        })
        .await
        .expect("insert user");
    let token_id = store
        .insert_token(&TokenRecord {
            id: 0,
            user_id,
            key: key.to_string(),
            name: "default".to_string(),
            status: 1,
            remain_quota: quota,
            unlimited_quota: false,
            model_limits: Vec::new(),
            allowed_ips: Vec::new(),
            billing_mode: None,
            plan_assignment_id: None,
            expires_at: None,
        })
        .await
        .expect("insert token");
    Seeded { user_id, token_id }
}

pub struct TestGateway {
    pub _dir: tempfile::TempDir,
    pub heimdall: Arc<Heimdall>,
    pub clock: Arc<ManualClock>,
}

pub async fn gateway(configure: impl FnOnce(&mut GatewayConfig)) -> TestGateway {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = config(dir.path());
    configure(&mut config);
    let clock = Arc::new(ManualClock::new(NOW));
    let heimdall = Heimdall::builder(config)
        .clock(clock.clone())
        .build()
        .await
        .expect("build heimdall");
    TestGateway {
        _dir: dir,
        heimdall: Arc::new(heimdall),
        clock,
    }
}
