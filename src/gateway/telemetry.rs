//! Asynchronous telemetry: a bounded queue drained by a worker pool into the store,
//! with fixed-delay retries and a disk spill for rows the store keeps refusing.
//!
//! Delivery is at-least-once. `enqueue` never waits; when the queue is full the row
//! is dropped and counted.

pub mod disk_queue;
pub mod geo;
pub mod normalize;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use self::disk_queue::{DiskQueue, DiskQueueError, DiskQueueStats, QueueBatch};
pub use self::geo::{GeoLocation, GeoLocator, HttpGeoLocator};
use super::Clock;
use super::cache::Cache;
use super::config::TelemetryConfig;
use super::context::RequestContext;
use super::store::{SqliteStore, StoreError};
use super::store_types::HeimdallRequestLog;

const COUNTER_TTL: Duration = Duration::from_secs(3600);

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn persist(&self, log: &HeimdallRequestLog) -> Result<(), StoreError>;
}

#[async_trait]
impl TelemetrySink for SqliteStore {
    async fn persist(&self, log: &HeimdallRequestLog) -> Result<(), StoreError> {
        self.insert_heimdall_log(log).await
    }
}

/// What the relay knows once the response is out.
#[derive(Clone, Debug, Default)]
pub struct ResponseSummary {
    pub status: u16,
    pub response_size: usize,
    pub upstream_provider: String,
    pub error_message: Option<String>,
}

/// Telemetry row for a finished request.
pub fn request_log(ctx: &RequestContext, summary: &ResponseSummary, now_ms: u64) -> HeimdallRequestLog {
    let (path, query) = match ctx.path.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (ctx.path.as_str(), None),
    };
    let error_type = normalize::categorize_error(summary.status).map(str::to_string);
    HeimdallRequestLog {
        request_id: ctx.request_id.clone(),
        occurred_at: i64::try_from(ctx.started_at_ms / 1000).unwrap_or(i64::MAX),
        auth_key_fingerprint: normalize::auth_fingerprint(ctx.header("authorization")),
        normalized_url: normalize::normalize_url(path, &ctx.method, false),
        http_method: ctx.method.clone(),
        http_status: summary.status,
        latency_ms: i64::try_from(now_ms.saturating_sub(ctx.started_at_ms)).unwrap_or(i64::MAX),
        client_ip: ctx.client_ip(),
        country_code: None,
        region: None,
        city: None,
        client_user_agent: normalize::sanitize_user_agent(ctx.header("user-agent").unwrap_or_default()),
        client_device_id: ctx.header("x-device-id").unwrap_or_default().to_string(),
        request_size_bytes: i64::try_from(ctx.body.len()).unwrap_or(i64::MAX),
        response_size_bytes: i64::try_from(summary.response_size).unwrap_or(i64::MAX),
        param_digest: normalize::param_digest(&ctx.body, query),
        sanitized_cookies: normalize::sanitize_cookies(ctx.header("cookie").unwrap_or_default()),
        model_name: ctx.model().unwrap_or_default().to_string(),
        upstream_provider: summary.upstream_provider.clone(),
        error_message: summary
            .error_message
            .clone()
            .filter(|_| error_type.is_some()),
        error_type,
        user_id: ctx.user_id(),
        token_id: ctx.token_id(),
        excluded_from_leaderboard: ctx.excluded_from_leaderboard,
    }
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    persisted: AtomicU64,
    spilled: AtomicU64,
    recovered: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryStats {
    pub running: bool,
    pub buffer_len: usize,
    pub buffer_capacity: usize,
    pub worker_count: usize,
    pub enqueued: u64,
    pub dropped: u64,
    pub persisted: u64,
    pub spilled: u64,
    pub recovered: u64,
    pub disk_queue: Option<DiskQueueStats>,
}

struct Shared {
    sink: Arc<dyn TelemetrySink>,
    cache: Arc<dyn Cache>,
    geo: Option<Arc<dyn GeoLocator>>,
    disk: Option<DiskQueue>,
    /// One disk drain at a time; batches are committed by line count.
    flush_lock: tokio::sync::Mutex<()>,
    counters: Counters,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl Shared {
    async fn process(&self, mut log: HeimdallRequestLog) {
        if let Some(geo) = &self.geo {
            if log.country_code.is_none() && !log.client_ip.is_empty() {
                if let Some(location) = geo.locate(&log.client_ip).await {
                    log.country_code = location.country_code;
                    log.region = location.region;
                    log.city = location.city;
                }
            }
        }

        let attempts = self.retry_attempts.max(1);
        for attempt in 1..=attempts {
            match self.sink.persist(&log).await {
                Ok(()) => {
                    self.counters.persisted.fetch_add(1, Ordering::Relaxed);
                    self.bump_frequency_counters(&log).await;
                    return;
                }
                Err(err) if !err.is_transient() => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(request_id = %log.request_id, error = %err, "telemetry row rejected by store");
                    return;
                }
                Err(err) => {
                    tracing::warn!(request_id = %log.request_id, attempt, error = %err, "telemetry persist failed");
                    if attempt < attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        self.spill(log).await;
    }

    async fn spill(&self, log: HeimdallRequestLog) {
        let Some(disk) = self.disk.clone() else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::error!(request_id = %log.request_id, "telemetry row dropped, disk queue disabled");
            return;
        };
        let request_id = log.request_id.clone();
        match tokio::task::spawn_blocking(move || disk.append(&log)).await {
            Ok(Ok(())) => {
                self.counters.spilled.fetch_add(1, Ordering::Relaxed);
                tracing::info!(request_id = %request_id, "telemetry row spilled to disk");
            }
            Ok(Err(err)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(request_id = %request_id, error = %err, "telemetry disk spill failed");
            }
            Err(err) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(request_id = %request_id, error = %err, "telemetry disk spill task failed");
            }
        }
    }

    async fn bump_frequency_counters(&self, log: &HeimdallRequestLog) {
        let mut keys = Vec::with_capacity(3);
        if !log.normalized_url.is_empty() {
            keys.push(format!("heimdall:url:{}:count", log.normalized_url));
        }
        if let Some(token_id) = log.token_id {
            keys.push(format!("heimdall:token:{token_id}:count"));
        }
        if let Some(user_id) = log.user_id {
            keys.push(format!("heimdall:user:{user_id}:count"));
        }
        for key in keys {
            if let Err(err) = self.cache.incr(&key, COUNTER_TTL).await {
                tracing::debug!(key = %key, error = %err, "frequency counter skipped");
            }
        }
    }

    /// One pass over the oldest spill segment. Rows that still fail go back to disk.
    async fn flush_disk_queue(&self, batch_size: usize) -> usize {
        let Some(disk) = self.disk.clone() else {
            return 0;
        };
        let _flushing = self.flush_lock.lock().await;
        let reader = disk.clone();
        let batch = match tokio::task::spawn_blocking(move || reader.peek_batch(batch_size)).await {
            Ok(Ok(batch)) => batch,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "disk queue read failed");
                return 0;
            }
            Err(err) => {
                tracing::warn!(error = %err, "disk queue read task failed");
                return 0;
            }
        };

        let mut recovered = 0;
        let mut failed = Vec::new();
        for log in &batch.logs {
            match self.sink.persist(log).await {
                Ok(()) => {
                    recovered += 1;
                    self.bump_frequency_counters(log).await;
                }
                Err(err) => {
                    tracing::debug!(request_id = %log.request_id, error = %err, "disk queue row still failing");
                    failed.push(log.clone());
                }
            }
        }
        self.counters
            .recovered
            .fetch_add(recovered as u64, Ordering::Relaxed);
        self.counters
            .persisted
            .fetch_add(recovered as u64, Ordering::Relaxed);

        // Failed rows move to the tail before the batch leaves the head.
        let requeued = failed.len();
        let result = tokio::task::spawn_blocking(move || {
            failed.iter().try_for_each(|log| disk.append(log))?;
            disk.commit(&batch)
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(requeued, error = %err, "failed to settle disk queue batch");
            }
            Err(err) => {
                tracing::error!(requeued, error = %err, "disk queue commit task failed");
            }
        }
        if recovered > 0 {
            tracing::info!(recovered, "flushed telemetry rows from disk queue");
        }
        recovered
    }
}

pub struct TelemetryPipeline {
    config: TelemetryConfig,
    sender: Mutex<Option<mpsc::Sender<HeimdallRequestLog>>>,
    shared: Arc<Shared>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl TelemetryPipeline {
    /// Spawns the workers and the disk flusher. Must run inside a Tokio runtime.
    pub fn start(
        config: TelemetryConfig,
        sink: Arc<dyn TelemetrySink>,
        cache: Arc<dyn Cache>,
        geo: Option<Arc<dyn GeoLocator>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let disk = if config.enabled && config.disk_queue_enabled {
            match DiskQueue::open(&config.disk_queue_path, clock) {
                Ok(disk) => Some(disk),
                Err(err) => {
                    tracing::warn!(path = %config.disk_queue_path.display(), error = %err, "disk queue unavailable");
                    None
                }
            }
        } else {
            None
        };

        let shared = Arc::new(Shared {
            sink,
            cache,
            geo: geo.filter(|_| config.geolocation_enabled),
            disk,
            flush_lock: tokio::sync::Mutex::new(()),
            counters: Counters::default(),
            retry_attempts: config.retry_attempts,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        });
        let shutdown = CancellationToken::new();

        if !config.enabled {
            return Self {
                config,
                sender: Mutex::new(None),
                shared,
                tasks: tokio::sync::Mutex::new(Vec::new()),
                shutdown,
                running: AtomicBool::new(false),
            };
        }

        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut tasks: Vec<JoinHandle<()>> = (0..config.worker_count.max(1))
            .map(|id| spawn_worker(id, rx.clone(), shared.clone()))
            .collect();
        tasks.push(spawn_flusher(
            shared.clone(),
            shutdown.clone(),
            Duration::from_millis(config.flush_interval_ms.max(1)),
            config.flush_batch_size.max(1),
        ));
        tracing::info!(
            workers = config.worker_count.max(1),
            buffer = config.buffer_size,
            disk_queue = shared.disk.is_some(),
            "telemetry pipeline started"
        );

        Self {
            config,
            sender: Mutex::new(Some(tx)),
            shared,
            tasks: tokio::sync::Mutex::new(tasks),
            shutdown,
            running: AtomicBool::new(true),
        }
    }

    /// Hands a row to the workers; false when it was dropped.
    pub fn enqueue(&self, log: HeimdallRequestLog) -> bool {
        let sender = match self.sender.lock() {
            Ok(sender) => sender.clone(),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match sender.try_send(log) {
            Ok(()) => {
                self.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(log)) => {
                self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(request_id = %log.request_id, "telemetry buffer full, dropping row");
                false
            }
            Err(mpsc::error::TrySendError::Closed(log)) => {
                self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(request_id = %log.request_id, "telemetry pipeline closed, dropping row");
                false
            }
        }
    }

    pub async fn flush_disk_queue(&self) -> usize {
        self.shared
            .flush_disk_queue(self.config.flush_batch_size.max(1))
            .await
    }

    /// Removes spill segments older than a day.
    pub async fn cleanup_disk_queue(&self) -> usize {
        let Some(disk) = self.shared.disk.clone() else {
            return 0;
        };
        match tokio::task::spawn_blocking(move || disk.cleanup()).await {
            Ok(Ok(removed)) => removed,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "disk queue cleanup failed");
                0
            }
            Err(err) => {
                tracing::warn!(error = %err, "disk queue cleanup task failed");
                0
            }
        }
    }

    pub fn disk_queue(&self) -> Option<&DiskQueue> {
        self.shared.disk.as_ref()
    }

    /// Closes the queue, lets the workers drain it and waits for the final flush.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "telemetry task ended abnormally");
            }
        }
        tracing::info!(
            persisted = self.shared.counters.persisted.load(Ordering::Relaxed),
            spilled = self.shared.counters.spilled.load(Ordering::Relaxed),
            dropped = self.shared.counters.dropped.load(Ordering::Relaxed),
            "telemetry pipeline stopped"
        );
    }

    pub fn stats(&self) -> TelemetryStats {
        let (buffer_len, buffer_capacity) = match self.sender.lock() {
            Ok(sender) => match sender.as_ref() {
                Some(sender) => (
                    sender.max_capacity() - sender.capacity(),
                    sender.max_capacity(),
                ),
                None => (0, self.config.buffer_size),
            },
            Err(_) => (0, self.config.buffer_size),
        };
        let counters = &self.shared.counters;
        TelemetryStats {
            running: self.running.load(Ordering::SeqCst),
            buffer_len,
            buffer_capacity,
            worker_count: self.config.worker_count,
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            persisted: counters.persisted.load(Ordering::Relaxed),
            spilled: counters.spilled.load(Ordering::Relaxed),
            recovered: counters.recovered.load(Ordering::Relaxed),
            disk_queue: self.shared.disk.as_ref().map(DiskQueue::stats),
        }
    }
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<HeimdallRequestLog>>>;

/// Supervises one worker; a panicking worker is replaced.
fn spawn_worker(id: usize, rx: SharedReceiver, shared: Arc<Shared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let handle = tokio::spawn(worker_loop(rx.clone(), shared.clone()));
            match handle.await {
                Ok(()) => break,
                Err(err) if err.is_panic() => {
                    tracing::error!(worker = id, "telemetry worker panicked, respawning");
                }
                Err(_) => break,
            }
        }
    })
}

async fn worker_loop(rx: SharedReceiver, shared: Arc<Shared>) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(log) = next else {
            break;
        };
        shared.process(log).await;
    }
}

fn spawn_flusher(
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    interval: Duration,
    batch_size: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    shared.flush_disk_queue(batch_size).await;
                    break;
                }
                _ = ticker.tick() => {
                    shared.flush_disk_queue(batch_size).await;
                }
            }
        }
    })
}
