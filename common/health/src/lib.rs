//! Health reporting for the event indexer worker.
//!
//! The worker runs two asynchronous loops: the consume loop, which moves
//! events from the broker into the document store, and the health loop,
//! which periodically probes both dependencies and publishes a snapshot.
//!
//! The consume loop only ever touches `WorkerStats` (lock-free counters), so
//! it can never be slowed down by health reporting. The health loop reads the
//! counters, builds a `HealthSnapshot`, publishes it to the broker with a TTL
//! and stores it on the `HealthBoard`, which backs the `/_liveness` probe.
//!
//! A snapshot that is absent (never published, or expired in the broker) must
//! be read as "worker is dead": the TTL is what turns a crashed process into
//! a visible signal.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Serialize, Serializer};
use tracing::warn;

/// Status of one dependency as seen by the last liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyStatus {
    Healthy,
    Unhealthy(String),
}

impl DependencyStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, DependencyStatus::Healthy)
    }
}

impl fmt::Display for DependencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyStatus::Healthy => write!(f, "healthy"),
            DependencyStatus::Unhealthy(reason) => write!(f, "unhealthy: {reason}"),
        }
    }
}

impl Serialize for DependencyStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Overall status of the worker: degraded as soon as one dependency probe fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub worker_name: String,
    pub status: WorkerStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: f64,
    pub processed_events: u64,
    pub failed_events: u64,
    /// Last time a message was handled, successfully or not.
    pub last_activity: Option<DateTime<Utc>>,
    pub services: BTreeMap<String, DependencyStatus>,
}

impl HealthSnapshot {
    /// Build a snapshot from the current counters. Starts out healthy with no
    /// dependencies; add them with `with_dependency`.
    pub fn from_stats(worker_name: &str, stats: &WorkerStats) -> Self {
        Self {
            worker_name: worker_name.to_owned(),
            status: WorkerStatus::Healthy,
            timestamp: Utc::now(),
            uptime_seconds: stats.uptime_seconds(),
            processed_events: stats.processed(),
            failed_events: stats.failed(),
            last_activity: stats.last_activity(),
            services: BTreeMap::new(),
        }
    }

    pub fn with_dependency(mut self, name: &str, status: DependencyStatus) -> Self {
        if !status.is_healthy() {
            self.status = WorkerStatus::Degraded;
        }
        self.services.insert(name.to_owned(), status);
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status == WorkerStatus::Healthy
    }
}

/// Counters shared between the consume loop (writer) and the health loop (reader).
#[derive(Debug)]
pub struct WorkerStats {
    started_at: Instant,
    processed: AtomicU64,
    failed: AtomicU64,
    // Unix millis, 0 until the first message is handled
    last_activity_ms: AtomicI64,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_activity_ms: AtomicI64::new(0),
        }
    }

    pub fn record_success(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        match self.last_activity_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}

/// Holds the latest published snapshot for the liveness probe.
#[derive(Clone, Default)]
pub struct HealthBoard {
    latest: Arc<RwLock<Option<HealthSnapshot>>>,
}

impl HealthBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: HealthSnapshot) {
        match self.latest.write() {
            Ok(mut latest) => *latest = Some(snapshot),
            // Poisoned lock: the probe keeps answering with the stale snapshot
            Err(_) => warn!("poisoned HealthBoard lock"),
        }
    }

    pub fn latest(&self) -> Option<HealthSnapshot> {
        self.latest.read().ok().and_then(|latest| latest.clone())
    }

    /// Current liveness answer. Can be used as an axum handler.
    pub fn report(&self) -> LivenessReport {
        LivenessReport(self.latest())
    }
}

pub struct LivenessReport(pub Option<HealthSnapshot>);

impl IntoResponse for LivenessReport {
    /// 200 with the snapshot if healthy, 500 if degraded or nothing was published yet.
    fn into_response(self) -> Response {
        match self.0 {
            Some(snapshot) if snapshot.is_healthy() => (StatusCode::OK, Json(snapshot)).into_response(),
            Some(snapshot) => (StatusCode::INTERNAL_SERVER_ERROR, Json(snapshot)).into_response(),
            None => (StatusCode::INTERNAL_SERVER_ERROR, "no health snapshot published yet")
                .into_response(),
        }
    }
}
