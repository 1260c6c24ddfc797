use std::sync::Arc;
use std::time;

use health::{DependencyStatus, HealthBoard, HealthSnapshot, WorkerStats};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::store::DocumentStore;

pub const BROKER_SERVICE: &str = "redis";
pub const STORE_SERVICE: &str = "opensearch";

pub fn health_key(worker_name: &str) -> String {
    format!("worker:health:{worker_name}")
}

/// Periodically probes both dependencies and publishes a `HealthSnapshot`, to the broker with a
/// TTL of twice the interval and to the local `HealthBoard`.
pub struct HealthReporter<B, S> {
    broker: Arc<B>,
    store: Arc<S>,
    worker_name: String,
    interval: time::Duration,
    stats: Arc<WorkerStats>,
    board: HealthBoard,
}

impl<B: Broker, S: DocumentStore> HealthReporter<B, S> {
    pub fn new(
        broker: Arc<B>,
        store: Arc<S>,
        worker_name: &str,
        interval: time::Duration,
        stats: Arc<WorkerStats>,
        board: HealthBoard,
    ) -> Self {
        Self {
            broker,
            store,
            worker_name: worker_name.to_owned(),
            interval,
            stats,
            board,
        }
    }

    pub fn ttl(&self) -> time::Duration {
        self.interval * 2
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let broker = match self.broker.ping().await {
            Ok(()) => DependencyStatus::Healthy,
            Err(error) => DependencyStatus::Unhealthy(error.to_string()),
        };
        let store = match self.store.ping().await {
            Ok(()) => DependencyStatus::Healthy,
            Err(error) => DependencyStatus::Unhealthy(error.to_string()),
        };

        HealthSnapshot::from_stats(&self.worker_name, &self.stats)
            .with_dependency(BROKER_SERVICE, broker)
            .with_dependency(STORE_SERVICE, store)
    }

    /// Build and publish one snapshot. The board is updated even when the broker write fails.
    pub async fn report(&self) -> HealthSnapshot {
        let snapshot = self.snapshot().await;

        match serde_json::to_string(&snapshot) {
            Ok(payload) => {
                let key = health_key(&self.worker_name);
                if let Err(error) = self.broker.set_ex(&key, &payload, self.ttl()).await {
                    warn!(key = %key, "failed to publish health snapshot: {}", error);
                }
            }
            Err(error) => warn!("failed to serialize health snapshot: {}", error),
        }

        if !snapshot.is_healthy() {
            warn!(services = ?snapshot.services, "worker is degraded");
        } else {
            debug!(
                processed = snapshot.processed_events,
                failed = snapshot.failed_events,
                "published health snapshot"
            );
        }
        self.board.publish(snapshot.clone());
        snapshot
    }

    /// Report right away, then every interval until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        loop {
            self.report().await;

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}
