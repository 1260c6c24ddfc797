use std::sync::Arc;

use chrono::Utc;
use event_common::decode::decode_fields;
use event_common::event::{CanonicalEvent, StreamRecord};
use event_common::mapping::IndexSettings;
use event_common::metrics::{EVENTS_ACKED, EVENTS_FAILED, EVENTS_PROCESSED};
use health::WorkerStats;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::broker::Broker;
use crate::error::ProcessError;
use crate::indexer::{EventIndexer, IndexRouter};
use crate::store::DocumentStore;

/// Runs a single message through decode, route, index and acknowledge.
pub struct EventProcessor<B, S> {
    broker: Arc<B>,
    group: String,
    router: IndexRouter<S>,
    indexer: EventIndexer<S>,
    stats: Arc<WorkerStats>,
}

impl<B: Broker, S: DocumentStore> EventProcessor<B, S> {
    pub fn new(
        broker: Arc<B>,
        store: Arc<S>,
        worker_name: &str,
        group: &str,
        settings: &IndexSettings,
        stats: Arc<WorkerStats>,
    ) -> Self {
        Self {
            broker,
            group: group.to_owned(),
            router: IndexRouter::new(store.clone(), settings),
            indexer: EventIndexer::new(store, worker_name),
            stats,
        }
    }

    /// Process one message. The message is acknowledged only if it was indexed; on any error
    /// it stays pending.
    pub async fn process(&self, record: &StreamRecord) -> Result<String, ProcessError> {
        let fields = decode_fields(&record.fields)?;
        let event = CanonicalEvent::from_fields(record, fields, Utc::now())?;

        let index = self.router.resolve(&event);
        self.router
            .ensure(&index)
            .await
            .map_err(|error| ProcessError::Index {
                index: index.clone(),
                error,
            })?;
        self.indexer
            .upsert(&index, event)
            .await
            .map_err(|error| ProcessError::Index {
                index: index.clone(),
                error,
            })?;

        let acked = self
            .broker
            .ack(&record.stream, &self.group, &record.id)
            .await
            .map_err(ProcessError::Ack)?;
        if acked == 0 {
            // Someone else claimed it in the meantime: it will be indexed again, to the same id.
            debug!(stream = %record.stream, id = %record.id, "message was no longer pending");
        }
        Ok(index)
    }

    /// Process one message, recording the outcome. Returns whether it succeeded.
    pub async fn handle(&self, record: &StreamRecord) -> bool {
        match self.process(record).await {
            Ok(index) => {
                debug!(stream = %record.stream, id = %record.id, index = %index, "indexed event");
                self.stats.record_success();
                metrics::counter!(EVENTS_PROCESSED).increment(1);
                metrics::counter!(EVENTS_ACKED).increment(1);
                true
            }
            Err(error) => {
                match &error {
                    ProcessError::Ack(_) => {
                        warn!(stream = %record.stream, id = %record.id, "{}", error)
                    }
                    _ => error!(stream = %record.stream, id = %record.id, "{}", error),
                }
                self.stats.record_failure();
                metrics::counter!(EVENTS_FAILED, "stage" => error.stage()).increment(1);
                false
            }
        }
    }

    /// Process messages in order, stopping early if `token` is cancelled. Messages left
    /// unprocessed stay pending. Returns how many succeeded.
    pub async fn handle_batch(&self, records: &[StreamRecord], token: &CancellationToken) -> usize {
        let mut succeeded = 0;
        for (position, record) in records.iter().enumerate() {
            if token.is_cancelled() {
                debug!(
                    remaining = records.len() - position,
                    "shutdown requested, leaving rest of batch pending"
                );
                break;
            }
            if self.handle(record).await {
                succeeded += 1;
            }
        }
        succeeded
    }
}
