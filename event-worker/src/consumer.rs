use std::sync::Arc;
use std::time;

use event_common::event::StreamRecord;
use event_common::metrics::PENDING_RECOVERED;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::error::{BrokerError, ConsumerError};
use crate::store::DocumentStore;
use crate::worker::EventProcessor;

/// The id right after `id` in stream order, used to page through pending lists.
pub fn next_id(id: &str) -> Option<String> {
    let (ms, seq) = id.split_once('-')?;
    let ms: u64 = ms.parse().ok()?;
    let seq: u64 = seq.parse().ok()?;

    Some(match seq.checked_add(1) {
        Some(seq) => format!("{ms}-{seq}"),
        None => format!("{}-0", ms.checked_add(1)?),
    })
}

/// Summary of a recovery pass over one stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Recovered {
    /// Pending messages replayed, successfully or not.
    pub replayed: usize,
    /// Pending entries whose message no longer exists. They stay pending.
    pub missing: usize,
    /// Messages taken over from other consumers.
    pub claimed: usize,
}

/// A member of a consumer group reading from several streams.
pub struct StreamConsumer<B> {
    broker: Arc<B>,
    group: String,
    name: String,
    streams: Vec<String>,
    batch_size: usize,
    block: time::Duration,
    claim_idle: Option<time::Duration>,
}

impl<B: Broker> StreamConsumer<B> {
    pub fn new(
        broker: Arc<B>,
        group: &str,
        name: &str,
        streams: &[String],
        batch_size: usize,
        block: time::Duration,
    ) -> Self {
        Self {
            broker,
            group: group.to_owned(),
            name: name.to_owned(),
            streams: streams.to_vec(),
            batch_size: batch_size.max(1),
            block,
            claim_idle: None,
        }
    }

    /// Also take over messages other consumers left pending for longer than `idle`.
    pub fn claim_idle(mut self, idle: Option<time::Duration>) -> Self {
        self.claim_idle = idle;
        self
    }

    pub fn streams(&self) -> &[String] {
        &self.streams
    }

    /// Make sure the group exists on `stream`. Returns whether it had to be created.
    pub async fn register_group(&self, stream: &str) -> Result<bool, ConsumerError> {
        match self.broker.create_group(stream, &self.group).await {
            Ok(()) => {
                info!(stream, group = %self.group, "created consumer group");
                Ok(true)
            }
            Err(error) if error.is_busy_group() => Ok(false),
            Err(error) => Err(ConsumerError::RegisterGroup {
                stream: stream.to_owned(),
                group: self.group.clone(),
                error,
            }),
        }
    }

    /// Replay every message of `stream` still pending for this consumer, page by page, through
    /// `processor`. Runs before any new message is read.
    pub async fn recover_pending<S: DocumentStore>(
        &self,
        stream: &str,
        processor: &EventProcessor<B, S>,
        token: &CancellationToken,
    ) -> Result<Recovered, ConsumerError> {
        let mut recovered = Recovered::default();
        let mut start = "-".to_owned();

        loop {
            let page = self
                .broker
                .pending(stream, &self.group, Some(&self.name), &start, self.batch_size)
                .await
                .map_err(|error| self.recovery_error(stream, error))?;

            for entry in &page {
                if token.is_cancelled() {
                    return Ok(recovered);
                }
                let record = self
                    .broker
                    .fetch(stream, &entry.id)
                    .await
                    .map_err(|error| self.recovery_error(stream, error))?;

                match record {
                    Some(record) => {
                        processor.handle(&record).await;
                        recovered.replayed += 1;
                        metrics::counter!(PENDING_RECOVERED).increment(1);
                    }
                    None => {
                        warn!(
                            stream,
                            id = %entry.id,
                            deliveries = entry.deliveries,
                            "pending message no longer exists, leaving it for an operator"
                        );
                        recovered.missing += 1;
                    }
                }
            }

            let Some(last) = page.last() else { break };
            if page.len() < self.batch_size {
                break;
            }
            match next_id(&last.id) {
                Some(next) => start = next,
                None => break,
            }
        }

        if self.claim_idle.is_some() && !token.is_cancelled() {
            recovered.claimed = self.claim_abandoned(stream, processor, token).await?;
        }

        if recovered != Recovered::default() {
            info!(
                stream,
                replayed = recovered.replayed,
                missing = recovered.missing,
                claimed = recovered.claimed,
                "recovered pending messages"
            );
        }
        Ok(recovered)
    }

    /// Take over and process messages other consumers of the group have left idle.
    async fn claim_abandoned<S: DocumentStore>(
        &self,
        stream: &str,
        processor: &EventProcessor<B, S>,
        token: &CancellationToken,
    ) -> Result<usize, ConsumerError> {
        let Some(min_idle) = self.claim_idle else {
            return Ok(0);
        };
        let mut claimed = 0;
        let mut start = "-".to_owned();

        loop {
            let page = self
                .broker
                .pending(stream, &self.group, None, &start, self.batch_size)
                .await
                .map_err(|error| self.recovery_error(stream, error))?;

            let ids: Vec<String> = page
                .iter()
                .filter(|entry| entry.consumer != self.name && entry.idle >= min_idle)
                .map(|entry| entry.id.clone())
                .collect();

            if !ids.is_empty() {
                let records = self
                    .broker
                    .claim(stream, &self.group, &self.name, min_idle, &ids)
                    .await
                    .map_err(|error| self.recovery_error(stream, error))?;
                claimed += records.len();
                processor.handle_batch(&records, token).await;
            }

            let Some(last) = page.last() else { break };
            if page.len() < self.batch_size || token.is_cancelled() {
                break;
            }
            match next_id(&last.id) {
                Some(next) => start = next,
                None => break,
            }
        }
        Ok(claimed)
    }

    fn recovery_error(&self, stream: &str, error: BrokerError) -> ConsumerError {
        ConsumerError::Recovery {
            stream: stream.to_owned(),
            error,
        }
    }

    /// One blocking read across all streams. Returns early as soon as any stream has messages,
    /// or empty once the block timeout elapses.
    pub async fn read_batch(&self) -> Result<Vec<StreamRecord>, ConsumerError> {
        self.broker
            .read_group(
                &self.streams,
                &self.group,
                &self.name,
                self.batch_size,
                self.block,
            )
            .await
            .map_err(ConsumerError::Read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBroker, MockDocumentStore};
    use event_common::mapping::IndexSettings;
    use health::WorkerStats;

    const GROUP: &str = "workers";

    fn streams() -> Vec<String> {
        vec!["events:security".to_owned(), "events:ingestion".to_owned()]
    }

    fn consumer(broker: &MockBroker, name: &str, batch_size: usize) -> StreamConsumer<MockBroker> {
        StreamConsumer::new(
            Arc::new(broker.clone()),
            GROUP,
            name,
            &streams(),
            batch_size,
            time::Duration::from_millis(50),
        )
    }

    fn processor(
        broker: &MockBroker,
        store: &MockDocumentStore,
        name: &str,
    ) -> EventProcessor<MockBroker, MockDocumentStore> {
        EventProcessor::new(
            Arc::new(broker.clone()),
            Arc::new(store.clone()),
            name,
            GROUP,
            &IndexSettings::default(),
            Arc::new(WorkerStats::new()),
        )
    }

    #[test]
    fn next_id_increments_sequence() {
        assert_eq!(next_id("1709632800000-0").as_deref(), Some("1709632800000-1"));
        assert_eq!(
            next_id(&format!("5-{}", u64::MAX)).as_deref(),
            Some("6-0")
        );
        assert_eq!(next_id("garbage"), None);
    }

    #[tokio::test]
    async fn register_group_is_idempotent() {
        let broker = MockBroker::new();
        let consumer = consumer(&broker, "c1", 10);

        assert!(consumer.register_group("events:security").await.unwrap());
        assert!(!consumer.register_group("events:security").await.unwrap());
        assert!(broker.has_group("events:security", GROUP));
    }

    #[tokio::test]
    async fn register_group_fails_when_broker_is_down() {
        let broker = MockBroker::new();
        broker.set_unavailable(true);

        let result = consumer(&broker, "c1", 10)
            .register_group("events:security")
            .await;

        assert!(matches!(result, Err(ConsumerError::RegisterGroup { .. })));
    }

    #[tokio::test]
    async fn read_batch_returns_entries_from_every_ready_stream() {
        let broker = MockBroker::new();
        let consumer = consumer(&broker, "c1", 10);
        for stream in streams() {
            consumer.register_group(&stream).await.unwrap();
        }
        broker.add("events:security", &[("event_id", "s1")]);
        broker.add("events:ingestion", &[("event_id", "i1")]);

        let records = consumer.read_batch().await.unwrap();

        let mut seen: Vec<&str> = records.iter().map(|r| r.stream.as_str()).collect();
        seen.sort();
        assert_eq!(seen, vec!["events:ingestion", "events:security"]);
        assert_eq!(broker.read_calls(), 1);
    }

    #[tokio::test]
    async fn read_batch_times_out_empty() {
        let broker = MockBroker::new();
        let consumer = consumer(&broker, "c1", 10);
        for stream in streams() {
            consumer.register_group(&stream).await.unwrap();
        }

        assert!(consumer.read_batch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recovery_pages_through_own_pending_entries() {
        let broker = MockBroker::new();
        let store = MockDocumentStore::new();
        let consumer = consumer(&broker, "c1", 2);
        consumer.register_group("events:security").await.unwrap();
        consumer.register_group("events:ingestion").await.unwrap();
        for n in 0..5 {
            let id = format!("e{n}");
            broker.add("events:security", &[("event_id", id.as_str())]);
        }
        // Delivered but never processed, as after a crash.
        let delivered = consumer.read_batch().await.unwrap();
        assert_eq!(delivered.len(), 2);
        let delivered = consumer.read_batch().await.unwrap();
        assert_eq!(delivered.len(), 2);

        let recovered = consumer
            .recover_pending(
                "events:security",
                &processor(&broker, &store, "c1"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(recovered.replayed, 4);
        assert_eq!(store.document_count(), 4);
        assert!(broker.pending_ids("events:security", GROUP).is_empty());
    }

    #[tokio::test]
    async fn missing_messages_stay_pending() {
        let broker = MockBroker::new();
        let store = MockDocumentStore::new();
        let consumer = consumer(&broker, "c1", 10);
        consumer.register_group("events:security").await.unwrap();
        consumer.register_group("events:ingestion").await.unwrap();
        let gone = broker.add("events:security", &[("event_id", "gone")]);
        broker.add("events:security", &[("event_id", "kept")]);
        consumer.read_batch().await.unwrap();
        broker.delete("events:security", &gone);

        let recovered = consumer
            .recover_pending(
                "events:security",
                &processor(&broker, &store, "c1"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(recovered.replayed, 1);
        assert_eq!(recovered.missing, 1);
        assert_eq!(broker.pending_ids("events:security", GROUP), vec![gone]);
    }

    #[tokio::test]
    async fn idle_entries_of_other_consumers_are_claimed() {
        let broker = MockBroker::new();
        let store = MockDocumentStore::new();
        let dead = consumer(&broker, "dead", 10);
        dead.register_group("events:security").await.unwrap();
        dead.register_group("events:ingestion").await.unwrap();
        broker.add("events:security", &[("event_id", "orphan")]);
        assert_eq!(dead.read_batch().await.unwrap().len(), 1);

        tokio::time::sleep(time::Duration::from_millis(30)).await;

        let alive =
            consumer(&broker, "alive", 10).claim_idle(Some(time::Duration::from_millis(10)));
        let recovered = alive
            .recover_pending(
                "events:security",
                &processor(&broker, &store, "alive"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(recovered.replayed, 0);
        assert_eq!(recovered.claimed, 1);
        assert_eq!(store.document_count(), 1);
        assert!(broker.pending_ids("events:security", GROUP).is_empty());
    }
}
