use std::sync::Arc;
use std::time;

use assert_json_diff::assert_json_eq;
use chrono::Utc;
use event_common::mapping::IndexSettings;
use event_common::retry::RetryPolicy;
use event_worker::broker::Broker;
use event_worker::consumer::StreamConsumer;
use event_worker::error::SupervisorError;
use event_worker::mock::{MockBroker, MockConnector, MockDocumentStore};
use event_worker::reporter::health_key;
use event_worker::supervisor::{Supervisor, WorkerSettings, WorkerState};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WORKER: &str = "worker-1";
const GROUP: &str = "indexers";
const SECURITY: &str = "events:security";
const INGESTION: &str = "events:ingestion";

fn settings() -> WorkerSettings {
    WorkerSettings {
        worker_name: WORKER.to_owned(),
        group: GROUP.to_owned(),
        streams: vec![SECURITY.to_owned(), INGESTION.to_owned()],
        batch_size: 10,
        block: time::Duration::from_millis(20),
        health_interval: time::Duration::from_millis(50),
        claim_idle: None,
        index: IndexSettings::default(),
    }
}

struct Running {
    supervisor: Arc<Supervisor<MockConnector>>,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), SupervisorError>>,
}

impl Running {
    async fn start(broker: &MockBroker, store: &MockDocumentStore) -> Self {
        let supervisor = Arc::new(Supervisor::new(
            MockConnector::new(broker.clone(), store.clone()),
            settings(),
            RetryPolicy::new(3, time::Duration::from_millis(10)),
            RetryPolicy::new(3, time::Duration::from_millis(10)),
        ));
        let shutdown = CancellationToken::new();
        let mut state = supervisor.state();

        let handle = {
            let supervisor = supervisor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { supervisor.run(shutdown).await })
        };

        state
            .wait_for(|state| *state == WorkerState::Running)
            .await
            .expect("supervisor never reached running");

        Self {
            supervisor,
            shutdown,
            handle,
        }
    }

    async fn stop(self) -> Arc<Supervisor<MockConnector>> {
        self.shutdown.cancel();
        self.handle
            .await
            .expect("supervisor task panicked")
            .expect("supervisor failed");
        self.supervisor
    }
}

async fn settle() {
    tokio::time::sleep(time::Duration::from_millis(100)).await;
}

#[tokio::test]
async fn same_event_id_keeps_one_document_with_the_latest_payload() {
    let broker = MockBroker::new();
    let store = MockDocumentStore::new();
    let running = Running::start(&broker, &store).await;

    broker.add(
        SECURITY,
        &[
            ("event_id", "sec-42"),
            ("threat_type", "malware"),
            ("severity", "low"),
            ("timestamp", "2024-03-05T10:00:00Z"),
        ],
    );
    broker.add(
        SECURITY,
        &[
            ("event_id", "sec-42"),
            ("threat_type", "malware"),
            ("severity", "critical"),
            ("timestamp", "2024-03-05T10:00:00Z"),
        ],
    );
    settle().await;
    running.stop().await;

    assert_eq!(store.document_count(), 1);
    let mut document = store
        .document("security-events-2024.03.05", "sec-42")
        .unwrap();
    let object = document.as_object_mut().unwrap();
    assert!(object.remove("processed_at").is_some());
    assert_json_eq!(
        document,
        json!({
            "event_id": "sec-42",
            "threat_type": "malware",
            "severity": "critical",
            "timestamp": "2024-03-05T10:00:00Z",
            "processed_by": WORKER
        })
    );
}

#[tokio::test]
async fn unacknowledged_messages_are_replayed_once_after_a_crash() {
    let broker = MockBroker::new();
    let store = MockDocumentStore::new();

    // A previous incarnation of the worker read three messages and died before acking them.
    let crashed = StreamConsumer::new(
        Arc::new(broker.clone()),
        GROUP,
        WORKER,
        &[SECURITY.to_owned()],
        10,
        time::Duration::ZERO,
    );
    crashed.register_group(SECURITY).await.unwrap();
    for n in 0..3 {
        let id = format!("agent-{n}");
        broker.add(SECURITY, &[("event_id", id.as_str()), ("source", "agent")]);
    }
    assert_eq!(crashed.read_batch().await.unwrap().len(), 3);
    assert_eq!(broker.pending_ids(SECURITY, GROUP).len(), 3);

    let running = Running::start(&broker, &store).await;
    // Recovery is done by the time the worker is running.
    assert_eq!(store.document_count(), 3);
    assert_eq!(store.put_calls(), 3);
    assert!(broker.pending_ids(SECURITY, GROUP).is_empty());

    settle().await;
    running.stop().await;

    assert_eq!(store.put_calls(), 3);
    assert_eq!(store.document_count(), 3);
}

#[tokio::test]
async fn failed_messages_stay_pending_and_are_retried_on_restart() {
    let broker = MockBroker::new();
    let store = MockDocumentStore::new();
    store.reject_document("conflict");

    let running = Running::start(&broker, &store).await;
    let id = broker.add(SECURITY, &[("event_id", "conflict"), ("source_ip", "nope")]);
    broker.add(SECURITY, &[("event_id", "fine")]);
    settle().await;
    let supervisor = running.stop().await;

    assert_eq!(broker.pending_ids(SECURITY, GROUP), vec![id]);
    assert_eq!(store.document_count(), 1);
    assert_eq!(supervisor.stats().failed(), 1);
    assert_eq!(supervisor.stats().processed(), 1);

    store.accept_document("conflict");
    let running = Running::start(&broker, &store).await;
    running.stop().await;

    assert!(broker.pending_ids(SECURITY, GROUP).is_empty());
    assert_eq!(store.document_count(), 2);
}

#[tokio::test]
async fn one_read_returns_messages_from_both_streams() {
    let broker = MockBroker::new();
    let store = MockDocumentStore::new();
    let consumer = StreamConsumer::new(
        Arc::new(broker.clone()),
        GROUP,
        WORKER,
        &[SECURITY.to_owned(), INGESTION.to_owned()],
        10,
        time::Duration::from_secs(5),
    );
    consumer.register_group(SECURITY).await.unwrap();
    consumer.register_group(INGESTION).await.unwrap();

    broker.add(SECURITY, &[("event_id", "s1"), ("threat_type", "phishing")]);
    broker.add(INGESTION, &[("event_id", "i1"), ("event_type", "login")]);

    let started = tokio::time::Instant::now();
    let records = consumer.read_batch().await.unwrap();

    assert!(started.elapsed() < time::Duration::from_secs(1));
    assert_eq!(records.len(), 2);
    assert!(records.iter().any(|r| r.stream == SECURITY));
    assert!(records.iter().any(|r| r.stream == INGESTION));
    assert_eq!(store.document_count(), 0);
}

#[tokio::test]
async fn events_are_routed_by_category_and_day() {
    let broker = MockBroker::new();
    let store = MockDocumentStore::new();
    let running = Running::start(&broker, &store).await;

    broker.add(
        SECURITY,
        &[
            ("event_id", "s1"),
            ("threat_type", "malware"),
            ("timestamp", "2024-03-05T10:00:00Z"),
        ],
    );
    broker.add(
        INGESTION,
        &[("event_id", "a1"), ("timestamp", "2024-03-05T10:00:00Z")],
    );
    broker.add(
        INGESTION,
        &[("event_id", "a2"), ("timestamp", "last tuesday")],
    );
    settle().await;
    running.stop().await;

    let today = format!("agent-events-{}", Utc::now().format("%Y.%m.%d"));
    assert!(store.document("security-events-2024.03.05", "s1").is_some());
    assert!(store.document("agent-events-2024.03.05", "a1").is_some());
    let late = store.document(&today, "a2").unwrap();
    assert_eq!(late["original_timestamp"], "last tuesday");
}

#[tokio::test]
async fn embedded_json_record_is_unwrapped() {
    let broker = MockBroker::new();
    let store = MockDocumentStore::new();
    let running = Running::start(&broker, &store).await;

    broker.add(
        SECURITY,
        &[(
            "data",
            r#"{"event_id": "blob-1", "threat_type": "ransomware", "timestamp": "2024-03-05T10:00:00Z", "metadata": {"host": "db-2"}}"#,
        )],
    );
    settle().await;
    running.stop().await;

    let document = store
        .document("security-events-2024.03.05", "blob-1")
        .unwrap();
    assert_eq!(document["metadata"], json!({"host": "db-2"}));
    assert_eq!(document.get("data"), None::<&Value>);
}

#[tokio::test]
async fn dot_event_id_is_indexed_under_its_stream_position() {
    let broker = MockBroker::new();
    let store = MockDocumentStore::new();
    let running = Running::start(&broker, &store).await;

    let id = broker.add(
        INGESTION,
        &[("event_id", ".."), ("timestamp", "2024-03-05T10:00:00Z")],
    );
    settle().await;
    running.stop().await;

    let document = store
        .document(
            "agent-events-2024.03.05",
            &format!("auto-{INGESTION}-{id}"),
        )
        .unwrap();
    assert_eq!(document["original_event_id"], "..");
    assert!(broker.pending_ids(INGESTION, GROUP).is_empty());
}

#[tokio::test]
async fn health_key_expires_after_the_worker_stops() {
    let broker = MockBroker::new();
    let store = MockDocumentStore::new();
    let running = Running::start(&broker, &store).await;
    settle().await;

    let published: Value = serde_json::from_str(&broker.get(&health_key(WORKER)).unwrap()).unwrap();
    assert_eq!(published["worker_name"], WORKER);
    assert_eq!(published["status"], "healthy");

    let supervisor = running.stop().await;
    assert!(supervisor.board().latest().is_some());

    // TTL is twice the 50ms reporting interval.
    tokio::time::sleep(time::Duration::from_millis(150)).await;
    assert!(broker.get(&health_key(WORKER)).is_none());
}

#[tokio::test]
async fn lost_connection_restarts_the_cycle() {
    let broker = MockBroker::new();
    let store = MockDocumentStore::new();
    let running = Running::start(&broker, &store).await;
    assert_eq!(broker.connections(), 1);

    broker.fail_reads(1);
    settle().await;
    broker.add(SECURITY, &[("event_id", "after-reconnect")]);
    settle().await;

    running.stop().await;
    assert_eq!(broker.connections(), 2);
    assert_eq!(store.document_count(), 1);
}

#[tokio::test]
async fn unreachable_store_is_fatal_after_the_budget() {
    let broker = MockBroker::new();
    let store = MockDocumentStore::new();
    store.set_unavailable(true);
    let supervisor = Supervisor::new(
        MockConnector::new(broker.clone(), store.clone()),
        settings(),
        RetryPolicy::new(2, time::Duration::from_millis(5)),
        RetryPolicy::new(2, time::Duration::from_millis(5)),
    );

    let result = supervisor.run(CancellationToken::new()).await;

    let Err(SupervisorError::RetriesExhausted { attempts, last }) = result else {
        panic!("expected the supervisor to give up");
    };
    assert_eq!(attempts, 2);
    assert!(last.to_string().contains("opensearch"));
    assert_eq!(store.connections(), 4);
    assert!(broker.ping().await.is_ok());
}
