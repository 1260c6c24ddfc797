use std::fmt;
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use event_common::mapping::IndexSettings;
use event_common::metrics::WORKER_STATE;
use event_common::retry::{RetryError, RetryPolicy};
use health::{HealthBoard, WorkerStats};
use http::StatusCode;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::{Broker, RedisBroker};
use crate::config::Config;
use crate::consumer::StreamConsumer;
use crate::error::{BrokerError, ConsumerError, StoreError, SupervisorError};
use crate::reporter::HealthReporter;
use crate::store::{DocumentStore, OpenSearchStore};
use crate::worker::EventProcessor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Connecting,
    Recovering,
    Running,
    ShuttingDown,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Connecting => "connecting",
            WorkerState::Recovering => "recovering",
            WorkerState::Running => "running",
            WorkerState::ShuttingDown => "shutting_down",
            WorkerState::Stopped => "stopped",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            WorkerState::Connecting => 0.0,
            WorkerState::Recovering => 1.0,
            WorkerState::Running => 2.0,
            WorkerState::ShuttingDown => 3.0,
            WorkerState::Stopped => 4.0,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Readiness status: only a worker that is consuming is ready.
pub fn readiness(state: &watch::Receiver<WorkerState>) -> StatusCode {
    if *state.borrow() == WorkerState::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Opens fresh client handles for each supervisor cycle.
#[async_trait]
pub trait Connector: Send + Sync {
    type Broker: Broker + 'static;
    type Store: DocumentStore + 'static;

    async fn connect_broker(&self) -> Result<Self::Broker, BrokerError>;
    async fn connect_store(&self) -> Result<Self::Store, StoreError>;
}

/// Connects to Redis and OpenSearch.
pub struct LiveConnector {
    redis_url: String,
    redis_response_timeout: time::Duration,
    block: time::Duration,
    opensearch_url: String,
    opensearch_timeout: time::Duration,
}

impl LiveConnector {
    pub fn from_config(config: &Config) -> Self {
        Self {
            redis_url: config.redis_url.clone(),
            redis_response_timeout: config.redis_response_timeout.0,
            block: config.batch_block.0,
            opensearch_url: config.opensearch_url.clone(),
            opensearch_timeout: config.opensearch_timeout.0,
        }
    }
}

#[async_trait]
impl Connector for LiveConnector {
    type Broker = RedisBroker;
    type Store = OpenSearchStore;

    async fn connect_broker(&self) -> Result<RedisBroker, BrokerError> {
        RedisBroker::connect(&self.redis_url, self.redis_response_timeout, self.block).await
    }

    async fn connect_store(&self) -> Result<OpenSearchStore, StoreError> {
        OpenSearchStore::connect(&self.opensearch_url, self.opensearch_timeout).await
    }
}

/// Everything a cycle needs besides its connections.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_name: String,
    pub group: String,
    pub streams: Vec<String>,
    pub batch_size: usize,
    pub block: time::Duration,
    pub health_interval: time::Duration,
    pub claim_idle: Option<time::Duration>,
    pub index: IndexSettings,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            worker_name: config.worker_name.as_str().to_owned(),
            group: config.group().to_owned(),
            streams: config.streams.0.clone(),
            batch_size: config.batch_size,
            block: config.batch_block.0,
            health_interval: config.health_check_interval.0,
            claim_idle: config.claim_idle(),
            index: IndexSettings::from(&config.index),
        }
    }
}

struct CycleFailure {
    error: ConsumerError,
    /// The cycle got as far as consuming before it failed.
    reached_running: bool,
}

impl CycleFailure {
    fn before_running(error: ConsumerError) -> Self {
        Self {
            error,
            reached_running: false,
        }
    }
}

fn connect_error<E: std::error::Error + 'static>(
    dependency: &'static str,
    error: RetryError<E>,
) -> ConsumerError {
    ConsumerError::Connect {
        dependency,
        error: error.to_string(),
    }
}

/// Drives the worker through `Connecting -> Recovering -> Running -> ShuttingDown -> Stopped`,
/// restarting failed cycles within the retry budget.
pub struct Supervisor<C> {
    connector: C,
    settings: WorkerSettings,
    cycle_policy: RetryPolicy,
    connect_policy: RetryPolicy,
    stats: Arc<WorkerStats>,
    board: HealthBoard,
    state: watch::Sender<WorkerState>,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(
        connector: C,
        settings: WorkerSettings,
        cycle_policy: RetryPolicy,
        connect_policy: RetryPolicy,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Connecting);
        Self {
            connector,
            settings,
            cycle_policy,
            connect_policy,
            stats: Arc::new(WorkerStats::new()),
            board: HealthBoard::new(),
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn board(&self) -> HealthBoard {
        self.board.clone()
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    fn set_state(&self, state: WorkerState) {
        info!(state = %state, "worker state changed");
        metrics::gauge!(WORKER_STATE).set(state.gauge_value());
        self.state.send_replace(state);
    }

    /// Run cycles until `shutdown` is cancelled. Fails once the retry budget is spent; the
    /// budget starts over every time a cycle reaches `Running`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SupervisorError> {
        let mut attempt = 0;

        while !shutdown.is_cancelled() {
            attempt += 1;

            let failure = match self.run_cycle(&shutdown).await {
                Ok(()) => break,
                Err(failure) => failure,
            };
            if failure.reached_running {
                attempt = 1;
            }

            if !self.cycle_policy.should_retry(attempt) {
                error!(attempt, "worker cycle failed, giving up: {}", failure.error);
                self.set_state(WorkerState::Stopped);
                return Err(SupervisorError::RetriesExhausted {
                    attempts: attempt,
                    last: failure.error,
                });
            }

            warn!(
                attempt,
                max_attempts = self.cycle_policy.max_attempts(),
                "worker cycle failed, retrying in {:?}: {}",
                self.cycle_policy.delay(),
                failure.error
            );
            if !self.cycle_policy.wait(&shutdown).await {
                break;
            }
        }

        self.set_state(WorkerState::Stopped);
        Ok(())
    }

    /// One pass through the lifecycle. Connections are dropped when this returns, whatever
    /// the outcome.
    async fn run_cycle(&self, shutdown: &CancellationToken) -> Result<(), CycleFailure> {
        self.set_state(WorkerState::Connecting);

        let broker = match self
            .connect_policy
            .run(shutdown, "broker connection", || self.connector.connect_broker())
            .await
        {
            Ok(broker) => Arc::new(broker),
            Err(RetryError::Cancelled) => return Ok(()),
            Err(error) => return Err(CycleFailure::before_running(connect_error("redis", error))),
        };
        let store = match self
            .connect_policy
            .run(shutdown, "document store connection", || {
                self.connector.connect_store()
            })
            .await
        {
            Ok(store) => Arc::new(store),
            Err(RetryError::Cancelled) => return Ok(()),
            Err(error) => {
                return Err(CycleFailure::before_running(connect_error(
                    "opensearch",
                    error,
                )))
            }
        };

        let settings = &self.settings;
        let processor = EventProcessor::new(
            broker.clone(),
            store.clone(),
            &settings.worker_name,
            &settings.group,
            &settings.index,
            self.stats.clone(),
        );
        let consumer = StreamConsumer::new(
            broker.clone(),
            &settings.group,
            &settings.worker_name,
            &settings.streams,
            settings.batch_size,
            settings.block,
        )
        .claim_idle(settings.claim_idle);

        self.set_state(WorkerState::Recovering);
        for stream in consumer.streams() {
            consumer
                .register_group(stream)
                .await
                .map_err(CycleFailure::before_running)?;
        }
        for stream in consumer.streams() {
            consumer
                .recover_pending(stream, &processor, shutdown)
                .await
                .map_err(CycleFailure::before_running)?;
        }
        if shutdown.is_cancelled() {
            self.set_state(WorkerState::ShuttingDown);
            return Ok(());
        }

        self.set_state(WorkerState::Running);
        let reporter = HealthReporter::new(
            broker.clone(),
            store.clone(),
            &settings.worker_name,
            settings.health_interval,
            self.stats.clone(),
            self.board.clone(),
        );
        let loops = shutdown.child_token();

        let consume = async {
            let result = consume_loop(&consumer, &processor, &loops).await;
            loops.cancel();
            result
        };
        let (result, ()) = tokio::join!(consume, reporter.run(loops.clone()));

        self.set_state(WorkerState::ShuttingDown);
        result.map_err(|error| CycleFailure {
            error,
            reached_running: true,
        })
    }
}

/// Read and process batches until `token` is cancelled or a read fails.
pub async fn consume_loop<B: Broker, S: DocumentStore>(
    consumer: &StreamConsumer<B>,
    processor: &EventProcessor<B, S>,
    token: &CancellationToken,
) -> Result<(), ConsumerError> {
    loop {
        let records = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            records = consumer.read_batch() => records?,
        };

        if !records.is_empty() {
            processor.handle_batch(&records, token).await;
        }
    }
}
