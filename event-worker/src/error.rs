use event_common::decode::DecodeError;
use http::StatusCode;
use thiserror::Error;

const BUSY_GROUP: &str = "BUSYGROUP";
const ALREADY_EXISTS: &str = "resource_already_exists_exception";

/// Errors returned by the message broker.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error("consumer group {0} already exists")]
    GroupExists(String),
    #[error("unexpected reply from broker: {0}")]
    UnexpectedReply(String),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

impl BrokerError {
    /// The consumer group we tried to create is already there.
    pub fn is_busy_group(&self) -> bool {
        match self {
            BrokerError::GroupExists(_) => true,
            BrokerError::Redis(error) => error.code() == Some(BUSY_GROUP),
            _ => false,
        }
    }
}

/// Errors returned by the document store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("request to document store failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid document store url {0}")]
    InvalidUrl(String),
    #[error("document store responded with {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("index {0} already exists")]
    AlreadyExists(String),
    #[error("document id {0:?} cannot be used in a request path")]
    InvalidDocumentId(String),
    #[error("document store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_already_exists(&self) -> bool {
        match self {
            StoreError::AlreadyExists(_) => true,
            StoreError::Status { status, body } => {
                *status == StatusCode::BAD_REQUEST && body.contains(ALREADY_EXISTS)
            }
            _ => false,
        }
    }
}

/// Why a single message could not be handled. The message stays pending in every case.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to decode message: {0}")]
    Decode(#[from] DecodeError),
    #[error("failed to index event into {index}: {error}")]
    Index { index: String, error: StoreError },
    #[error("failed to acknowledge message: {0}")]
    Ack(BrokerError),
}

impl ProcessError {
    /// Label used for the failure metric.
    pub fn stage(&self) -> &'static str {
        match self {
            ProcessError::Decode(_) => "decode",
            ProcessError::Index { .. } => "index",
            ProcessError::Ack(_) => "ack",
        }
    }
}

/// Errors that end a consume cycle.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("failed to register consumer group {group} on {stream}: {error}")]
    RegisterGroup {
        stream: String,
        group: String,
        error: BrokerError,
    },
    #[error("failed to recover pending messages of {stream}: {error}")]
    Recovery { stream: String, error: BrokerError },
    #[error("failed to read from streams: {0}")]
    Read(BrokerError),
    #[error("failed to connect to {dependency}: {error}")]
    Connect {
        dependency: &'static str,
        error: String,
    },
}

/// Fatal errors: the process exits non-zero.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("giving up after {attempts} failed cycles, last error: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: ConsumerError,
    },
}
