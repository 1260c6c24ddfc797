use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use event_common::mapping::IndexSettings;
use event_common::retry::RetryPolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(default = "redis://localhost:6379")]
    pub redis_url: String,

    #[envconfig(default = "http://localhost:9200")]
    pub opensearch_url: String,

    #[envconfig(default = "redis-opensearch-worker")]
    pub worker_name: NonEmptyString,

    /// Defaults to the worker name.
    pub consumer_group: Option<NonEmptyString>,

    #[envconfig(default = "events:security,events:ingestion")]
    pub streams: StreamList,

    #[envconfig(default = "10")]
    pub batch_size: usize,

    #[envconfig(from = "BATCH_BLOCK_MS", default = "1000")]
    pub batch_block: NonZeroMsDuration,

    #[envconfig(default = "3")]
    pub retry_attempts: u32,

    #[envconfig(from = "RETRY_DELAY_MS", default = "5000")]
    pub retry_delay: EnvMsDuration,

    #[envconfig(default = "3")]
    pub connect_attempts: u32,

    #[envconfig(from = "CONNECT_DELAY_MS", default = "1000")]
    pub connect_delay: EnvMsDuration,

    #[envconfig(from = "HEALTH_CHECK_INTERVAL_MS", default = "30000")]
    pub health_check_interval: NonZeroMsDuration,

    /// 0 disables reclaiming entries from other consumers.
    #[envconfig(from = "PENDING_CLAIM_IDLE_MS", default = "0")]
    pub pending_claim_idle: EnvMsDuration,

    #[envconfig(from = "REDIS_RESPONSE_TIMEOUT_MS", default = "5000")]
    pub redis_response_timeout: NonZeroMsDuration,

    #[envconfig(from = "OPENSEARCH_TIMEOUT_MS", default = "10000")]
    pub opensearch_timeout: NonZeroMsDuration,

    #[envconfig(nested = true)]
    pub index: IndexConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn group(&self) -> &str {
        self.consumer_group
            .as_ref()
            .unwrap_or(&self.worker_name)
            .as_str()
    }

    /// Budget for whole supervisor cycles.
    pub fn cycle_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.retry_delay.0)
    }

    /// Budget for connecting to each dependency within a cycle.
    pub fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.connect_attempts, self.connect_delay.0)
    }

    /// `None` when reclaiming is disabled.
    pub fn claim_idle(&self) -> Option<time::Duration> {
        Some(self.pending_claim_idle.0).filter(|idle| !idle.is_zero())
    }
}

#[derive(Envconfig, Clone)]
pub struct IndexConfig {
    #[envconfig(from = "INDEX_SHARDS", default = "1")]
    pub shards: u32,

    #[envconfig(from = "INDEX_REPLICAS", default = "0")]
    pub replicas: u32,

    #[envconfig(from = "INDEX_REFRESH_INTERVAL", default = "5s")]
    pub refresh_interval: NonEmptyString,
}

impl From<&IndexConfig> for IndexSettings {
    fn from(config: &IndexConfig) -> Self {
        IndexSettings {
            shards: config.shards,
            replicas: config.replicas,
            refresh_interval: config.refresh_interval.0.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// Milliseconds that must be positive, for waits where zero would mean "forever" or a busy loop.
#[derive(Debug, Clone, Copy)]
pub struct NonZeroMsDuration(pub time::Duration);

impl FromStr for NonZeroMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let EnvMsDuration(duration) = s.parse()?;
        if duration.is_zero() {
            return Err(ParseEnvMsDurationError);
        }

        Ok(NonZeroMsDuration(duration))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// Comma separated, non-empty list of stream names. Blank entries and duplicates are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamList(pub Vec<String>);

impl FromStr for StreamList {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut streams: Vec<String> = Vec::new();
        for stream in s.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if !streams.iter().any(|known| known == stream) {
                streams.push(stream.to_owned());
            }
        }

        if streams.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(StreamList(streams))
        }
    }
}
