use std::collections::HashMap;
use std::time;

use async_trait::async_trait;
use event_common::event::StreamRecord;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, AsyncConnectionConfig, Value};
use tracing::debug;

use crate::error::BrokerError;

/// One entry of a consumer group's pending list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    /// Time since the entry was last delivered.
    pub idle: time::Duration,
    pub deliveries: u64,
}

/// The subset of stream commands the worker needs from its message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create `group` on `stream`, starting at the beginning of the stream and creating the
    /// stream if needed. Fails with an error for which `is_busy_group` holds if it exists.
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError>;

    /// Read new messages for `consumer` from all `streams` at once, waiting up to `block`.
    /// A zero `block` does not wait at all.
    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        count: usize,
        block: time::Duration,
    ) -> Result<Vec<StreamRecord>, BrokerError>;

    /// Page through the pending list of `group`, starting at `start` (inclusive).
    /// Restricted to `consumer` when given.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        consumer: Option<&str>,
        start: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, BrokerError>;

    /// Fetch a single message by id, `None` if it was deleted or trimmed.
    async fn fetch(&self, stream: &str, id: &str) -> Result<Option<StreamRecord>, BrokerError>;

    /// Take ownership of `ids` for `consumer` if they have been idle for at least `min_idle`.
    /// Returns the messages actually claimed.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: time::Duration,
        ids: &[String],
    ) -> Result<Vec<StreamRecord>, BrokerError>;

    /// Acknowledge a message. Returns how many messages were removed from the pending list.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<u64, BrokerError>;

    /// Set `key` to `value`, expiring after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: time::Duration)
        -> Result<(), BrokerError>;

    async fn ping(&self) -> Result<(), BrokerError>;
}

/// A Redis Streams backed broker.
///
/// Blocking reads go through their own connection so that other commands, health publishing
/// in particular, never queue behind a `XREADGROUP ... BLOCK`.
pub struct RedisBroker {
    reader: MultiplexedConnection,
    commands: MultiplexedConnection,
}

impl RedisBroker {
    /// Open both connections.
    ///
    /// # Arguments
    ///
    /// * `url`: Redis connection string.
    /// * `response_timeout`: Timeout for regular commands.
    /// * `block`: Longest blocking read that will be issued. Added to the reader's timeout.
    pub async fn connect(
        url: &str,
        response_timeout: time::Duration,
        block: time::Duration,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;

        let command_config = AsyncConnectionConfig::new()
            .set_response_timeout(response_timeout)
            .set_connection_timeout(response_timeout);
        let reader_config = AsyncConnectionConfig::new()
            .set_response_timeout(response_timeout + block)
            .set_connection_timeout(response_timeout);

        let commands = client
            .get_multiplexed_async_connection_with_config(&command_config)
            .await?;
        let reader = client
            .get_multiplexed_async_connection_with_config(&reader_config)
            .await?;

        let broker = Self { reader, commands };
        broker.ping().await?;
        Ok(broker)
    }
}

/// `BLOCK 0` waits forever in Redis, so a zero `block` leaves the option out.
fn read_options(
    group: &str,
    consumer: &str,
    count: usize,
    block: time::Duration,
) -> StreamReadOptions {
    let options = StreamReadOptions::default()
        .group(group, consumer)
        .count(count);
    if block.is_zero() {
        return options;
    }
    let block_ms = usize::try_from(block.as_millis()).unwrap_or(usize::MAX);
    options.block(block_ms)
}

#[async_trait]
impl Broker for RedisBroker {
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut conn = self.commands.clone();
        conn.xgroup_create_mkstream::<_, _, _, ()>(stream, group, "0")
            .await?;
        Ok(())
    }

    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        count: usize,
        block: time::Duration,
    ) -> Result<Vec<StreamRecord>, BrokerError> {
        let mut conn = self.reader.clone();
        let ids = vec![">"; streams.len()];
        let options = read_options(group, consumer, count, block);

        let reply: Option<StreamReadReply> = conn.xread_options(streams, &ids, &options).await?;

        let records = reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| {
                        let stream = key.key;
                        key.ids
                            .into_iter()
                            .map(move |entry| to_record(&stream, entry))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(records)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        consumer: Option<&str>,
        start: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, BrokerError> {
        let mut conn = self.commands.clone();
        let reply: StreamPendingCountReply = match consumer {
            Some(consumer) => {
                conn.xpending_consumer_count(stream, group, start, "+", count, consumer)
                    .await?
            }
            None => conn.xpending_count(stream, group, start, "+", count).await?,
        };

        Ok(reply
            .ids
            .into_iter()
            .map(|entry| PendingEntry {
                id: entry.id,
                consumer: entry.consumer,
                idle: time::Duration::from_millis(
                    u64::try_from(entry.last_delivered_ms).unwrap_or(u64::MAX),
                ),
                deliveries: u64::try_from(entry.times_delivered).unwrap_or(u64::MAX),
            })
            .collect())
    }

    async fn fetch(&self, stream: &str, id: &str) -> Result<Option<StreamRecord>, BrokerError> {
        let mut conn = self.commands.clone();
        let reply: StreamRangeReply = conn.xrange_count(stream, id, id, 1).await?;

        Ok(reply
            .ids
            .into_iter()
            .find(|entry| entry.id == id)
            .map(|entry| to_record(stream, entry)))
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: time::Duration,
        ids: &[String],
    ) -> Result<Vec<StreamRecord>, BrokerError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.commands.clone();
        let min_idle_ms = u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX);
        let reply: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle_ms, ids)
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|entry| to_record(stream, entry))
            .collect())
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<u64, BrokerError> {
        let mut conn = self.commands.clone();
        let acked: i64 = conn.xack(stream, group, &[id]).await?;
        u64::try_from(acked).map_err(|_| BrokerError::UnexpectedReply(acked.to_string()))
    }

    async fn set_ex(
        &self,
        key: &str,
        value: &str,
        ttl: time::Duration,
    ) -> Result<(), BrokerError> {
        let mut conn = self.commands.clone();
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        conn.pset_ex::<_, _, ()>(key, value, millis).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.commands.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(BrokerError::UnexpectedReply(pong));
        }
        Ok(())
    }
}

fn to_record(stream: &str, entry: StreamId) -> StreamRecord {
    record_from_map(stream, &entry.id, entry.map)
}

fn record_from_map(stream: &str, id: &str, map: HashMap<String, Value>) -> StreamRecord {
    let fields: HashMap<String, String> = map
        .into_iter()
        .filter_map(|(name, value)| field_to_string(value).map(|value| (name, value)))
        .collect();

    if fields.is_empty() {
        debug!(stream, id, "stream entry has no readable fields");
    }
    StreamRecord::new(stream, id, fields)
}

/// Field values are strings on the wire. Bytes that are not valid UTF-8 are replaced.
fn field_to_string(value: Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Value::SimpleString(s) => Some(s),
        Value::Int(n) => Some(n.to_string()),
        Value::Double(n) => Some(n.to_string()),
        Value::Boolean(b) => Some(b.to_string()),
        Value::VerbatimString { text, .. } => Some(text),
        _ => None,
    }
}
