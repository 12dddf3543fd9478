pub mod config;
pub mod connection_manager;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::streams::{StreamId, StreamRangeReply};
use redis::Script;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};
use vessel_domain::{
    matches_any, Acker, Consumer, ConsumerConfig, DeliverPolicy, Delivery, Message, MessageBus,
    ObjectStore, OutboundMessage, StreamConfig,
};
use vessel_errors::{VesselError, VesselResult};

pub use config::RedisBusConfig;
pub use connection_manager::RedisConnectionManager;

/// Appends atomically: dedup check, sequence allocation, XADD with `<seq>-0`.
const PUBLISH_SCRIPT: &str = r#"
local existing = redis.call('HGET', KEYS[3], ARGV[1])
if existing then
  return tonumber(existing)
end
local seq = redis.call('INCR', KEYS[2])
redis.call('XADD', KEYS[1], seq .. '-0',
  'id', ARGV[1], 'subject', ARGV[2], 'received', ARGV[3], 'payload', ARGV[4])
redis.call('HSET', KEYS[3], ARGV[1], seq)
return seq
"#;

/// Entries pulled per XRANGE round trip.
const READ_BATCH: usize = 128;

/// Message bus on Redis streams.
///
/// Each bus stream is a Redis stream whose entry ids are `<sequence>-0`.
/// Stream definitions live in one hash so every process routes the same
/// way; durable consumer floors and object buckets are hashes as well.
pub struct RedisBus {
    connection: Arc<RedisConnectionManager>,
    streams: RwLock<Vec<StreamConfig>>,
    publish_script: Script,
}

impl RedisBus {
    pub async fn new(config: RedisBusConfig) -> VesselResult<Self> {
        info!("Initializing Redis bus at {}", config.url);
        let connection = RedisConnectionManager::new(config).await?;
        let bus = Self {
            connection: Arc::new(connection),
            streams: RwLock::new(Vec::new()),
            publish_script: Script::new(PUBLISH_SCRIPT),
        };
        bus.reload_streams().await?;
        Ok(bus)
    }

    fn streams_key(&self) -> String {
        self.connection.key(&["streams"])
    }

    fn stream_key(&self, stream: &str) -> String {
        self.connection.key(&["stream", stream])
    }

    async fn reload_streams(&self) -> VesselResult<Vec<StreamConfig>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(self.streams_key());
        let raw: HashMap<String, String> = self.connection.execute_command(&mut cmd).await?;

        let mut configs = Vec::with_capacity(raw.len());
        for (name, subjects) in raw {
            match serde_json::from_str::<Vec<String>>(&subjects) {
                Ok(subjects) => configs.push(StreamConfig { name, subjects }),
                Err(e) => warn!("Ignoring stream '{}' with unreadable subjects: {}", name, e),
            }
        }
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        *self.streams.write().await = configs.clone();
        Ok(configs)
    }

    async fn stream_for(&self, subject: &str) -> VesselResult<String> {
        let find = |configs: &[StreamConfig]| {
            configs
                .iter()
                .find(|c| matches_any(&c.subjects, subject))
                .map(|c| c.name.clone())
        };
        if let Some(name) = find(&self.streams.read().await) {
            return Ok(name);
        }
        // another process may have created the stream since the last reload
        let configs = self.reload_streams().await?;
        find(&configs).ok_or_else(|| {
            VesselError::transport(format!("no stream captures subject '{subject}'"))
        })
    }

    async fn last_sequence(&self, stream: &str) -> VesselResult<u64> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(self.connection.key(&["seq", stream]));
        let last: Option<u64> = self.connection.execute_command(&mut cmd).await?;
        Ok(last.unwrap_or(0))
    }

    async fn ensure_stream(&self, stream: &str) -> VesselResult<()> {
        let mut cmd = redis::cmd("HEXISTS");
        cmd.arg(self.streams_key()).arg(stream);
        let exists: bool = self.connection.execute_command(&mut cmd).await?;
        if exists {
            Ok(())
        } else {
            Err(VesselError::transport(format!("stream '{stream}' not found")))
        }
    }
}

async fn read_range(
    connection: &RedisConnectionManager,
    stream_key: &str,
    start_sequence: u64,
    count: usize,
) -> VesselResult<Vec<Message>> {
    let mut cmd = redis::cmd("XRANGE");
    cmd.arg(stream_key)
        .arg(format!("{}-0", start_sequence.max(1)))
        .arg("+")
        .arg("COUNT")
        .arg(count);
    let reply: StreamRangeReply = connection.execute_command(&mut cmd).await?;
    Ok(reply.ids.iter().filter_map(parse_entry).collect())
}

fn parse_entry(entry: &StreamId) -> Option<Message> {
    let sequence = entry
        .id
        .split_once('-')
        .and_then(|(seq, _)| seq.parse::<u64>().ok());
    let parsed = (|| {
        let received_ms: i64 = entry.get("received")?;
        Some(Message {
            id: entry.get("id")?,
            subject: entry.get("subject")?,
            sequence: sequence?,
            received: DateTime::<Utc>::from_timestamp_millis(received_ms)?,
            payload: entry.get("payload")?,
        })
    })();
    if parsed.is_none() {
        warn!("Skipping malformed stream entry {}", entry.id);
    }
    parsed
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn create_stream(&self, config: StreamConfig) -> VesselResult<()> {
        let subjects = serde_json::to_string(&config.subjects)?;
        let mut cmd = redis::cmd("HSET");
        cmd.arg(self.streams_key()).arg(&config.name).arg(subjects);
        let _: i64 = self.connection.execute_command(&mut cmd).await?;
        self.reload_streams().await?;
        info!(
            "Created stream '{}' capturing {:?}",
            config.name, config.subjects
        );
        Ok(())
    }

    async fn list_streams(&self) -> VesselResult<Vec<String>> {
        Ok(self
            .reload_streams()
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect())
    }

    async fn publish(&self, message: OutboundMessage) -> VesselResult<u64> {
        let stream = self.stream_for(&message.subject).await?;
        let mut conn = self.connection.connection();
        let sequence: u64 = self
            .publish_script
            .key(self.stream_key(&stream))
            .key(self.connection.key(&["seq", &stream]))
            .key(self.connection.key(&["dedup", &stream]))
            .arg(&message.id)
            .arg(&message.subject)
            .arg(Utc::now().timestamp_millis())
            .arg(message.payload)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| VesselError::transport(format!("publish to '{stream}' failed: {e}")))?;
        debug!(
            "Published {} to '{}' at sequence {}",
            message.id, message.subject, sequence
        );
        Ok(sequence)
    }

    async fn fetch(
        &self,
        stream: &str,
        filter_subjects: &[String],
        start_sequence: u64,
        limit: usize,
    ) -> VesselResult<Vec<Message>> {
        self.ensure_stream(stream).await?;
        let key = self.stream_key(stream);
        let mut next = start_sequence.max(1);
        let mut found = Vec::new();
        while found.len() < limit {
            let batch = read_range(&self.connection, &key, next, READ_BATCH).await?;
            let Some(last) = batch.last() else { break };
            next = last.sequence + 1;
            let exhausted = batch.len() < READ_BATCH;
            found.extend(
                batch
                    .into_iter()
                    .filter(|m| matches_any(filter_subjects, &m.subject)),
            );
            if exhausted {
                break;
            }
        }
        found.truncate(limit);
        Ok(found)
    }

    async fn consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> VesselResult<Box<dyn Consumer>> {
        self.ensure_stream(stream).await?;
        let floors_key = self.connection.key(&["consumer", stream]);

        let resumed = match &config.durable {
            Some(name) => {
                let mut cmd = redis::cmd("HGET");
                cmd.arg(&floors_key).arg(name);
                let floor: Option<u64> = self.connection.execute_command(&mut cmd).await?;
                floor.map(|f| f + 1)
            }
            None => None,
        };

        let start = match resumed {
            Some(start) => start,
            None => match config.deliver_policy {
                DeliverPolicy::All => 1,
                DeliverPolicy::New => self.last_sequence(stream).await? + 1,
                DeliverPolicy::Last => {
                    let all = self
                        .fetch(stream, &config.filter_subjects, 1, usize::MAX)
                        .await?;
                    match all.last() {
                        Some(last) => last.sequence,
                        None => self.last_sequence(stream).await? + 1,
                    }
                }
                DeliverPolicy::ByStartSequence(sequence) => sequence.max(1),
            },
        };

        debug!(
            "Redis consumer on '{}' (durable: {:?}) starts at sequence {}",
            stream, config.durable, start
        );

        let cursor = Arc::new(Mutex::new(RedisCursor {
            next_sequence: start,
            last_delivered: start - 1,
            in_flight: BTreeSet::new(),
        }));
        let acker = Arc::new(RedisAcker {
            connection: Arc::clone(&self.connection),
            floors_key,
            durable: config.durable.clone(),
            cursor: Arc::clone(&cursor),
            acked: Notify::new(),
        });
        Ok(Box::new(RedisConsumer {
            connection: Arc::clone(&self.connection),
            stream_key: self.stream_key(stream),
            filter_subjects: config.filter_subjects,
            max_in_flight: config.max_in_flight.max(1),
            cursor,
            acker,
        }))
    }
}

struct RedisCursor {
    next_sequence: u64,
    last_delivered: u64,
    in_flight: BTreeSet<u64>,
}

struct RedisConsumer {
    connection: Arc<RedisConnectionManager>,
    stream_key: String,
    filter_subjects: Vec<String>,
    max_in_flight: usize,
    cursor: Arc<Mutex<RedisCursor>>,
    acker: Arc<RedisAcker>,
}

impl RedisConsumer {
    async fn try_next(&self) -> VesselResult<Option<Message>> {
        let mut cursor = self.cursor.lock().await;
        if cursor.in_flight.len() >= self.max_in_flight {
            return Ok(None);
        }
        loop {
            let batch = read_range(
                &self.connection,
                &self.stream_key,
                cursor.next_sequence,
                READ_BATCH,
            )
            .await?;
            let Some(last) = batch.last().map(|m| m.sequence) else {
                return Ok(None);
            };
            let exhausted = batch.len() < READ_BATCH;
            if let Some(message) = batch
                .into_iter()
                .find(|m| matches_any(&self.filter_subjects, &m.subject))
            {
                cursor.next_sequence = message.sequence + 1;
                cursor.last_delivered = message.sequence;
                cursor.in_flight.insert(message.sequence);
                return Ok(Some(message));
            }
            cursor.next_sequence = last + 1;
            if exhausted {
                return Ok(None);
            }
        }
    }
}

#[async_trait]
impl Consumer for RedisConsumer {
    async fn next(&mut self) -> VesselResult<Delivery> {
        loop {
            let acked = self.acker.acked.notified();
            if let Some(message) = self.try_next().await? {
                let acker: Arc<dyn Acker> = self.acker.clone();
                return Ok(Delivery::new(message, acker));
            }
            tokio::select! {
                _ = tokio::time::sleep(self.connection.poll_interval()) => {}
                _ = acked => {}
            }
        }
    }
}

struct RedisAcker {
    connection: Arc<RedisConnectionManager>,
    floors_key: String,
    durable: Option<String>,
    cursor: Arc<Mutex<RedisCursor>>,
    acked: Notify,
}

#[async_trait]
impl Acker for RedisAcker {
    async fn ack(&self, sequence: u64) -> VesselResult<()> {
        let floor = {
            let mut cursor = self.cursor.lock().await;
            if !cursor.in_flight.remove(&sequence) {
                return Ok(());
            }
            match cursor.in_flight.first() {
                Some(oldest) => oldest - 1,
                None => cursor.last_delivered,
            }
        };

        if let Some(name) = &self.durable {
            let mut cmd = redis::cmd("HSET");
            cmd.arg(&self.floors_key).arg(name).arg(floor);
            let _: i64 = self.connection.execute_command(&mut cmd).await?;
        }

        self.acked.notify_one();
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for RedisBus {
    async fn put(&self, bucket: &str, path: &str, data: Vec<u8>) -> VesselResult<()> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(self.connection.key(&["objects", bucket]))
            .arg(path)
            .arg(data);
        let _: i64 = self.connection.execute_command(&mut cmd).await?;
        Ok(())
    }

    async fn get(&self, bucket: &str, path: &str) -> VesselResult<Option<Vec<u8>>> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(self.connection.key(&["objects", bucket])).arg(path);
        self.connection.execute_command(&mut cmd).await
    }

    async fn delete(&self, bucket: &str, path: &str) -> VesselResult<bool> {
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(self.connection.key(&["objects", bucket])).arg(path);
        let removed: i64 = self.connection.execute_command(&mut cmd).await?;
        Ok(removed > 0)
    }

    async fn list(&self, bucket: &str) -> VesselResult<Vec<String>> {
        let mut cmd = redis::cmd("HKEYS");
        cmd.arg(self.connection.key(&["objects", bucket]));
        let mut paths: Vec<String> = self.connection.execute_command(&mut cmd).await?;
        paths.sort();
        Ok(paths)
    }
}
