use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tracing::{debug, info, warn};
use vessel_domain::{
    matches_any, Acker, Consumer, ConsumerConfig, DeliverPolicy, Delivery, Message, MessageBus,
    ObjectStore, OutboundMessage, StreamConfig,
};
use vessel_errors::{VesselError, VesselResult};

/// 内存消息总线实现
///
/// Streams, durable consumers and object buckets live in process memory.
/// Used for embedded deployments and as the substrate for tests.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    state: Arc<RwLock<BusState>>,
    /// Bumped on every append so blocked consumers re-scan.
    published: Arc<watch::Sender<u64>>,
    config: InMemoryBusConfig,
}

#[derive(Debug, Clone)]
pub struct InMemoryBusConfig {
    /// 每个stream的最大消息数（0表示无限制）
    pub max_messages_per_stream: usize,
}

impl Default for InMemoryBusConfig {
    fn default() -> Self {
        Self {
            max_messages_per_stream: 0,
        }
    }
}

#[derive(Debug, Default)]
struct BusState {
    streams: BTreeMap<String, StreamState>,
    buckets: HashMap<String, BTreeMap<String, Vec<u8>>>,
}

#[derive(Debug)]
struct StreamState {
    config: StreamConfig,
    /// Sequence of `messages[i]` is `i + 1`.
    messages: Vec<Message>,
    dedup: HashMap<String, u64>,
    /// Durable consumer name -> ack floor.
    durable_floors: HashMap<String, u64>,
}

impl StreamState {
    fn last_sequence(&self) -> u64 {
        self.messages.len() as u64
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_config(InMemoryBusConfig::default())
    }

    pub fn with_config(config: InMemoryBusConfig) -> Self {
        debug!("Creating in-memory bus with config: {:?}", config);
        let (published, _) = watch::channel(0);
        Self {
            state: Arc::new(RwLock::new(BusState::default())),
            published: Arc::new(published),
            config,
        }
    }

    /// Number of messages stored in a stream.
    pub async fn stream_len(&self, stream: &str) -> VesselResult<usize> {
        let state = self.state.read().await;
        state
            .streams
            .get(stream)
            .map(|s| s.messages.len())
            .ok_or_else(|| stream_not_found(stream))
    }
}

fn stream_not_found(stream: &str) -> VesselError {
    VesselError::transport(format!("stream '{stream}' not found"))
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn create_stream(&self, config: StreamConfig) -> VesselResult<()> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.streams.get_mut(&config.name) {
            if existing.config.subjects != config.subjects {
                debug!("Updating subjects of stream '{}'", config.name);
                existing.config.subjects = config.subjects;
            }
            return Ok(());
        }

        let overlapping = state.streams.values().find(|s| {
            config
                .subjects
                .iter()
                .any(|subject| s.config.subjects.contains(subject))
        });
        if let Some(other) = overlapping {
            return Err(VesselError::transport(format!(
                "subjects of stream '{}' overlap with stream '{}'",
                config.name, other.config.name
            )));
        }

        info!(
            "Created stream '{}' capturing {:?}",
            config.name, config.subjects
        );
        state.streams.insert(
            config.name.clone(),
            StreamState {
                config,
                messages: Vec::new(),
                dedup: HashMap::new(),
                durable_floors: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn list_streams(&self) -> VesselResult<Vec<String>> {
        Ok(self.state.read().await.streams.keys().cloned().collect())
    }

    async fn publish(&self, message: OutboundMessage) -> VesselResult<u64> {
        let sequence = {
            let mut state = self.state.write().await;
            let stream = state
                .streams
                .values_mut()
                .find(|s| matches_any(&s.config.subjects, &message.subject))
                .ok_or_else(|| {
                    VesselError::transport(format!(
                        "no stream captures subject '{}'",
                        message.subject
                    ))
                })?;

            if let Some(sequence) = stream.dedup.get(&message.id) {
                debug!(
                    "Duplicate message {} on '{}', keeping sequence {}",
                    message.id, message.subject, sequence
                );
                return Ok(*sequence);
            }

            if self.config.max_messages_per_stream > 0
                && stream.messages.len() >= self.config.max_messages_per_stream
            {
                warn!(
                    "Stream '{}' is full, rejecting message {}",
                    stream.config.name, message.id
                );
                return Err(VesselError::transport(format!(
                    "stream '{}' reached {} messages",
                    stream.config.name, self.config.max_messages_per_stream
                )));
            }

            let sequence = stream.last_sequence() + 1;
            stream.dedup.insert(message.id.clone(), sequence);
            stream.messages.push(Message {
                id: message.id,
                subject: message.subject,
                sequence,
                received: Utc::now(),
                payload: message.payload,
            });
            sequence
        };

        self.published.send_modify(|count| *count += 1);
        Ok(sequence)
    }

    async fn fetch(
        &self,
        stream: &str,
        filter_subjects: &[String],
        start_sequence: u64,
        limit: usize,
    ) -> VesselResult<Vec<Message>> {
        let state = self.state.read().await;
        let stream = state
            .streams
            .get(stream)
            .ok_or_else(|| stream_not_found(stream))?;
        let skip = start_sequence.saturating_sub(1) as usize;
        Ok(stream
            .messages
            .iter()
            .skip(skip)
            .filter(|m| matches_any(filter_subjects, &m.subject))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> VesselResult<Box<dyn Consumer>> {
        let start = {
            let mut state = self.state.write().await;
            let stream_state = state
                .streams
                .get_mut(stream)
                .ok_or_else(|| stream_not_found(stream))?;

            let resumed = config
                .durable
                .as_ref()
                .and_then(|name| stream_state.durable_floors.get(name))
                .map(|floor| floor + 1);

            let start = match resumed {
                Some(start) => start,
                None => match config.deliver_policy {
                    DeliverPolicy::All => 1,
                    DeliverPolicy::New => stream_state.last_sequence() + 1,
                    DeliverPolicy::Last => stream_state
                        .messages
                        .iter()
                        .rev()
                        .find(|m| matches_any(&config.filter_subjects, &m.subject))
                        .map(|m| m.sequence)
                        .unwrap_or(stream_state.last_sequence() + 1),
                    DeliverPolicy::ByStartSequence(sequence) => sequence.max(1),
                },
            };

            if let Some(name) = &config.durable {
                stream_state
                    .durable_floors
                    .entry(name.clone())
                    .or_insert(start - 1);
            }
            start
        };

        debug!(
            "Consumer on '{}' (durable: {:?}) starts at sequence {}",
            stream, config.durable, start
        );

        let cursor = Arc::new(Mutex::new(Cursor {
            next_sequence: start,
            last_delivered: start - 1,
            in_flight: BTreeSet::new(),
        }));
        Ok(Box::new(InMemoryConsumer {
            stream: stream.to_string(),
            max_in_flight: config.max_in_flight.max(1),
            acker: Arc::new(InMemoryAcker {
                stream: stream.to_string(),
                durable: config.durable.clone(),
                cursor: Arc::clone(&cursor),
                state: Arc::clone(&self.state),
                acked: Arc::new(Notify::new()),
            }),
            filter_subjects: config.filter_subjects,
            cursor,
            state: Arc::clone(&self.state),
            published: self.published.subscribe(),
        }))
    }
}

#[derive(Debug)]
struct Cursor {
    next_sequence: u64,
    last_delivered: u64,
    in_flight: BTreeSet<u64>,
}

struct InMemoryConsumer {
    stream: String,
    filter_subjects: Vec<String>,
    max_in_flight: usize,
    cursor: Arc<Mutex<Cursor>>,
    state: Arc<RwLock<BusState>>,
    published: watch::Receiver<u64>,
    acker: Arc<InMemoryAcker>,
}

impl InMemoryConsumer {
    async fn try_next(&self) -> VesselResult<Option<Message>> {
        let mut cursor = self.cursor.lock().await;
        if cursor.in_flight.len() >= self.max_in_flight {
            return Ok(None);
        }
        let state = self.state.read().await;
        let stream = state
            .streams
            .get(&self.stream)
            .ok_or_else(|| stream_not_found(&self.stream))?;

        let skip = cursor.next_sequence.saturating_sub(1) as usize;
        let found = stream
            .messages
            .iter()
            .skip(skip)
            .find(|m| matches_any(&self.filter_subjects, &m.subject))
            .cloned();

        match found {
            Some(message) => {
                cursor.next_sequence = message.sequence + 1;
                cursor.last_delivered = message.sequence;
                cursor.in_flight.insert(message.sequence);
                Ok(Some(message))
            }
            None => {
                cursor.next_sequence = stream.last_sequence() + 1;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    async fn next(&mut self) -> VesselResult<Delivery> {
        loop {
            self.published.borrow_and_update();
            let acked = self.acker.acked.notified();
            if let Some(message) = self.try_next().await? {
                let acker: Arc<dyn Acker> = self.acker.clone();
                return Ok(Delivery::new(message, acker));
            }
            tokio::select! {
                changed = self.published.changed() => {
                    changed.map_err(|_| VesselError::transport("bus closed"))?;
                }
                _ = acked => {}
            }
        }
    }
}

struct InMemoryAcker {
    stream: String,
    durable: Option<String>,
    cursor: Arc<Mutex<Cursor>>,
    state: Arc<RwLock<BusState>>,
    acked: Arc<Notify>,
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn ack(&self, sequence: u64) -> VesselResult<()> {
        let floor = {
            let mut cursor = self.cursor.lock().await;
            if !cursor.in_flight.remove(&sequence) {
                // 重复确认
                return Ok(());
            }
            match cursor.in_flight.first() {
                Some(oldest) => oldest - 1,
                None => cursor.last_delivered,
            }
        };

        if let Some(name) = &self.durable {
            let mut state = self.state.write().await;
            if let Some(stream) = state.streams.get_mut(&self.stream) {
                let entry = stream.durable_floors.entry(name.clone()).or_insert(0);
                *entry = (*entry).max(floor);
            }
        }

        self.acked.notify_one();
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for InMemoryBus {
    async fn put(&self, bucket: &str, path: &str, data: Vec<u8>) -> VesselResult<()> {
        let mut state = self.state.write().await;
        state
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(path.to_string(), data);
        Ok(())
    }

    async fn get(&self, bucket: &str, path: &str) -> VesselResult<Option<Vec<u8>>> {
        let state = self.state.read().await;
        Ok(state
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(path))
            .cloned())
    }

    async fn delete(&self, bucket: &str, path: &str) -> VesselResult<bool> {
        let mut state = self.state.write().await;
        Ok(state
            .buckets
            .get_mut(bucket)
            .map(|objects| objects.remove(path).is_some())
            .unwrap_or(false))
    }

    async fn list(&self, bucket: &str) -> VesselResult<Vec<String>> {
        let state = self.state.read().await;
        Ok(state
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default())
    }
}
