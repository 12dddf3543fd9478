use std::sync::Arc;

use async_trait::async_trait;
use vessel_errors::VesselResult;

use crate::message::{Message, OutboundMessage};

/// A durable stream and the subjects it captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
}

/// Where a new consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliverPolicy {
    #[default]
    All,
    /// Only messages published after the consumer was created.
    New,
    /// Only the last matching message, then everything after it.
    Last,
    ByStartSequence(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Durable consumers resume after their ack floor when re-created.
    pub durable: Option<String>,
    pub filter_subjects: Vec<String>,
    pub deliver_policy: DeliverPolicy,
    /// Unacknowledged deliveries allowed at once.
    pub max_in_flight: usize,
}

impl ConsumerConfig {
    /// Ordered, one-at-a-time consumer over `filter_subjects`.
    pub fn ordered(filter_subjects: Vec<String>) -> Self {
        Self {
            durable: None,
            filter_subjects,
            deliver_policy: DeliverPolicy::All,
            max_in_flight: 1,
        }
    }

    pub fn durable(mut self, name: impl Into<String>) -> Self {
        self.durable = Some(name.into());
        self
    }

    pub fn deliver(mut self, policy: DeliverPolicy) -> Self {
        self.deliver_policy = policy;
        self
    }
}

#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self, sequence: u64) -> VesselResult<()>;
}

/// One message handed out by a [`Consumer`], acknowledged explicitly.
pub struct Delivery {
    pub message: Message,
    acker: Arc<dyn Acker>,
}

impl Delivery {
    pub fn new(message: Message, acker: Arc<dyn Acker>) -> Self {
        Self { message, acker }
    }

    pub async fn ack(&self) -> VesselResult<()> {
        self.acker.ack(self.message.sequence).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Consumer: Send {
    /// Wait for the next message. Blocks while `max_in_flight` deliveries
    /// are still unacknowledged.
    async fn next(&mut self) -> VesselResult<Delivery>;
}

/// 消息总线抽象接口
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Create a stream; creating an existing stream with the same subjects is a no-op.
    async fn create_stream(&self, config: StreamConfig) -> VesselResult<()>;

    async fn list_streams(&self) -> VesselResult<Vec<String>>;

    /// Append to the stream capturing the subject, returning its sequence.
    async fn publish(&self, message: OutboundMessage) -> VesselResult<u64>;

    /// Read whatever is available now, starting at `start_sequence`, at most
    /// `limit` messages matching any of `filter_subjects`. Never blocks
    /// waiting for new messages.
    async fn fetch(
        &self,
        stream: &str,
        filter_subjects: &[String],
        start_sequence: u64,
        limit: usize,
    ) -> VesselResult<Vec<Message>>;

    async fn consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> VesselResult<Box<dyn Consumer>>;
}
