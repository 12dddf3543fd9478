use chrono::{DateTime, Utc};
use uuid::Uuid;
use vessel_errors::VesselResult;

use crate::protocol::ProtocolMessage;

/// A message already stored in a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Sender-assigned dedup key.
    pub id: String,
    pub subject: String,
    /// Position in the stream; 0 when the broker did not report one.
    pub sequence: u64,
    pub received: DateTime<Utc>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn decode(&self) -> VesselResult<ProtocolMessage> {
        ProtocolMessage::decode(&self.payload)
    }
}

/// A message about to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub id: String,
    pub subject: String,
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    /// Encode `message` for `subject` with a fresh message id.
    pub fn new(subject: impl Into<String>, message: &ProtocolMessage) -> VesselResult<Self> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            subject: subject.into(),
            payload: message.encode()?,
        })
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}
