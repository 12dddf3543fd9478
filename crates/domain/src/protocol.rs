use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use vessel_errors::{VesselError, VesselResult};

/// 正常退出
pub const EXIT_SUCCESS: i32 = 0;
/// 执行失败时的通用退出码
pub const EXIT_FAILURE: i32 = 1;
/// 被取消的任务 (SIGINT 约定 128 + 2)
pub const EXIT_CANCELLED: i32 = 130;

/// 总线上传输的协议消息
///
/// Every variant is published on exactly one subject template, see
/// [`crate::subjects::Route`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ProtocolMessage {
    StartWorkerRequest(StartWorkerRequest),
    StopWorkerRequest(StopWorkerRequest),
    UpdateWorkerStatus(UpdateWorkerStatus),
    ReplyMessage(ReplyMessage),
    UpdateClientInfo(UpdateClientInfo),
    UpdateWorkerStdio(UpdateWorkerStdio),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartWorkerRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopWorkerRequest {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateWorkerStatus {
    pub exit_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyMessage {
    pub correlated_message_id: String,
    pub payload: ReplyPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ReplyPayload {
    StartWorkerResponse(WorkerResponse),
    StopWorkerResponse(WorkerResponse),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerResponse {
    pub fn ok() -> Self {
        Self { error: None }
    }

    pub fn failed<S: Into<String>>(error: S) -> Self {
        Self {
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateClientInfo {
    pub username: String,
    pub hostname: String,
    pub system: String,
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateWorkerStdio {
    pub data: Vec<u8>,
}

impl ProtocolMessage {
    /// Decode a raw bus payload.
    ///
    /// Unknown variants and malformed bytes both surface as
    /// [`VesselError::Decode`]; callers drop the message and move on.
    pub fn decode(payload: &[u8]) -> VesselResult<Self> {
        serde_json::from_slice(payload).map_err(|e| VesselError::decode(e.to_string()))
    }

    pub fn encode(&self) -> VesselResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::StartWorkerRequest(_) => "StartWorkerRequest",
            ProtocolMessage::StopWorkerRequest(_) => "StopWorkerRequest",
            ProtocolMessage::UpdateWorkerStatus(_) => "UpdateWorkerStatus",
            ProtocolMessage::ReplyMessage(_) => "ReplyMessage",
            ProtocolMessage::UpdateClientInfo(_) => "UpdateClientInfo",
            ProtocolMessage::UpdateWorkerStdio(_) => "UpdateWorkerStdio",
        }
    }
}

impl From<StartWorkerRequest> for ProtocolMessage {
    fn from(value: StartWorkerRequest) -> Self {
        ProtocolMessage::StartWorkerRequest(value)
    }
}

impl From<StopWorkerRequest> for ProtocolMessage {
    fn from(value: StopWorkerRequest) -> Self {
        ProtocolMessage::StopWorkerRequest(value)
    }
}

impl From<UpdateWorkerStatus> for ProtocolMessage {
    fn from(value: UpdateWorkerStatus) -> Self {
        ProtocolMessage::UpdateWorkerStatus(value)
    }
}

impl From<ReplyMessage> for ProtocolMessage {
    fn from(value: ReplyMessage) -> Self {
        ProtocolMessage::ReplyMessage(value)
    }
}

impl From<UpdateClientInfo> for ProtocolMessage {
    fn from(value: UpdateClientInfo) -> Self {
        ProtocolMessage::UpdateClientInfo(value)
    }
}

impl From<UpdateWorkerStdio> for ProtocolMessage {
    fn from(value: UpdateWorkerStdio) -> Self {
        ProtocolMessage::UpdateWorkerStdio(value)
    }
}
