use thiserror::Error;

#[derive(Debug, Error)]
pub enum VesselError {
    #[error("消息解码错误: {0}")]
    Decode(String),
    #[error("任务未找到: {id}")]
    JobNotFound { id: String },
    #[error("Worker未找到: {id}")]
    WorkerNotFound { id: String },
    #[error("Agent未找到: {id}")]
    AgentNotFound { id: String },
    #[error("消息总线错误: {0}")]
    Transport(String),
    #[error("任务执行错误: {0}")]
    Execution(String),
    #[error("操作已取消")]
    Cancelled,
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type VesselResult<T> = Result<T, VesselError>;

impl VesselError {
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        Self::Decode(msg.into())
    }
    pub fn job_not_found<S: Into<String>>(id: S) -> Self {
        Self::JobNotFound { id: id.into() }
    }
    pub fn worker_not_found<S: Into<String>>(id: S) -> Self {
        Self::WorkerNotFound { id: id.into() }
    }
    pub fn agent_not_found<S: Into<String>>(id: S) -> Self {
        Self::AgentNotFound { id: id.into() }
    }
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }
    pub fn execution<S: Into<String>>(msg: S) -> Self {
        Self::Execution(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            VesselError::JobNotFound { .. }
                | VesselError::WorkerNotFound { .. }
                | VesselError::AgentNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for VesselError {
    fn from(err: serde_json::Error) -> Self {
        VesselError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for VesselError {
    fn from(err: anyhow::Error) -> Self {
        VesselError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for VesselError {
    fn from(err: std::io::Error) -> Self {
        VesselError::Execution(err.to_string())
    }
}
