use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use vessel_errors::VesselResult;

use crate::ports::storage::FileSystem;

/// Called by the runtime exactly once with the script's exit code.
pub type ExitHandler = Box<dyn FnOnce(i32) + Send>;

pub type ScriptInput = Box<dyn AsyncRead + Send + Unpin>;
pub type ScriptOutput = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Invocation {
    /// URI the script was resolved from.
    pub entrypoint: String,
    pub script: Vec<u8>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub stdin: ScriptInput,
    pub stdout: ScriptOutput,
    /// Filesystem bindings visible to the script.
    pub filesystem: Arc<dyn FileSystem>,
    pub on_exit: ExitHandler,
}

/// Embedded script execution substrate.
#[async_trait]
pub trait ScriptRuntime: Send + Sync {
    /// Run until the script exits or `cancel` fires. The exit code is
    /// reported through `invocation.on_exit`, not the return value; an `Err`
    /// means the runtime itself failed.
    async fn run(&self, invocation: Invocation, cancel: CancellationToken) -> VesselResult<()>;
}
