use std::io::Write;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vessel_domain::{Invocation, ScriptOutput, ScriptRuntime, EXIT_CANCELLED, EXIT_FAILURE};
use vessel_errors::{VesselError, VesselResult};

/// Shell脚本执行器
///
/// Writes the script to a temp file and runs it with the configured
/// interpreter. stdout and stderr of the child both flow into the
/// invocation's stdout.
#[derive(Debug, Clone)]
pub struct ShellRuntime {
    interpreter: String,
}

impl Default for ShellRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellRuntime {
    pub fn new() -> Self {
        Self::with_interpreter("sh")
    }

    pub fn with_interpreter(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

/// Copy the child's stdout and stderr into one writer until both close.
async fn pump_output(
    mut stdout: tokio::process::ChildStdout,
    mut stderr: tokio::process::ChildStderr,
    mut sink: ScriptOutput,
) -> VesselResult<()> {
    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            read = stdout.read(&mut out_buf), if out_open => match read? {
                0 => out_open = false,
                n => sink.write_all(&out_buf[..n]).await?,
            },
            read = stderr.read(&mut err_buf), if err_open => match read? {
                0 => err_open = false,
                n => sink.write_all(&err_buf[..n]).await?,
            },
        }
    }
    sink.flush().await?;
    Ok(())
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(EXIT_FAILURE)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(EXIT_FAILURE)
}

#[async_trait]
impl ScriptRuntime for ShellRuntime {
    async fn run(&self, invocation: Invocation, cancel: CancellationToken) -> VesselResult<()> {
        let Invocation {
            entrypoint,
            script,
            args,
            env,
            mut stdin,
            stdout,
            filesystem: _,
            on_exit,
        } = invocation;

        let mut file = tempfile::Builder::new()
            .prefix("vessel-")
            .suffix(".sh")
            .tempfile()?;
        file.write_all(&script)?;
        file.flush()?;

        info!(
            "执行Shell脚本: entrypoint={}, args={:?}",
            entrypoint, args
        );

        let mut child = Command::new(&self.interpreter)
            .arg(file.path())
            .args(&args)
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VesselError::execution(format!("启动Shell命令失败: {e}")))?;

        let child_stdout = child
            .stdout
            .take()
            .ok_or_else(|| VesselError::execution("无法获取stdout"))?;
        let child_stderr = child
            .stderr
            .take()
            .ok_or_else(|| VesselError::execution("无法获取stderr"))?;
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| VesselError::execution("无法获取stdin"))?;

        let feed = tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut stdin, &mut child_stdin).await {
                debug!("stdin forwarding stopped: {}", e);
            }
        });

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            (status, pumped) = async {
                tokio::join!(child.wait(), pump_output(child_stdout, child_stderr, stdout))
            } => Some((status, pumped)),
        };
        feed.abort();

        let code = match outcome {
            None => {
                if let Err(e) = child.kill().await {
                    warn!("failed to kill cancelled script {}: {}", entrypoint, e);
                }
                EXIT_CANCELLED
            }
            Some((status, pumped)) => {
                if let Err(e) = pumped {
                    warn!("output of {} was cut short: {}", entrypoint, e);
                }
                let status = status
                    .map_err(|e| VesselError::execution(format!("等待进程结束失败: {e}")))?;
                exit_code(status)
            }
        };

        info!("Shell脚本执行完成: entrypoint={}, exit_code={}", entrypoint, code);
        on_exit(code);
        Ok(())
    }
}
