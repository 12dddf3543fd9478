use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vessel_domain::{
    FileSystem, Invocation, MessageBus, OutboundMessage, ScriptInput, ScriptOutput,
    ScriptRuntime, StartWorkerRequest, Subjects, UpdateWorkerStatus, EXIT_CANCELLED,
    EXIT_FAILURE,
};

use crate::group::{detached_token, TaskGroup};
use crate::stdio;

const STDIN_PIPE_CAPACITY: usize = 64 * 1024;

/// Lifecycle notifications from workers to their dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
///
/// `generation` tells apart workers that reuse an id after a cancel.
pub enum WorkerEvent {
    Started { id: String, generation: u64 },
    Stopped { id: String, generation: u64 },
}

/// Everything a worker needs besides its own request.
#[derive(Clone)]
pub struct WorkerContext {
    pub agent_id: String,
    pub bus: Arc<dyn MessageBus>,
    pub subjects: Subjects,
    pub runtime: Arc<dyn ScriptRuntime>,
    /// Resolves the job's entrypoint URI.
    pub filesystem: Arc<dyn FileSystem>,
    pub stdout_chunk_size: usize,
    pub final_status_timeout: Duration,
}

/// One job's execution engine.
#[derive(Clone)]
pub struct Worker {
    id: String,
    generation: u64,
    request: StartWorkerRequest,
    ctx: WorkerContext,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        generation: u64,
        request: StartWorkerRequest,
        ctx: WorkerContext,
    ) -> Self {
        Self {
            id: id.into(),
            generation,
            request,
            ctx,
        }
    }

    /// Run the job to completion, publish its exit status and report
    /// `Stopped`. The `Stopped` event is sent even when `cancel` fired or
    /// the job body panicked.
    pub async fn run(self, cancel: CancellationToken, events: mpsc::Sender<WorkerEvent>) {
        let id = self.id.clone();
        let generation = self.generation;
        if events
            .send(WorkerEvent::Started {
                id: id.clone(),
                generation,
            })
            .await
            .is_err()
        {
            debug!(worker_id = %id, "dispatcher gone before worker start");
        }

        let body = self.clone();
        let token = cancel.clone();
        let joined = tokio::spawn(async move { body.execute(&token).await }).await;
        if let Err(e) = joined {
            error!(worker_id = %id, "Worker任务异常退出: {}", e);
            self.publish_status(EXIT_FAILURE).await;
        }

        if events
            .send(WorkerEvent::Stopped {
                id: id.clone(),
                generation,
            })
            .await
            .is_err()
        {
            warn!(worker_id = %id, "dispatcher gone before worker stop");
        }
    }

    async fn execute(&self, cancel: &CancellationToken) {
        let agent = &self.ctx.agent_id;
        let stream = self.ctx.subjects.stream_name(agent);

        let (stdin_process, stdin_bridge) = tokio::io::duplex(STDIN_PIPE_CAPACITY);
        let (stdout_process, stdout_bridge) = tokio::io::duplex(self.ctx.stdout_chunk_size.max(1));

        let mut reader = TaskGroup::new(cancel);
        match self.ctx.subjects.stdin(agent, &self.id) {
            Ok(subject) => {
                if let Err(e) = stdio::spawn_reader(
                    &mut reader,
                    Arc::clone(&self.ctx.bus),
                    &stream,
                    &subject,
                    stdin_bridge,
                )
                .await
                {
                    warn!(worker_id = %self.id, "stdin bridge not started: {}", e);
                }
            }
            Err(e) => {
                drop(stdin_bridge);
                warn!(worker_id = %self.id, "stdin bridge not started: {}", e);
            }
        }

        let mut writer = TaskGroup::new(cancel);
        match self.ctx.subjects.stdout(agent, &self.id) {
            Ok(subject) => stdio::spawn_writer(
                &mut writer,
                Arc::clone(&self.ctx.bus),
                subject,
                stdout_bridge,
                self.ctx.stdout_chunk_size,
            ),
            Err(e) => {
                drop(stdout_bridge);
                warn!(worker_id = %self.id, "stdout bridge not started: {}", e);
            }
        }

        let exit_code = self
            .run_script(Box::new(stdin_process), Box::new(stdout_process), cancel)
            .await;
        info!(worker_id = %self.id, exit_code, "Worker script finished");

        // the stdout tail reaches the bus before the terminal status
        match tokio::time::timeout(self.ctx.final_status_timeout, writer.wait()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(worker_id = %self.id, "stdout bridge stopped with error: {}", e),
            Err(_) => warn!(worker_id = %self.id, "stdout bridge did not drain, dropping it"),
        }

        self.publish_status(exit_code).await;

        // closes the stdin pipe
        reader.cancel();
        if let Err(e) = reader.wait().await {
            warn!(worker_id = %self.id, "stdin bridge stopped with error: {}", e);
        }
    }

    async fn run_script(
        &self,
        stdin: ScriptInput,
        stdout: ScriptOutput,
        cancel: &CancellationToken,
    ) -> i32 {
        let command = &self.request.command;
        let script = tokio::select! {
            _ = cancel.cancelled() => return EXIT_CANCELLED,
            script = self.ctx.filesystem.read(command) => match script {
                Ok(script) => script,
                Err(e) => {
                    error!(worker_id = %self.id, "无法加载脚本 {}: {}", command, e);
                    return EXIT_FAILURE;
                }
            },
        };

        let (exit_tx, exit_rx) = oneshot::channel();
        let invocation = Invocation {
            entrypoint: command.clone(),
            script,
            args: self.request.args.clone(),
            env: self.request.env.clone(),
            stdin,
            stdout,
            filesystem: Arc::clone(&self.ctx.filesystem),
            on_exit: Box::new(move |code| {
                let _ = exit_tx.send(code);
            }),
        };

        let result = self.ctx.runtime.run(invocation, cancel.child_token()).await;
        match (result, exit_rx.await) {
            (Err(e), Ok(code)) => {
                warn!(worker_id = %self.id, "runtime error after exit {}: {}", code, e);
                code
            }
            (Ok(()), Ok(code)) => code,
            (_, Err(_)) if cancel.is_cancelled() => EXIT_CANCELLED,
            (Err(e), Err(_)) => {
                error!(worker_id = %self.id, "任务执行失败: {}", e);
                EXIT_FAILURE
            }
            (Ok(()), Err(_)) => {
                warn!(worker_id = %self.id, "runtime returned without an exit code");
                EXIT_FAILURE
            }
        }
    }

    /// Best effort: bounded by its own timeout and independent of the
    /// worker's cancellation.
    async fn publish_status(&self, exit_code: i32) {
        let message = self
            .ctx
            .subjects
            .status(&self.ctx.agent_id, &self.id)
            .and_then(|subject| {
                OutboundMessage::new(subject, &UpdateWorkerStatus { exit_code }.into())
            });
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                error!(worker_id = %self.id, "无法构造状态消息: {}", e);
                return;
            }
        };

        let deadline = detached_token(self.ctx.final_status_timeout);
        tokio::select! {
            _ = deadline.cancelled() => {
                warn!(worker_id = %self.id, exit_code, "final status not delivered in time");
            }
            published = self.ctx.bus.publish(message) => match published {
                Ok(sequence) => debug!(worker_id = %self.id, exit_code, sequence, "Published final status"),
                Err(e) => warn!(worker_id = %self.id, exit_code, "final status not delivered: {}", e),
            },
        }
        deadline.cancel();
    }
}
