#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use vessel_agent::{Inbound, WorkerContext};
use vessel_domain::{
    Acker, Delivery, FileSystem, Invocation, Message, MessageBus, ProtocolMessage,
    ScriptRuntime, StreamConfig, Subjects, EXIT_CANCELLED, EXIT_FAILURE,
};
use vessel_domain::DEFAULT_NAMESPACE;
use vessel_errors::VesselResult;
use vessel_infrastructure::InMemoryBus;

pub const AGENT: &str = "a1";

/// The entrypoint is the script: `inline://exit 3` runs `exit 3`.
pub struct InlineFileSystem;

#[async_trait]
impl FileSystem for InlineFileSystem {
    fn scheme(&self) -> &str {
        "inline"
    }

    async fn read(&self, location: &str) -> VesselResult<Vec<u8>> {
        Ok(location
            .strip_prefix("inline://")
            .unwrap_or(location)
            .as_bytes()
            .to_vec())
    }
}

/// Understands four scripts:
/// `exit <code>`, `echo <n>` (copy n stdin bytes to stdout), `wait`
/// (block until cancelled) and `panic`.
#[derive(Default)]
pub struct ScriptedRuntime {
    exits: Mutex<Vec<i32>>,
}

impl ScriptedRuntime {
    pub fn exits(&self) -> Vec<i32> {
        self.exits.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScriptRuntime for ScriptedRuntime {
    async fn run(&self, invocation: Invocation, cancel: CancellationToken) -> VesselResult<()> {
        let Invocation {
            script,
            mut stdin,
            mut stdout,
            on_exit,
            ..
        } = invocation;
        let script = String::from_utf8_lossy(&script).to_string();
        let mut words = script.split_whitespace();

        let code = match (words.next(), words.next()) {
            (Some("exit"), Some(code)) => code.parse().unwrap_or(EXIT_FAILURE),
            (Some("echo"), Some(len)) => {
                let mut buf = vec![0u8; len.parse().unwrap_or(0)];
                tokio::select! {
                    _ = cancel.cancelled() => EXIT_CANCELLED,
                    read = stdin.read_exact(&mut buf) => {
                        read?;
                        stdout.write_all(&buf).await?;
                        0
                    }
                }
            }
            (Some("wait"), _) => {
                cancel.cancelled().await;
                EXIT_CANCELLED
            }
            (Some("panic"), _) => panic!("scripted runtime blew up"),
            _ => EXIT_FAILURE,
        };

        self.exits.lock().unwrap().push(code);
        drop(stdout);
        on_exit(code);
        Ok(())
    }
}

pub async fn bus_with_agent_stream(subjects: &Subjects) -> Arc<InMemoryBus> {
    vessel_infrastructure::init_test_logging();
    let bus = Arc::new(InMemoryBus::new());
    bus.create_stream(StreamConfig {
        name: subjects.stream_name(AGENT),
        subjects: subjects.stream_subjects(AGENT),
    })
    .await
    .unwrap();
    bus
}

pub fn worker_context(
    bus: Arc<InMemoryBus>,
    runtime: Arc<ScriptedRuntime>,
    subjects: Subjects,
) -> WorkerContext {
    WorkerContext {
        agent_id: AGENT.to_string(),
        bus,
        subjects,
        runtime,
        filesystem: Arc::new(InlineFileSystem),
        stdout_chunk_size: 16,
        final_status_timeout: Duration::from_secs(1),
    }
}

/// Poll until at least `count` messages match `filter`.
pub async fn wait_for(bus: &InMemoryBus, filter: String, count: usize) -> Vec<Message> {
    let stream = Subjects::new(DEFAULT_NAMESPACE).unwrap().stream_name(AGENT);
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let messages = bus
                .fetch(&stream, std::slice::from_ref(&filter), 1, 1000)
                .await
                .unwrap();
            if messages.len() >= count {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {count} messages on {filter}"))
}

struct IgnoreAck;

#[async_trait]
impl Acker for IgnoreAck {
    async fn ack(&self, _sequence: u64) -> VesselResult<()> {
        Ok(())
    }
}

/// A decoded request as the connector would hand it to the dispatcher.
pub fn inbound(subject: String, message: ProtocolMessage) -> Inbound {
    let envelope = Message {
        id: uuid::Uuid::new_v4().to_string(),
        subject,
        sequence: 1,
        received: chrono::Utc::now(),
        payload: message.encode().unwrap(),
    };
    Inbound {
        delivery: Delivery::new(envelope, Arc::new(IgnoreAck)),
        message,
    }
}
