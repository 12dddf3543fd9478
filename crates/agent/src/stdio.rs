//! Bridges between a worker's pipes and its stdio subjects.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vessel_domain::{ConsumerConfig, MessageBus, ProtocolMessage, UpdateWorkerStdio};
use vessel_errors::VesselResult;

use crate::group::TaskGroup;
use crate::pipeline::{forward, receive, spawn_outbound, Connector, Inbound, Outbound};

/// Bus to process stdin: `consumer -> decoder -> pipe writer`.
pub async fn spawn_reader<W>(
    group: &mut TaskGroup,
    bus: Arc<dyn MessageBus>,
    stream: &str,
    stdin_subject: &str,
    pipe: W,
) -> VesselResult<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let inbound = Connector::new(
        bus,
        stream,
        ConsumerConfig::ordered(vec![stdin_subject.to_string()]),
    )
    .spawn_inbound(group)
    .await?;
    group.spawn("stdin-writer", write_pipe(inbound, pipe, group.token()));
    Ok(())
}

/// Process stdout to bus: `pipe reader -> encoder -> publisher`.
pub fn spawn_writer<R>(
    group: &mut TaskGroup,
    bus: Arc<dyn MessageBus>,
    stdout_subject: String,
    pipe: R,
    chunk_size: usize,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let outbound = spawn_outbound(bus, group);
    group.spawn(
        "stdout-reader",
        read_pipe(pipe, stdout_subject, chunk_size, outbound, group.token()),
    );
}

async fn write_pipe<W>(
    mut inbound: mpsc::Receiver<Inbound>,
    mut pipe: W,
    cancel: CancellationToken,
) -> VesselResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(Inbound { delivery, message }) = receive(&mut inbound, &cancel).await {
        match message {
            ProtocolMessage::UpdateWorkerStdio(UpdateWorkerStdio { data }) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    written = async {
                        pipe.write_all(&data).await?;
                        pipe.flush().await
                    } => written?,
                }
            }
            other => debug!("Ignoring {} on stdin subject", other.kind()),
        }
        delivery.ack().await?;
    }
    Ok(())
}

async fn read_pipe<R>(
    mut pipe: R,
    subject: String,
    chunk_size: usize,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
) -> VesselResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = pipe.read(&mut buf) => read?,
        };
        if read == 0 {
            return Ok(());
        }
        let chunk = Outbound {
            subject: subject.clone(),
            message: UpdateWorkerStdio {
                data: buf[..read].to_vec(),
            }
            .into(),
            ack: None,
        };
        if !forward(&outbound, chunk, &cancel).await {
            return Ok(());
        }
    }
}
