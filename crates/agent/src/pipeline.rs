//! Bus-to-business-logic pipeline.
//!
//! `consumer -> decoder -> <stage> -> encoder -> publisher`, every hop an
//! `mpsc` channel of capacity one and every stage a task in the same
//! [`TaskGroup`]. The business stage sits between the two halves and is
//! spawned by the caller with the [`Endpoints`] returned from
//! [`Connector::start`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vessel_domain::{
    Consumer, ConsumerConfig, Delivery, MessageBus, OutboundMessage, ProtocolMessage,
};
use vessel_errors::VesselResult;

use crate::group::TaskGroup;

/// A decoded delivery, not yet acknowledged.
#[derive(Debug)]
pub struct Inbound {
    pub delivery: Delivery,
    pub message: ProtocolMessage,
}

/// A message for the publisher. When `ack` is set the inbound delivery is
/// acknowledged only after this message has been published.
#[derive(Debug)]
pub struct Outbound {
    pub subject: String,
    pub message: ProtocolMessage,
    pub ack: Option<Delivery>,
}

#[derive(Debug)]
struct Encoded {
    message: OutboundMessage,
    ack: Option<Delivery>,
}

pub struct Endpoints {
    pub inbound: mpsc::Receiver<Inbound>,
    pub outbound: mpsc::Sender<Outbound>,
}

/// Connects one filtered consumer on a stream to a business stage.
pub struct Connector {
    bus: Arc<dyn MessageBus>,
    stream: String,
    config: ConsumerConfig,
}

impl Connector {
    pub fn new(bus: Arc<dyn MessageBus>, stream: impl Into<String>, config: ConsumerConfig) -> Self {
        Self {
            bus,
            stream: stream.into(),
            config,
        }
    }

    /// Spawn both halves into `group`.
    pub async fn start(self, group: &mut TaskGroup) -> VesselResult<Endpoints> {
        let outbound = spawn_outbound(Arc::clone(&self.bus), group);
        let inbound = self.spawn_inbound(group).await?;
        Ok(Endpoints { inbound, outbound })
    }

    /// Consumer and decoder only.
    pub async fn spawn_inbound(
        self,
        group: &mut TaskGroup,
    ) -> VesselResult<mpsc::Receiver<Inbound>> {
        debug!(
            "Connecting consumer on {} filtered to {:?}",
            self.stream, self.config.filter_subjects
        );
        let consumer = self.bus.consumer(&self.stream, self.config).await?;
        let (delivery_tx, delivery_rx) = mpsc::channel(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(1);
        group.spawn("consumer", consume(consumer, delivery_tx, group.token()));
        group.spawn("decoder", decode(delivery_rx, inbound_tx, group.token()));
        Ok(inbound_rx)
    }
}

/// Encoder and publisher only. They finish once every sender is dropped
/// and the last message is out.
pub fn spawn_outbound(bus: Arc<dyn MessageBus>, group: &mut TaskGroup) -> mpsc::Sender<Outbound> {
    let (outbound_tx, outbound_rx) = mpsc::channel(1);
    let (encoded_tx, encoded_rx) = mpsc::channel(1);
    group.spawn("encoder", encode(outbound_rx, encoded_tx, group.token()));
    group.spawn("publisher", publish(bus, encoded_rx, group.token()));
    outbound_tx
}

/// Send unless cancelled; `false` means the pipeline is going away.
pub async fn forward<T>(tx: &mpsc::Sender<T>, value: T, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(value) => sent.is_ok(),
    }
}

/// Receive unless cancelled.
pub async fn receive<T>(rx: &mut mpsc::Receiver<T>, cancel: &CancellationToken) -> Option<T> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        value = rx.recv() => value,
    }
}

async fn consume(
    mut consumer: Box<dyn Consumer>,
    tx: mpsc::Sender<Delivery>,
    cancel: CancellationToken,
) -> VesselResult<()> {
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = consumer.next() => next?,
        };
        debug!(
            subject = %delivery.message.subject,
            sequence = delivery.message.sequence,
            "Received message"
        );
        if !forward(&tx, delivery, &cancel).await {
            return Ok(());
        }
    }
}

async fn decode(
    mut rx: mpsc::Receiver<Delivery>,
    tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) -> VesselResult<()> {
    while let Some(delivery) = receive(&mut rx, &cancel).await {
        match delivery.message.decode() {
            Ok(message) => {
                if !forward(&tx, Inbound { delivery, message }, &cancel).await {
                    break;
                }
            }
            Err(e) => {
                warn!(
                    subject = %delivery.message.subject,
                    sequence = delivery.message.sequence,
                    "Dropping undecodable message: {}", e
                );
                delivery.ack().await?;
            }
        }
    }
    Ok(())
}

async fn encode(
    mut rx: mpsc::Receiver<Outbound>,
    tx: mpsc::Sender<Encoded>,
    cancel: CancellationToken,
) -> VesselResult<()> {
    while let Some(outbound) = receive(&mut rx, &cancel).await {
        let Outbound {
            subject,
            message,
            ack,
        } = outbound;
        match OutboundMessage::new(subject, &message) {
            Ok(message) => {
                if !forward(&tx, Encoded { message, ack }, &cancel).await {
                    break;
                }
            }
            Err(e) => {
                warn!("Dropping unencodable {}: {}", message.kind(), e);
                if let Some(delivery) = ack {
                    delivery.ack().await?;
                }
            }
        }
    }
    Ok(())
}

async fn publish(
    bus: Arc<dyn MessageBus>,
    mut rx: mpsc::Receiver<Encoded>,
    cancel: CancellationToken,
) -> VesselResult<()> {
    while let Some(Encoded { message, ack }) = receive(&mut rx, &cancel).await {
        let subject = message.subject.clone();
        let sequence = bus.publish(message).await?;
        debug!(subject = %subject, sequence, "Published message");
        if let Some(delivery) = ack {
            delivery.ack().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vessel_domain::DEFAULT_NAMESPACE;
    use std::time::Duration;
    use vessel_domain::{
        ReplyMessage, ReplyPayload, StopWorkerRequest, StreamConfig, Subjects, UpdateWorkerStatus,
        WorkerResponse,
    };
    use vessel_infrastructure::InMemoryBus;

    async fn bus_with_stream(subjects: &Subjects) -> Arc<InMemoryBus> {
        let bus = Arc::new(InMemoryBus::new());
        bus.create_stream(StreamConfig {
            name: subjects.stream_name("a1"),
            subjects: subjects.stream_subjects("a1"),
        })
        .await
        .unwrap();
        bus
    }

    #[tokio::test]
    async fn test_undecodable_message_is_acked_and_skipped() {
        let subjects = Subjects::new(DEFAULT_NAMESPACE).unwrap();
        let bus = bus_with_stream(&subjects).await;
        let status = subjects.status("a1", "w1").unwrap();
        bus.publish(OutboundMessage {
            id: "garbage".to_string(),
            subject: status.clone(),
            payload: b"{not json".to_vec(),
        })
        .await
        .unwrap();
        bus.publish(
            OutboundMessage::new(status.clone(), &UpdateWorkerStatus { exit_code: 0 }.into())
                .unwrap(),
        )
        .await
        .unwrap();

        let root = CancellationToken::new();
        let mut group = TaskGroup::new(&root);
        let mut inbound = Connector::new(
            bus.clone(),
            subjects.stream_name("a1"),
            ConsumerConfig::ordered(vec![status]),
        )
        .spawn_inbound(&mut group)
        .await
        .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.delivery.message.sequence, 2);
        assert_eq!(
            first.message,
            ProtocolMessage::UpdateWorkerStatus(UpdateWorkerStatus { exit_code: 0 })
        );

        root.cancel();
        group.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_is_published_before_ack() {
        let subjects = Subjects::new(DEFAULT_NAMESPACE).unwrap();
        let bus = bus_with_stream(&subjects).await;
        let stop = subjects.stop("a1", "w1").unwrap();
        for _ in 0..2 {
            bus.publish(OutboundMessage::new(stop.clone(), &StopWorkerRequest {}.into()).unwrap())
                .await
                .unwrap();
        }

        let root = CancellationToken::new();
        let mut group = TaskGroup::new(&root);
        let Endpoints {
            mut inbound,
            outbound,
        } = Connector::new(
            bus.clone(),
            subjects.stream_name("a1"),
            ConsumerConfig::ordered(vec![stop]),
        )
        .start(&mut group)
        .await
        .unwrap();

        // max in flight is one: the second delivery waits for the first ack
        let first = inbound.recv().await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(100), inbound.recv())
                .await
                .is_err()
        );

        let correlated = first.delivery.message.id.clone();
        outbound
            .send(Outbound {
                subject: subjects.reply("a1", &correlated).unwrap(),
                message: ReplyMessage {
                    correlated_message_id: correlated.clone(),
                    payload: ReplyPayload::StopWorkerResponse(WorkerResponse::ok()),
                }
                .into(),
                ack: Some(first.delivery),
            })
            .await
            .unwrap();

        let second = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.delivery.message.sequence, 2);

        let replies = bus
            .fetch(
                &subjects.stream_name("a1"),
                &[subjects.reply("a1", &correlated).unwrap()],
                1,
                10,
            )
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);

        root.cancel();
        group.wait().await.unwrap();
    }
}
