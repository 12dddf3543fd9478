use std::time::Duration;

use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;
use tokio::time::timeout;
use vessel_domain::{
    Consumer, ConsumerConfig, MessageBus, ObjectStore, OutboundMessage, StartWorkerRequest,
    StreamConfig, UpdateWorkerStatus,
};
use vessel_infrastructure::{RedisBus, RedisBusConfig};

struct RedisSetup {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    url: String,
}

impl RedisSetup {
    async fn new() -> Self {
        let container = Redis::default().with_tag("7-alpine").start().await.unwrap();
        let port = container.get_host_port_ipv4(6379).await.unwrap();
        Self {
            container,
            url: format!("redis://localhost:{port}"),
        }
    }

    async fn bus(&self, prefix: &str) -> RedisBus {
        let config = RedisBusConfig::from_url(&self.url, prefix).unwrap();
        RedisBus::new(config).await.unwrap()
    }
}

fn stream() -> StreamConfig {
    StreamConfig {
        name: "AGENT_a1".to_string(),
        subjects: vec!["vessel.worker.*.a1.*".to_string()],
    }
}

#[tokio::test]
#[ignore] // 需要Docker
async fn test_publish_dedup_and_fetch() {
    let setup = RedisSetup::new().await;
    let bus = setup.bus("it-fetch").await;
    bus.create_stream(stream()).await.unwrap();

    let status = UpdateWorkerStatus { exit_code: 0 }.into();
    let first = OutboundMessage::new("vessel.worker.status.a1.w1", &status)
        .unwrap()
        .with_id("m-1");
    let seq = bus.publish(first.clone()).await.unwrap();
    assert_eq!(bus.publish(first).await.unwrap(), seq);

    let start = StartWorkerRequest {
        command: "file:///bin/true".to_string(),
        args: vec![],
        env: Default::default(),
    }
    .into();
    bus.publish(OutboundMessage::new("vessel.worker.start.a1.w2", &start).unwrap())
        .await
        .unwrap();

    let all = bus
        .fetch("AGENT_a1", &["vessel.worker.*.a1.*".to_string()], 1, 100)
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].sequence, seq);

    let starts = bus
        .fetch("AGENT_a1", &["vessel.worker.start.a1.*".to_string()], 1, 100)
        .await
        .unwrap();
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].subject, "vessel.worker.start.a1.w2");

    // 另一个进程看到相同的流定义
    let other = setup.bus("it-fetch").await;
    assert_eq!(other.list_streams().await.unwrap(), vec!["AGENT_a1"]);
}

#[tokio::test]
#[ignore] // 需要Docker
async fn test_durable_consumer_resumes_after_ack_floor() {
    let setup = RedisSetup::new().await;
    let bus = setup.bus("it-durable").await;
    bus.create_stream(stream()).await.unwrap();

    for code in 0..3 {
        let status = UpdateWorkerStatus { exit_code: code }.into();
        bus.publish(OutboundMessage::new("vessel.worker.status.a1.w1", &status).unwrap())
            .await
            .unwrap();
    }

    let filters = vec!["vessel.worker.status.a1.*".to_string()];
    let mut consumer = bus
        .consumer(
            "AGENT_a1",
            ConsumerConfig::ordered(filters.clone()).durable("d1"),
        )
        .await
        .unwrap();
    let delivery = timeout(Duration::from_secs(5), consumer.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.message.sequence, 1);
    delivery.ack().await.unwrap();
    drop(consumer);

    let mut resumed = bus
        .consumer("AGENT_a1", ConsumerConfig::ordered(filters).durable("d1"))
        .await
        .unwrap();
    let delivery = timeout(Duration::from_secs(5), resumed.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.message.sequence, 2);
}

#[tokio::test]
#[ignore] // 需要Docker
async fn test_object_store() {
    let setup = RedisSetup::new().await;
    let bus = setup.bus("it-objects").await;

    bus.put("scripts", "hello.sh", b"echo hi".to_vec())
        .await
        .unwrap();
    assert_eq!(
        bus.get("scripts", "hello.sh").await.unwrap(),
        Some(b"echo hi".to_vec())
    );
    assert_eq!(bus.list("scripts").await.unwrap(), vec!["hello.sh"]);
    assert!(bus.delete("scripts", "hello.sh").await.unwrap());
    assert_eq!(bus.get("scripts", "hello.sh").await.unwrap(), None);
}
