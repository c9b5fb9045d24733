use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use serde_json::json;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::redis::Redis;
use tokio::time::timeout;

use relay_core::{CorrelationId, Envelope, MessageBroker, PushEvent, StartOffset, Subscription};
use relay_infrastructure::{
    RedisStreamBroker, RedisStreamConfig, RpcChannel, RpcChannelConfig, StreamBridge,
    StreamBridgeConfig, StreamFilter,
};

async fn start_redis() -> Result<(ContainerAsync<Redis>, RedisStreamBroker)> {
    let container = Redis::default().start().await?;
    let port = container.get_host_port_ipv4(6379).await?;
    let config = RedisStreamConfig {
        url: format!("redis://127.0.0.1:{port}/0"),
        connection_timeout: Duration::from_secs(5),
        stream_max_len: 1_000,
        consumer_name: "it".to_string(),
        ..Default::default()
    };
    let broker = RedisStreamBroker::new(config).await?;
    Ok((container, broker))
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_publish_and_consume_through_shared_group() -> Result<()> {
    let (_container, broker) = start_redis().await?;

    let envelope = Envelope::from_value(json!({
        "user_id": "u-1",
        "amount": 12,
        "event": "transaction_added",
        "metadata": {"amount": 12},
    }))?;
    broker.publish("transactions", Some("k-1"), &envelope).await?;

    // Shared groups start from the beginning of the stream.
    let mut consumer = broker
        .subscribe(Subscription::shared(vec!["transactions".to_string()], "relay-dispatcher"))
        .await?;
    let records = consumer.poll(10, Duration::from_millis(500)).await?;

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].topic, "transactions");
    assert_eq!(records[0].key.as_deref(), Some("k-1"));
    assert_eq!(records[0].envelope, envelope);
    assert_eq!(records[0].envelope.body["metadata"], json!({"amount": 12}));

    // Acknowledged on receipt.
    assert!(consumer.poll(10, Duration::from_millis(100)).await?.is_empty());
    consumer.close().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_ephemeral_group_is_destroyed_on_close() -> Result<()> {
    let (_container, broker) = start_redis().await?;

    let subscription = Subscription {
        topics: vec!["chat_responses".to_string()],
        group: "relay-stream-it".to_string(),
        start: StartOffset::Latest,
        ephemeral: true,
    };
    let consumer = broker.subscribe(subscription).await?;
    let groups = broker.list_groups("chat_responses").await?;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].name, "relay-stream-it");
    // 消费者在订阅时即已注册，首次读取前组内不会为空
    assert_eq!(groups[0].consumers, 1);

    consumer.close().await?;
    assert!(broker.list_groups("chat_responses").await?.is_empty());
    Ok(())
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_list_groups_on_missing_stream_is_empty() -> Result<()> {
    let (_container, broker) = start_redis().await?;
    assert!(broker.list_groups("does_not_exist").await?.is_empty());
    assert!(broker.health_check().await.healthy);
    Ok(())
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_deleted_group_is_recreated_by_consumer() -> Result<()> {
    let (_container, broker) = start_redis().await?;

    let mut consumer = broker
        .subscribe(Subscription::shared(vec!["notifications".to_string()], "relay-dispatcher"))
        .await?;
    broker.delete_group("notifications", "relay-dispatcher").await?;

    assert!(consumer.poll(10, Duration::from_millis(50)).await?.is_empty());
    let groups = broker.list_groups("notifications").await?;
    assert!(groups.iter().any(|group| group.name == "relay-dispatcher"));
    Ok(())
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_rpc_and_stream_over_redis() -> Result<()> {
    let (_container, broker) = start_redis().await?;
    let broker: Arc<dyn MessageBroker> = Arc::new(broker);

    let rpc = RpcChannel::new(
        "budget",
        broker.clone(),
        RpcChannelConfig::new("budget_requests", "budget_responses")
            .with_poll_wait(Duration::from_millis(100)),
    );
    rpc.start().await?;

    let responder = {
        let broker = broker.clone();
        tokio::spawn(async move {
            let mut consumer = broker
                .subscribe(Subscription::shared(vec!["budget_requests".to_string()], "worker"))
                .await?;
            loop {
                for record in consumer.poll(10, Duration::from_millis(100)).await? {
                    let id = record.envelope.correlation_id.clone().unwrap_or_default();
                    let reply = Envelope::from_value(json!({"success": true, "budget": 100}))?
                        .with_correlation_id(id);
                    broker.publish("budget_responses", None, &reply).await?;
                    return anyhow::Ok(());
                }
            }
        })
    };

    let reply = rpc
        .call(Envelope::from_value(json!({"userId": "u-1"}))?, Duration::from_secs(5))
        .await?;
    assert_eq!(reply.body.get("budget"), Some(&json!(100)));
    responder.await??;
    rpc.stop().await?;

    let bridge = StreamBridge::new(
        broker.clone(),
        StreamBridgeConfig {
            poll_wait: Duration::from_millis(100),
            ..Default::default()
        },
    );
    let id = CorrelationId::new();
    let mut session = bridge.open(StreamFilter::Correlation(id.clone()), "chat_responses").await?;
    broker.publish("chat_responses", None, &Envelope::chunk(id.clone(), "hi")).await?;
    broker.publish("chat_responses", None, &Envelope::done(id)).await?;

    let events: Vec<PushEvent> = timeout(Duration::from_secs(5), session.by_ref().collect()).await?;
    assert_eq!(events, vec![PushEvent::Text("hi".to_string()), PushEvent::Done]);
    Ok(())
}
