//! Redis Stream消息总线模块
//!
//! 基于Redis Stream的消息总线实现，按照单一职责原则分解为多个子模块。
//! Publishing shares one auto-reconnecting connection; every consumer gets a
//! dedicated connection because `XREADGROUP ... BLOCK` holds it for the whole wait.

pub mod config;
pub mod connection_manager;
pub mod consumer;
pub mod stream_operations;

pub use config::RedisStreamConfig;
pub use connection_manager::RedisConnectionManager;
pub use consumer::RedisStreamConsumer;
pub use stream_operations::RedisStreamOperations;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use relay_core::{
    BrokerConsumer, Envelope, GroupInfo, MessageBroker, RelayError, RelayResult, Subscription,
};

use crate::metrics_collector::BrokerMetrics;

/// 健康状态
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub error_message: Option<String>,
}

/// Redis Stream消息总线
pub struct RedisStreamBroker {
    connection_manager: Arc<RedisConnectionManager>,
    stream_operations: Arc<RedisStreamOperations>,
    metrics: BrokerMetrics,
}

impl RedisStreamBroker {
    pub async fn new(config: RedisStreamConfig) -> RelayResult<Self> {
        let metrics = BrokerMetrics::new("redis_stream");
        let connection_manager = Arc::new(RedisConnectionManager::new(config, metrics.clone()).await?);
        let stream_operations = Arc::new(RedisStreamOperations::new(connection_manager.clone()));

        info!(
            stream_max_len = connection_manager.config().stream_max_len,
            "Redis Stream消息总线已连接"
        );
        Ok(Self {
            connection_manager,
            stream_operations,
            metrics,
        })
    }

    pub fn metrics(&self) -> &BrokerMetrics {
        &self.metrics
    }

    pub async fn health_check(&self) -> HealthStatus {
        match self.connection_manager.ping().await {
            Ok(()) => HealthStatus {
                healthy: true,
                error_message: None,
            },
            Err(e) => HealthStatus {
                healthy: false,
                error_message: Some(e.to_string()),
            },
        }
    }

    fn consumer_name(&self) -> String {
        let id = Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.connection_manager.config().consumer_name, &id[..8])
    }
}

#[async_trait]
impl MessageBroker for RedisStreamBroker {
    async fn publish(&self, topic: &str, key: Option<&str>, envelope: &Envelope) -> RelayResult<()> {
        self.stream_operations.publish(topic, key, envelope).await?;
        Ok(())
    }

    async fn subscribe(&self, subscription: Subscription) -> RelayResult<Box<dyn BrokerConsumer>> {
        if subscription.topics.is_empty() {
            return Err(RelayError::Broker("subscription has no topics".to_string()));
        }

        let consumer_name = self.consumer_name();
        for topic in &subscription.topics {
            self.stream_operations
                .ensure_consumer_group_exists(topic, &subscription.group, subscription.start)
                .await?;
            self.stream_operations
                .create_consumer(topic, &subscription.group, &consumer_name)
                .await?;
        }

        let conn = self.connection_manager.dedicated_connection().await?;
        info!(
            group = %subscription.group,
            consumer = %consumer_name,
            topics = ?subscription.topics,
            ephemeral = subscription.ephemeral,
            "创建Redis Stream消费者"
        );

        Ok(Box::new(RedisStreamConsumer::new(
            conn,
            self.stream_operations.clone(),
            subscription,
            consumer_name,
            self.metrics.clone(),
        )))
    }

    async fn list_groups(&self, topic: &str) -> RelayResult<Vec<GroupInfo>> {
        self.stream_operations.list_groups(topic).await
    }

    async fn delete_group(&self, topic: &str, group: &str) -> RelayResult<()> {
        self.stream_operations.delete_consumer_group(topic, group).await
    }

    fn backend(&self) -> &'static str {
        "redis_stream"
    }
}
