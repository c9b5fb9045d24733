use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamReadReply;
use tracing::{debug, warn};

use relay_core::{BrokerConsumer, BrokerRecord, Envelope, RelayError, RelayResult, Subscription};

use super::connection_manager::block_millis;
use super::stream_operations::{RedisStreamOperations, DATA_FIELD, KEY_FIELD};
use crate::metrics_collector::BrokerMetrics;

/// Group consumer on one or more streams. Owns a dedicated connection so its
/// blocking reads never delay publishers.
pub struct RedisStreamConsumer {
    conn: MultiplexedConnection,
    operations: Arc<RedisStreamOperations>,
    subscription: Subscription,
    consumer_name: String,
    metrics: BrokerMetrics,
}

impl RedisStreamConsumer {
    pub(crate) fn new(
        conn: MultiplexedConnection,
        operations: Arc<RedisStreamOperations>,
        subscription: Subscription,
        consumer_name: String,
        metrics: BrokerMetrics,
    ) -> Self {
        Self {
            conn,
            operations,
            subscription,
            consumer_name,
            metrics,
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    async fn read_group(&mut self, count: usize, wait: Duration) -> redis::RedisResult<Option<StreamReadReply>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.subscription.group)
            .arg(&self.consumer_name)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_millis(wait))
            .arg("STREAMS");
        for topic in &self.subscription.topics {
            cmd.arg(topic);
        }
        for _ in &self.subscription.topics {
            cmd.arg(">");
        }
        cmd.query_async(&mut self.conn).await
    }

    async fn ack(&mut self, stream: &str, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(&self.subscription.group).arg(ids);
        if let Err(e) = cmd.query_async::<i64>(&mut self.conn).await {
            warn!("Failed to acknowledge {} messages on {}: {}", ids.len(), stream, e);
        }
    }

    /// Re-creates groups removed underneath this consumer (janitor, stream deletion).
    async fn recover_groups(&self) -> RelayResult<()> {
        for topic in &self.subscription.topics {
            self.operations
                .ensure_consumer_group_exists(topic, &self.subscription.group, self.subscription.start)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConsumer for RedisStreamConsumer {
    async fn poll(&mut self, max_records: usize, wait: Duration) -> RelayResult<Vec<BrokerRecord>> {
        // COUNT applies per stream; everything returned is acknowledged, so nothing is truncated.
        let reply = match self.read_group(max_records.max(1), wait).await {
            Ok(Some(reply)) => reply,
            Ok(None) => return Ok(Vec::new()),
            Err(e) if e.to_string().contains("NOGROUP") => {
                warn!(group = %self.subscription.group, "消费组不存在，重新创建");
                self.recover_groups().await?;
                return Ok(Vec::new());
            }
            Err(e) => {
                self.metrics.record_connection_error();
                return Err(RelayError::Broker(format!(
                    "Failed to read from group {}: {e}",
                    self.subscription.group
                )));
            }
        };

        let mut records = Vec::new();
        for stream in reply.keys {
            let mut ids = Vec::with_capacity(stream.ids.len());
            for entry in stream.ids {
                ids.push(entry.id.clone());

                let Some(data) = entry.get::<String>(DATA_FIELD) else {
                    warn!("Stream message {} missing 'data' field", entry.id);
                    self.metrics.record_malformed();
                    continue;
                };
                match Envelope::from_json_str(&data) {
                    Ok(envelope) => records.push(BrokerRecord {
                        topic: stream.key.clone(),
                        key: entry.get::<String>(KEY_FIELD),
                        envelope,
                    }),
                    Err(e) => {
                        warn!("Failed to deserialize message {} from {}: {}", entry.id, stream.key, e);
                        self.metrics.record_malformed();
                    }
                }
            }
            self.ack(&stream.key, &ids).await;
        }

        self.metrics.record_consumed(records.len() as u64);
        Ok(records)
    }

    async fn close(mut self: Box<Self>) -> RelayResult<()> {
        for topic in &self.subscription.topics {
            if self.subscription.ephemeral {
                self.operations
                    .delete_consumer_group(topic, &self.subscription.group)
                    .await?;
            } else {
                let mut cmd = redis::cmd("XGROUP");
                cmd.arg("DELCONSUMER")
                    .arg(topic)
                    .arg(&self.subscription.group)
                    .arg(&self.consumer_name);
                if let Err(e) = cmd.query_async::<i64>(&mut self.conn).await {
                    warn!("Failed to remove consumer {} from {}: {}", self.consumer_name, topic, e);
                }
            }
        }
        debug!(group = %self.subscription.group, consumer = %self.consumer_name, "Redis消费者已关闭");
        Ok(())
    }

    fn group(&self) -> &str {
        &self.subscription.group
    }
}
