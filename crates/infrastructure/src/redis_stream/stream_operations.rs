use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::streams::{StreamInfoConsumersReply, StreamInfoGroupsReply};
use tracing::{debug, warn};

use relay_core::{Envelope, GroupInfo, RelayError, RelayResult, StartOffset};

use super::connection_manager::RedisConnectionManager;

/// Stream field carrying the serialized envelope
pub const DATA_FIELD: &str = "data";
/// Stream field carrying the partitioning key
pub const KEY_FIELD: &str = "key";
pub const CORRELATION_FIELD: &str = "correlation_id";

/// Non-blocking stream and group commands, all issued on the shared connection.
#[derive(Debug)]
pub struct RedisStreamOperations {
    connections: Arc<RedisConnectionManager>,
}

impl RedisStreamOperations {
    pub fn new(connections: Arc<RedisConnectionManager>) -> Self {
        Self { connections }
    }

    pub async fn publish(&self, stream: &str, key: Option<&str>, envelope: &Envelope) -> RelayResult<String> {
        let start = Instant::now();
        let payload = envelope.to_json_string()?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.connections.config().stream_max_len)
            .arg("*")
            .arg(DATA_FIELD)
            .arg(&payload);
        if let Some(key) = key {
            cmd.arg(KEY_FIELD).arg(key);
        }
        if let Some(correlation_id) = &envelope.correlation_id {
            cmd.arg(CORRELATION_FIELD).arg(correlation_id.as_str());
        }

        let mut conn = self.connections.publisher();
        let stream_message_id: String = cmd.query_async(&mut conn).await.map_err(|e| {
            self.connections.metrics().record_publish_error();
            RelayError::Broker(format!("Failed to publish message to Redis Stream {stream}: {e}"))
        })?;

        let duration = start.elapsed();
        self.connections
            .metrics()
            .record_published(stream, duration.as_secs_f64() * 1000.0);
        debug!(
            "Published message to stream {} with Redis Stream ID: {} in {:?}",
            stream, stream_message_id, duration
        );
        Ok(stream_message_id)
    }

    pub async fn ensure_consumer_group_exists(
        &self,
        stream: &str,
        group: &str,
        start: StartOffset,
    ) -> RelayResult<()> {
        let start_id = match start {
            StartOffset::Latest => "$",
            StartOffset::Earliest => "0",
        };

        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start_id)
            .arg("MKSTREAM");

        let mut conn = self.connections.publisher();
        match cmd.query_async::<String>(&mut conn).await {
            Ok(_) => {
                debug!("Created consumer group {} on stream {} at {}", group, stream, start_id);
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group {} already exists", group);
                Ok(())
            }
            Err(e) => Err(RelayError::Broker(format!(
                "Failed to create consumer group {group}: {e}"
            ))),
        }
    }

    /// Registers `consumer` in `group` so the group never shows zero consumers
    /// between creation and the first read.
    pub async fn create_consumer(&self, stream: &str, group: &str, consumer: &str) -> RelayResult<()> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATECONSUMER").arg(stream).arg(group).arg(consumer);

        let mut conn = self.connections.publisher();
        cmd.query_async::<i64>(&mut conn).await.map_err(|e| {
            RelayError::Broker(format!("Failed to create consumer {consumer} in group {group}: {e}"))
        })?;
        Ok(())
    }

    pub async fn delete_consumer_group(&self, stream: &str, group: &str) -> RelayResult<()> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("DESTROY").arg(stream).arg(group);

        let mut conn = self.connections.publisher();
        let destroyed: i64 = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::Broker(format!("Failed to delete consumer group {group}: {e}")))?;

        if destroyed > 0 {
            self.connections.metrics().record_group_deleted();
            debug!("Successfully deleted consumer group: {}", group);
        } else {
            debug!("Consumer group {} was not found or already deleted", group);
        }
        Ok(())
    }

    /// Groups on `stream` with the smallest consumer idle time of each.
    pub async fn list_groups(&self, stream: &str) -> RelayResult<Vec<GroupInfo>> {
        let mut conn = self.connections.publisher();

        let reply: StreamInfoGroupsReply = match redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(stream)
            .query_async(&mut conn)
            .await
        {
            Ok(reply) => reply,
            Err(e) if e.to_string().contains("no such key") => return Ok(Vec::new()),
            Err(e) => {
                return Err(RelayError::Broker(format!(
                    "Failed to list consumer groups of {stream}: {e}"
                )))
            }
        };

        let mut groups = Vec::with_capacity(reply.groups.len());
        for group in reply.groups {
            let idle = if group.consumers == 0 {
                None
            } else {
                match redis::cmd("XINFO")
                    .arg("CONSUMERS")
                    .arg(stream)
                    .arg(&group.name)
                    .query_async::<StreamInfoConsumersReply>(&mut conn)
                    .await
                {
                    Ok(consumers) => consumers
                        .consumers
                        .iter()
                        .map(|consumer| Duration::from_millis(consumer.idle as u64))
                        .min(),
                    Err(e) => {
                        warn!("Failed to inspect consumers of group {}: {}", group.name, e);
                        continue;
                    }
                }
            };

            groups.push(GroupInfo {
                name: group.name,
                consumers: group.consumers,
                idle,
            });
        }
        Ok(groups)
    }
}
