use std::time::Duration;

use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::Client;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use relay_core::{RelayError, RelayResult};

use super::config::RedisStreamConfig;
use crate::metrics_collector::BrokerMetrics;

/// Owns the Redis client, the shared publishing connection and hands out
/// dedicated connections for blocking consumers.
pub struct RedisConnectionManager {
    client: Client,
    publisher: ConnectionManager,
    config: RedisStreamConfig,
    metrics: BrokerMetrics,
}

impl RedisConnectionManager {
    pub async fn new(config: RedisStreamConfig, metrics: BrokerMetrics) -> RelayResult<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| RelayError::Configuration(format!("Failed to create Redis client: {e}")))?;

        let publisher = Self::with_retry(&config, &metrics, || ConnectionManager::new(client.clone())).await?;

        let manager = Self {
            client,
            publisher,
            config,
            metrics,
        };
        manager.ping().await?;
        debug!("Successfully connected to Redis");
        Ok(manager)
    }

    /// Shared auto-reconnecting connection for non-blocking commands.
    pub fn publisher(&self) -> ConnectionManager {
        self.publisher.clone()
    }

    /// A connection of its own for `XREADGROUP ... BLOCK`, which would stall
    /// every other command multiplexed on a shared connection.
    pub async fn dedicated_connection(&self) -> RelayResult<MultiplexedConnection> {
        Self::with_retry(&self.config, &self.metrics, || {
            self.client.get_multiplexed_async_connection()
        })
        .await
    }

    async fn with_retry<F, Fut, C>(
        config: &RedisStreamConfig,
        metrics: &BrokerMetrics,
        mut connect: F,
    ) -> RelayResult<C>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = redis::RedisResult<C>>,
    {
        let attempts = config.max_retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            match tokio::time::timeout(config.connection_timeout, connect()).await {
                Ok(Ok(conn)) => {
                    if attempt > 0 {
                        debug!("Successfully reconnected to Redis after {} attempts", attempt + 1);
                    }
                    return Ok(conn);
                }
                Ok(Err(e)) => last_error = Some(e.to_string()),
                Err(_) => last_error = Some("connection timed out".to_string()),
            }

            metrics.record_connection_error();
            if attempt + 1 < attempts {
                warn!(
                    "Failed to connect to Redis (attempt {}/{}): {}. Retrying in {:?}...",
                    attempt + 1,
                    attempts,
                    last_error.as_deref().unwrap_or("unknown"),
                    config.retry_delay
                );
                sleep(config.retry_delay).await;
            }
        }

        let error_msg = format!(
            "Failed to connect to Redis after {} attempts. Last error: {}",
            attempts,
            last_error.unwrap_or_else(|| "unknown".to_string())
        );
        error!("{}", error_msg);
        Err(RelayError::Broker(error_msg))
    }

    pub async fn ping(&self) -> RelayResult<()> {
        let mut conn = self.publisher();
        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::Broker(format!("Redis PING failed: {e}")))?;
        if response == "PONG" {
            Ok(())
        } else {
            Err(RelayError::Broker(format!("Unexpected PING response: {response}")))
        }
    }

    pub fn metrics(&self) -> &BrokerMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &RedisStreamConfig {
        &self.config
    }
}

impl std::fmt::Debug for RedisConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnectionManager")
            .field("stream_max_len", &self.config.stream_max_len)
            .finish_non_exhaustive()
    }
}

/// `BLOCK 0` blocks forever, so a zero wait still becomes one millisecond.
pub(crate) fn block_millis(wait: Duration) -> u64 {
    (wait.as_millis() as u64).max(1)
}
