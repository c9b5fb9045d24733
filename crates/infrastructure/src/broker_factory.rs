use std::sync::Arc;

use tracing::{debug, info};

use relay_core::config::{BrokerConfig, BrokerType};
use relay_core::{MessageBroker, RelayError, RelayResult};

use crate::in_memory_broker::{InMemoryBroker, InMemoryBrokerConfig};
use crate::redis_stream::{RedisStreamBroker, RedisStreamConfig};

pub struct BrokerFactory;

impl BrokerFactory {
    pub async fn create(config: &BrokerConfig) -> RelayResult<Arc<dyn MessageBroker>> {
        debug!("Creating message broker with type: {:?}", config.r#type);
        Self::validate_config(config)?;

        match config.r#type {
            BrokerType::RedisStream => {
                info!("Initializing Redis Stream message broker");
                let broker = RedisStreamBroker::new(RedisStreamConfig::from_broker_config(config)).await?;
                Ok(Arc::new(broker))
            }
            BrokerType::InMemory => {
                info!("Initializing in-memory message broker");
                Ok(Arc::new(InMemoryBroker::with_config(InMemoryBrokerConfig {
                    retention: config.in_memory_retention,
                })))
            }
        }
    }

    pub fn validate_config(config: &BrokerConfig) -> RelayResult<()> {
        config
            .validate()
            .map_err(|e| RelayError::Configuration(format!("消息总线配置无效: {e}")))
    }
}
