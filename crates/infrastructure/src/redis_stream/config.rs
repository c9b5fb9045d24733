use std::time::Duration;

use relay_core::config::BrokerConfig;

/// Redis Stream配置
#[derive(Debug, Clone)]
pub struct RedisStreamConfig {
    pub url: String,
    pub connection_timeout: Duration,
    pub max_retry_attempts: u32,
    pub retry_delay: Duration,
    /// Approximate retention passed to `XADD MAXLEN ~`
    pub stream_max_len: usize,
    /// Prefix of consumer names inside groups
    pub consumer_name: String,
}

impl Default for RedisStreamConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            connection_timeout: Duration::from_secs(30),
            max_retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            stream_max_len: 10_000,
            consumer_name: default_consumer_name(),
        }
    }
}

impl RedisStreamConfig {
    pub fn from_broker_config(config: &BrokerConfig) -> Self {
        Self {
            url: config.redis_url(),
            connection_timeout: Duration::from_secs(config.redis.connection_timeout_seconds),
            max_retry_attempts: config.redis.max_retry_attempts,
            retry_delay: Duration::from_secs(config.redis.retry_delay_seconds),
            stream_max_len: config.stream_max_len,
            consumer_name: config
                .consumer_name
                .clone()
                .filter(|name| !name.is_empty())
                .unwrap_or_else(default_consumer_name),
        }
    }
}

fn default_consumer_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "relay".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_broker_config() {
        let broker = BrokerConfig {
            url: "redis://cache:6379/1".to_string(),
            stream_max_len: 500,
            consumer_name: Some("gateway-1".to_string()),
            ..Default::default()
        };

        let config = RedisStreamConfig::from_broker_config(&broker);
        assert_eq!(config.url, "redis://cache:6379/1");
        assert_eq!(config.stream_max_len, 500);
        assert_eq!(config.consumer_name, "gateway-1");
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_empty_consumer_name_falls_back_to_host() {
        let broker = BrokerConfig {
            consumer_name: Some(String::new()),
            ..Default::default()
        };
        assert!(!RedisStreamConfig::from_broker_config(&broker).consumer_name.is_empty());
    }
}
