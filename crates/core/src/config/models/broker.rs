use serde::{Deserialize, Serialize};

/// Message broker backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrokerType {
    #[default]
    RedisStream,
    InMemory,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub database: i64,
    pub password: Option<String>,
    pub connection_timeout_seconds: u64,
    pub max_retry_attempts: u32,
    pub retry_delay_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            password: None,
            connection_timeout_seconds: 30,
            max_retry_attempts: 3,
            retry_delay_seconds: 1,
        }
    }
}

impl RedisConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.is_empty() {
            return Err(anyhow::anyhow!("Redis主机地址不能为空"));
        }
        if self.port == 0 {
            return Err(anyhow::anyhow!("Redis端口必须大于0"));
        }
        if self.database < 0 {
            return Err(anyhow::anyhow!("Redis数据库索引不能为负数"));
        }
        if self.connection_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("Redis连接超时时间必须大于0"));
        }
        if self.max_retry_attempts == 0 {
            return Err(anyhow::anyhow!("Redis最大重试次数必须大于0"));
        }
        Ok(())
    }

    /// Build Redis connection URL
    pub fn build_url(&self) -> String {
        let auth = match &self.password {
            Some(password) => format!(":{password}@"),
            None => String::new(),
        };
        format!("redis://{}{}:{}/{}", auth, self.host, self.port, self.database)
    }
}

/// 消息总线配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    #[serde(rename = "type")]
    pub r#type: BrokerType,
    /// Takes precedence over `redis` when non-empty
    pub url: String,
    pub redis: RedisConfig,
    /// Approximate per-stream retention (`XADD MAXLEN ~`)
    pub stream_max_len: usize,
    /// Records kept per topic by the in-memory backend
    pub in_memory_retention: usize,
    /// Consumer name inside groups; the host name when unset
    pub consumer_name: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            r#type: BrokerType::RedisStream,
            url: String::new(),
            redis: RedisConfig::default(),
            stream_max_len: 10_000,
            in_memory_retention: 10_000,
            consumer_name: None,
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.r#type {
            BrokerType::RedisStream => {
                if !self.url.is_empty()
                    && !self.url.starts_with("redis://")
                    && !self.url.starts_with("rediss://")
                {
                    return Err(anyhow::anyhow!("Redis URL必须是redis://或rediss://格式"));
                }
                if self.url.is_empty() {
                    self.redis.validate()?;
                }
                if self.stream_max_len == 0 {
                    return Err(anyhow::anyhow!("stream_max_len必须大于0"));
                }
            }
            BrokerType::InMemory => {
                if self.in_memory_retention == 0 {
                    return Err(anyhow::anyhow!("in_memory_retention必须大于0"));
                }
            }
        }
        Ok(())
    }

    pub fn redis_url(&self) -> String {
        if self.url.is_empty() {
            self.redis.build_url()
        } else {
            self.url.clone()
        }
    }
}

/// Topic names shared by the gateway and the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TopicsConfig {
    pub chat_requests: String,
    pub chat_responses: String,
    pub budget_requests: String,
    pub budget_responses: String,
    pub ocr_requests: String,
    pub ocr_responses: String,
    pub transactions: String,
    pub notifications: String,
    pub analytics: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            chat_requests: "chat_requests".to_string(),
            chat_responses: "chat_responses".to_string(),
            budget_requests: "budget_requests".to_string(),
            budget_responses: "budget_responses".to_string(),
            ocr_requests: "ocr_requests".to_string(),
            ocr_responses: "ocr_responses".to_string(),
            transactions: "transactions".to_string(),
            notifications: "notifications".to_string(),
            analytics: "analytics".to_string(),
        }
    }
}

impl TopicsConfig {
    pub fn all(&self) -> Vec<&str> {
        vec![
            self.chat_requests.as_str(),
            self.chat_responses.as_str(),
            self.budget_requests.as_str(),
            self.budget_responses.as_str(),
            self.ocr_requests.as_str(),
            self.ocr_responses.as_str(),
            self.transactions.as_str(),
            self.notifications.as_str(),
            self.analytics.as_str(),
        ]
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.all().iter().any(|topic| topic.is_empty()) {
            return Err(anyhow::anyhow!("主题名称不能为空"));
        }
        Ok(())
    }
}
