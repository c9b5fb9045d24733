use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// How the dispatcher answers a consumed record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RouteModeKind {
    RequestResponse,
    Streaming,
    FireAndForget,
}

/// Static topic → handler binding
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteConfig {
    pub topic: String,
    pub handler: String,
    pub mode: RouteModeKind,
    /// Reply topic (request/response) or event topic (streaming)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_topic: Option<String>,
    /// Circuit breaker guarding the handler's dependency
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<String>,
}

impl RouteConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.topic.is_empty() {
            return Err(anyhow::anyhow!("路由主题不能为空"));
        }
        if self.handler.is_empty() {
            return Err(anyhow::anyhow!("路由 {} 缺少处理器名称", self.topic));
        }
        match self.mode {
            RouteModeKind::RequestResponse | RouteModeKind::Streaming => {
                if self.reply_topic.as_deref().unwrap_or_default().is_empty() {
                    return Err(anyhow::anyhow!("路由 {} 需要配置reply_topic", self.topic));
                }
            }
            RouteModeKind::FireAndForget => {}
        }
        Ok(())
    }
}

/// Backoff settings for handler invocations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow::anyhow!("重试次数必须大于0"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(anyhow::anyhow!("最大重试间隔不能小于基础间隔"));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(anyhow::anyhow!("退避倍数必须不小于1"));
        }
        Ok(())
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub enabled: bool,
    /// Shared consumer group of all dispatcher instances
    pub group_id: String,
    pub max_records: usize,
    pub poll_wait_ms: u64,
    pub retry: RetrySettings,
    pub routes: Vec<RouteConfig>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let route = |topic: &str, handler: &str, mode, reply: Option<&str>, dependency: &str| RouteConfig {
            topic: topic.to_string(),
            handler: handler.to_string(),
            mode,
            reply_topic: reply.map(str::to_string),
            dependency: Some(dependency.to_string()),
        };

        Self {
            enabled: true,
            group_id: "relay-dispatcher".to_string(),
            max_records: 10,
            poll_wait_ms: 1_000,
            retry: RetrySettings::default(),
            routes: vec![
                route("budget_requests", "budget", RouteModeKind::RequestResponse, Some("budget_responses"), "gemini"),
                route("ocr_requests", "ocr", RouteModeKind::RequestResponse, Some("ocr_responses"), "ocr"),
                route("chat_requests", "chat", RouteModeKind::Streaming, Some("chat_responses"), "gemini"),
                route("transactions", "transactions", RouteModeKind::FireAndForget, None, "supabase"),
                route("notifications", "notifications", RouteModeKind::FireAndForget, None, "supabase"),
                route("analytics", "analytics", RouteModeKind::FireAndForget, None, "supabase"),
            ],
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.group_id.is_empty() {
            return Err(anyhow::anyhow!("Dispatcher消费组名称不能为空"));
        }
        if self.max_records == 0 {
            return Err(anyhow::anyhow!("每批最大消息数必须大于0"));
        }
        if self.poll_wait_ms == 0 {
            return Err(anyhow::anyhow!("拉取等待时间必须大于0"));
        }
        self.retry.validate()?;

        let mut seen = std::collections::HashSet::new();
        for route in &self.routes {
            route.validate()?;
            if !seen.insert(route.topic.as_str()) {
                return Err(anyhow::anyhow!("主题 {} 配置了多个路由", route.topic));
            }
        }
        Ok(())
    }
}

/// Remote endpoint a forwarding handler posts to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandlerConfig {
    pub url: String,
    /// Parse the response as an SSE stream of text fragments
    #[serde(default)]
    pub streaming: bool,
    #[serde(default = "default_handler_timeout")]
    pub timeout_seconds: u64,
    /// Body fields that must be present; `"a|b"` accepts either name
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Reject requests without a forwarded caller token
    #[serde(default)]
    pub require_access_token: bool,
}

fn default_handler_timeout() -> u64 {
    60
}

impl HandlerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(anyhow::anyhow!("处理器URL必须是http://或https://格式: {}", self.url));
        }
        if self.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("处理器超时时间必须大于0"));
        }
        Ok(())
    }
}

pub fn default_handlers() -> BTreeMap<String, HandlerConfig> {
    let handler = |path: &str, streaming: bool, timeout_seconds: u64, required: &[&str], token: bool| HandlerConfig {
        url: format!("http://127.0.0.1:8000{path}"),
        streaming,
        timeout_seconds,
        required_fields: required.iter().map(|field| field.to_string()).collect(),
        require_access_token: token,
    };

    BTreeMap::from([
        (
            "budget".to_string(),
            handler("/logic/budget-suggest", false, 90, &["userId|user_id", "totalIncome|total_income", "period"], true),
        ),
        (
            "ocr".to_string(),
            handler("/logic/ocr-process", false, 180, &["userId|user_id", "image_url|image_data"], true),
        ),
        (
            "chat".to_string(),
            handler("/logic/chat-stream", true, 120, &["message", "userId|user_id"], true),
        ),
        (
            "transactions".to_string(),
            handler("/logic/transaction-update", false, 30, &["user_id", "category", "transaction_date"], false),
        ),
        (
            "notifications".to_string(),
            handler("/logic/notification-send", false, 30, &["user_id", "type"], false),
        ),
        (
            "analytics".to_string(),
            handler("/logic/analytics-update", false, 30, &["user_id", "event_type"], false),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_routes_are_valid() {
        let config = DispatcherConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.routes.len(), 6);
    }

    #[test]
    fn test_request_response_route_needs_reply_topic() {
        let route = RouteConfig {
            topic: "budget_requests".to_string(),
            handler: "budget".to_string(),
            mode: RouteModeKind::RequestResponse,
            reply_topic: None,
            dependency: None,
        };
        assert!(route.validate().is_err());
    }

    #[test]
    fn test_duplicate_topics_rejected() {
        let mut config = DispatcherConfig::default();
        let duplicate = config.routes[0].clone();
        config.routes.push(duplicate);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_settings_to_policy() {
        let policy = RetrySettings::default().to_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }
}
