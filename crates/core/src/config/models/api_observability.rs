use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub cors_enabled: bool,
    pub cors_origins: Vec<String>,
    pub budget_timeout_seconds: u64,
    pub ocr_timeout_seconds: u64,
    /// Prefix of the RPC channels' ephemeral reply groups
    pub rpc_group_prefix: String,
    /// Prefix of the push sessions' ephemeral groups
    pub stream_group_prefix: String,
    pub stream_poll_wait_ms: u64,
    pub keep_alive_seconds: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:8080".to_string(),
            cors_enabled: true,
            cors_origins: vec!["*".to_string()],
            budget_timeout_seconds: 90,
            ocr_timeout_seconds: 180,
            rpc_group_prefix: "relay-rpc".to_string(),
            stream_group_prefix: "relay-stream".to_string(),
            stream_poll_wait_ms: 500,
            keep_alive_seconds: 15,
        }
    }
}

impl ApiConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_address.is_empty() {
            return Err(anyhow::anyhow!("API绑定地址不能为空"));
        }
        if self.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(anyhow::anyhow!("无效的API绑定地址: {}", self.bind_address));
        }
        if self.budget_timeout_seconds == 0 || self.ocr_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("RPC超时时间必须大于0"));
        }
        if self.rpc_group_prefix.is_empty() || self.stream_group_prefix.is_empty() {
            return Err(anyhow::anyhow!("临时消费组前缀不能为空"));
        }
        if self.stream_poll_wait_ms == 0 {
            return Err(anyhow::anyhow!("推送拉取等待时间必须大于0"));
        }
        Ok(())
    }
}

/// Expiry of ephemeral groups orphaned by crashed processes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JanitorConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub max_idle_seconds: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 300,
            max_idle_seconds: 3_600,
        }
    }
}

impl JanitorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.enabled && (self.interval_seconds == 0 || self.max_idle_seconds == 0) {
            return Err(anyhow::anyhow!("清理间隔和最大空闲时间必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_enabled: bool,
    pub metrics_endpoint: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_endpoint: "/metrics".to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(anyhow::anyhow!("无效的日志级别: {}", self.log_level));
        }
        if self.metrics_enabled && !self.metrics_endpoint.starts_with('/') {
            return Err(anyhow::anyhow!("指标端点必须以/开头"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_config_rejects_bad_bind_address() {
        let config = ApiConfig {
            bind_address: "localhost".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(ApiConfig::default().validate().is_ok());
    }

    #[test]
    fn test_observability_log_level() {
        let mut config = ObservabilityConfig::default();
        config.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());
        config.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_disabled_janitor_skips_checks() {
        let config = JanitorConfig {
            enabled: false,
            interval_seconds: 0,
            max_idle_seconds: 0,
        };
        assert!(config.validate().is_ok());
    }
}
