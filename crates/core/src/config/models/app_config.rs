use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use super::{
    api_observability::{ApiConfig, JanitorConfig, ObservabilityConfig},
    broker::{BrokerConfig, TopicsConfig},
    dispatcher::{default_handlers, DispatcherConfig, HandlerConfig},
    resilience::ResilienceConfig,
};

/// 环境变量前缀
pub const ENV_PREFIX: &str = "RELAY";

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub topics: TopicsConfig,
    pub dispatcher: DispatcherConfig,
    pub handlers: BTreeMap<String, HandlerConfig>,
    pub resilience: ResilienceConfig,
    pub api: ApiConfig,
    pub janitor: JanitorConfig,
    pub observability: ObservabilityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            topics: TopicsConfig::default(),
            dispatcher: DispatcherConfig::default(),
            handlers: default_handlers(),
            resilience: ResilienceConfig::default(),
            api: ApiConfig::default(),
            janitor: JanitorConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Built-in defaults
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (`RELAY_<SECTION>__<KEY>`)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = ConfigBuilder::try_from(&AppConfig::default()).context("构建默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            let default_paths = ["config/relay.toml", "relay.toml", "/etc/relay/config.toml"];
            if let Some(path) = default_paths.iter().find(|path| Path::new(path).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.broker.validate().context("消息总线配置验证失败")?;
        self.topics.validate().context("主题配置验证失败")?;
        self.dispatcher.validate().context("Dispatcher配置验证失败")?;
        self.resilience.validate().context("熔断器配置验证失败")?;
        self.api.validate().context("API配置验证失败")?;
        self.janitor.validate().context("清理任务配置验证失败")?;
        self.observability.validate().context("可观测性配置验证失败")?;

        for (name, handler) in &self.handlers {
            handler
                .validate()
                .with_context(|| format!("处理器 {name} 配置验证失败"))?;
        }

        for route in &self.dispatcher.routes {
            if !self.handlers.contains_key(&route.handler) {
                return Err(anyhow::anyhow!(
                    "路由 {} 引用了未配置的处理器 {}",
                    route.topic,
                    route.handler
                ));
            }
            if let Some(dependency) = &route.dependency {
                if !self.resilience.circuit_breakers.contains_key(dependency) {
                    return Err(anyhow::anyhow!(
                        "路由 {} 引用了未配置的熔断器 {}",
                        route.topic,
                        dependency
                    ));
                }
            }
        }

        Ok(())
    }
}
