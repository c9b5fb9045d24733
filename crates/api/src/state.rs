use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusHandle;
use tracing::{info, warn};

use relay_core::config::{ApiConfig, AppConfig, TopicsConfig};
use relay_core::{MessageBroker, RelayResult};
use relay_infrastructure::{RpcChannel, RpcChannelConfig, StreamBridge, StreamBridgeConfig};

/// 应用共享状态
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<dyn MessageBroker>,
    pub budget_rpc: Arc<RpcChannel>,
    pub ocr_rpc: Arc<RpcChannel>,
    pub bridge: StreamBridge,
    pub topics: TopicsConfig,
    pub api: ApiConfig,
    pub metrics: Option<PrometheusHandle>,
    pub metrics_path: String,
}

impl AppState {
    pub fn new(broker: Arc<dyn MessageBroker>, config: &AppConfig, metrics: Option<PrometheusHandle>) -> Self {
        let topics = config.topics.clone();
        let api = config.api.clone();
        let poll_wait = Duration::from_millis(api.stream_poll_wait_ms);

        let rpc = |name: &str, request: &str, response: &str| {
            let channel_config = RpcChannelConfig::new(request, response)
                .with_group_prefix(format!("{}-{name}", api.rpc_group_prefix))
                .with_poll_wait(poll_wait);
            Arc::new(RpcChannel::new(name, broker.clone(), channel_config))
        };
        let budget_rpc = rpc("budget", &topics.budget_requests, &topics.budget_responses);
        let ocr_rpc = rpc("ocr", &topics.ocr_requests, &topics.ocr_responses);

        let bridge = StreamBridge::new(
            broker.clone(),
            StreamBridgeConfig {
                group_prefix: api.stream_group_prefix.clone(),
                poll_wait,
                ..StreamBridgeConfig::default()
            },
        );

        Self {
            broker,
            budget_rpc,
            ocr_rpc,
            bridge,
            topics,
            api,
            metrics,
            metrics_path: config.observability.metrics_endpoint.clone(),
        }
    }

    pub fn rpc_channels(&self) -> [&Arc<RpcChannel>; 2] {
        [&self.budget_rpc, &self.ocr_rpc]
    }

    /// Starts every RPC reply loop. Must complete before the router serves traffic.
    pub async fn start(&self) -> RelayResult<()> {
        for channel in self.rpc_channels() {
            channel.start().await?;
        }
        info!("API RPC通道已启动");
        Ok(())
    }

    pub async fn stop(&self) {
        for channel in self.rpc_channels() {
            if let Err(e) = channel.stop().await {
                warn!("停止RPC通道 {} 失败: {}", channel.name(), e);
            }
        }
        info!("API RPC通道已停止");
    }

    pub fn budget_timeout(&self) -> Duration {
        Duration::from_secs(self.api.budget_timeout_seconds)
    }

    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.api.ocr_timeout_seconds)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.api.keep_alive_seconds.max(1))
    }
}
