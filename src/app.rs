use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{net::TcpListener, sync::broadcast};
use tracing::{info, warn};

use relay_api::{create_app, AppState};
use relay_core::config::AppConfig;
use relay_core::MessageBroker;
use relay_dispatcher::{build_http_handlers, Dispatcher, DispatcherSettings, RouteTable};
use relay_infrastructure::{BrokerFactory, GroupJanitor, GroupJanitorConfig};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行Dispatcher
    Dispatcher,
    /// 仅运行API服务器
    Api,
    /// 运行所有组件
    All,
}

impl AppMode {
    pub fn parse(mode: &str, config: &AppConfig) -> Result<Self> {
        match mode {
            "dispatcher" => {
                if !config.dispatcher.enabled {
                    return Err(anyhow::anyhow!("Dispatcher模式被禁用，请检查配置"));
                }
                Ok(AppMode::Dispatcher)
            }
            "api" => {
                if !config.api.enabled {
                    return Err(anyhow::anyhow!("API模式被禁用，请检查配置"));
                }
                Ok(AppMode::Api)
            }
            "all" => Ok(AppMode::All),
            _ => Err(anyhow::anyhow!("不支持的运行模式: {mode}")),
        }
    }

    fn runs_dispatcher(self, config: &AppConfig) -> bool {
        match self {
            AppMode::Dispatcher => true,
            AppMode::Api => false,
            AppMode::All => config.dispatcher.enabled,
        }
    }

    fn runs_api(self, config: &AppConfig) -> bool {
        match self {
            AppMode::Api => true,
            AppMode::Dispatcher => false,
            AppMode::All => config.api.enabled,
        }
    }
}

/// 主应用程序
///
/// Composition root: one broker shared by the dispatcher loop and the API
/// surface, wired from [`AppConfig`].
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    broker: Arc<dyn MessageBroker>,
    metrics: Option<PrometheusHandle>,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode, metrics: Option<PrometheusHandle>) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);

        let broker = BrokerFactory::create(&config.broker)
            .await
            .context("创建消息总线失败")?;

        Ok(Self {
            config,
            mode,
            broker,
            metrics,
        })
    }

    pub fn broker(&self) -> &Arc<dyn MessageBroker> {
        &self.broker
    }

    /// 运行应用程序，直到收到关闭信号
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);

        let dispatcher_rx = shutdown_rx.resubscribe();
        let dispatcher = async {
            if self.mode.runs_dispatcher(&self.config) {
                self.run_dispatcher(dispatcher_rx).await
            } else {
                Ok(())
            }
        };
        let api = async {
            if self.mode.runs_api(&self.config) {
                self.run_api(shutdown_rx).await
            } else {
                Ok(())
            }
        };

        tokio::try_join!(dispatcher, api)?;
        info!("应用程序已停止");
        Ok(())
    }

    /// Builds the dispatcher from the configured handlers, routes and breakers.
    pub fn build_dispatcher(&self) -> Result<Dispatcher> {
        let handlers = build_http_handlers(&self.config.handlers).context("创建处理器失败")?;
        let routes = RouteTable::from_config(&self.config.dispatcher.routes).context("创建路由表失败")?;
        let breakers = Arc::new(self.config.resilience.build_registry());

        Dispatcher::new(
            Arc::clone(&self.broker),
            handlers,
            routes,
            breakers,
            DispatcherSettings::from_config(&self.config.dispatcher),
        )
        .context("创建Dispatcher失败")
    }

    async fn run_dispatcher(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let dispatcher = Arc::new(self.build_dispatcher()?);
        info!(
            "启动Dispatcher服务, 消费组: {}, 主题: {:?}",
            dispatcher.settings().group_id,
            dispatcher.routes().topics()
        );

        dispatcher.run(shutdown_rx).await.context("Dispatcher运行失败")?;
        info!("Dispatcher服务已停止");
        Ok(())
    }

    async fn run_api(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let state = AppState::new(Arc::clone(&self.broker), &self.config, self.metrics.clone());
        state.start().await.context("启动RPC通道失败")?;

        let mut janitor = GroupJanitor::new(
            Arc::clone(&self.broker),
            GroupJanitorConfig::from_config(&self.config.janitor, &self.config.topics, &self.config.api),
        );
        janitor.start().await.context("启动临时消费组清理任务失败")?;

        let app = create_app(state.clone(), &self.config.api);
        let listener = TcpListener::bind(&self.config.api.bind_address)
            .await
            .with_context(|| format!("绑定地址失败: {}", self.config.api.bind_address))?;
        info!("API服务器启动在 http://{}", listener.local_addr()?);

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("API服务器收到关闭信号");
            })
            .await;

        if let Err(e) = janitor.stop().await {
            warn!("停止临时消费组清理任务失败: {}", e);
        }
        state.stop().await;

        served.context("API服务器运行失败")?;
        info!("API服务器已停止");
        Ok(())
    }
}
