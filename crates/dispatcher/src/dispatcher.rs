use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use relay_core::config::DispatcherConfig;
use relay_core::{
    BrokerRecord, CircuitBreakerRegistry, CorrelationId, Envelope, MessageBroker, RelayError,
    RelayResult, RetryPolicy, Subscription,
};

use crate::handler::{ChunkPublisher, Handler, HandlerContext};
use crate::registry::{HandlerRegistry, Route, RouteMode, RouteTable};
use crate::response::Outcome;

/// Dispatcher运行参数
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub group_id: String,
    pub max_records: usize,
    pub poll_wait: Duration,
    pub retry: RetryPolicy,
}

impl DispatcherSettings {
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            group_id: config.group_id.clone(),
            max_records: config.max_records,
            poll_wait: Duration::from_millis(config.poll_wait_ms),
            retry: config.retry.to_policy(),
        }
    }
}

/// 消息分发器
///
/// Consumes every routed topic under one shared group and runs each record on
/// its own task: validation, then the dependency's breaker wrapped in the
/// retry policy, then the reply the route's mode calls for.
pub struct Dispatcher {
    broker: Arc<dyn MessageBroker>,
    handlers: HandlerRegistry,
    routes: RouteTable,
    breakers: Arc<CircuitBreakerRegistry>,
    settings: DispatcherSettings,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        handlers: HandlerRegistry,
        routes: RouteTable,
        breakers: Arc<CircuitBreakerRegistry>,
        settings: DispatcherSettings,
    ) -> RelayResult<Self> {
        routes.check_handlers(&handlers)?;
        for route in routes.routes() {
            if let Some(dependency) = &route.dependency {
                if breakers.get(dependency).is_none() {
                    return Err(RelayError::Configuration(format!(
                        "route {} refers to unknown circuit breaker {}",
                        route.topic, dependency
                    )));
                }
            }
        }

        Ok(Self {
            broker,
            handlers,
            routes,
            breakers,
            settings,
        })
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// 运行分发循环，直到收到关闭信号
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> RelayResult<()> {
        if self.routes.is_empty() {
            warn!("Dispatcher has no routes, nothing to consume");
            return Ok(());
        }

        let topics = self.routes.topics();
        let mut consumer = self
            .broker
            .subscribe(Subscription::shared(topics.clone(), &self.settings.group_id))
            .await?;
        info!(
            group = %self.settings.group_id,
            ?topics,
            backend = self.broker.backend(),
            "Dispatcher started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Dispatcher shutdown requested");
                    break;
                }
                polled = consumer.poll(self.settings.max_records, self.settings.poll_wait) => match polled {
                    Ok(records) => {
                        for record in records {
                            let dispatcher = self.clone();
                            tokio::spawn(async move {
                                dispatcher.process_record(record).await;
                            });
                        }
                    }
                    Err(e) => {
                        error!("拉取消息失败: {}", e);
                        tokio::select! {
                            _ = shutdown.recv() => break,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                }
            }
        }

        consumer.close().await?;
        info!("Dispatcher stopped");
        Ok(())
    }

    /// Handles one record end to end. Returns `None` when the topic has no route.
    #[instrument(skip(self, record), fields(topic = %record.topic))]
    pub async fn process_record(&self, record: BrokerRecord) -> Option<Outcome> {
        let Some(route) = self.routes.get(&record.topic).cloned() else {
            warn!("No route defined for topic: {}", record.topic);
            return None;
        };
        let started = Instant::now();

        let correlation_id = record
            .key
            .as_deref()
            .filter(|key| !key.is_empty())
            .map(CorrelationId::from)
            .or_else(|| record.envelope.correlation_id.clone());
        let mut request = record.envelope;
        if request.correlation_id.is_none() {
            request.correlation_id = correlation_id.clone();
        }
        debug!(correlation_id = ?correlation_id, mode = route.mode.label(), "处理消息");

        let outcome = match (&route.mode, &correlation_id) {
            (RouteMode::RequestResponse { .. } | RouteMode::Streaming { .. }, None) => {
                warn!("消息缺少correlation_id，无法回复");
                Outcome::Rejected("correlation_id is required".to_string())
            }
            _ => self.run_route(&route, &request, correlation_id.clone()).await,
        };

        if let Some(correlation_id) = correlation_id {
            self.publish_outcome(&route, &outcome, correlation_id).await;
        } else if !outcome.is_success() {
            warn!(outcome = outcome.label(), "消息处理未成功");
        }

        counter!(
            "relay_dispatcher_outcomes_total",
            "topic" => route.topic.clone(),
            "outcome" => outcome.label()
        )
        .increment(1);
        histogram!("relay_dispatcher_handle_duration_ms", "topic" => route.topic.clone())
            .record(started.elapsed().as_secs_f64() * 1000.0);

        Some(outcome)
    }

    async fn run_route(&self, route: &Route, request: &Envelope, correlation_id: Option<CorrelationId>) -> Outcome {
        let Some(handler) = self.handlers.get(&route.handler) else {
            return Outcome::Failed(RelayError::Internal(format!("handler {} is not registered", route.handler)));
        };

        let mut ctx = HandlerContext::new(&route.topic, correlation_id.clone())
            .with_metadata(request.metadata.clone());
        if let (RouteMode::Streaming { event_topic }, Some(id)) = (&route.mode, correlation_id) {
            ctx = ctx.with_chunks(ChunkPublisher::new(self.broker.clone(), event_topic, id));
        }

        self.invoke(route, handler.as_ref(), request, &ctx).await
    }

    async fn invoke(&self, route: &Route, handler: &dyn Handler, request: &Envelope, ctx: &HandlerContext) -> Outcome {
        if let Err(e) = handler.validate(request) {
            debug!(handler = handler.name(), "输入校验失败: {}", e);
            return Outcome::from_result(Err(e));
        }

        let breaker = route
            .dependency
            .as_deref()
            .and_then(|dependency| self.breakers.get(dependency));
        let breaker = breaker.as_deref();

        let attempt = move || async move {
            match breaker {
                Some(breaker) => breaker.execute(|| handler.handle(request, ctx)).await,
                None => handler.handle(request, ctx).await,
            }
        };
        // 已经发出分片的流式请求不再重试，避免客户端收到重复内容
        let result = self
            .settings
            .retry
            .execute_with_retry_if(attempt, |err| err.is_retryable() && ctx.chunks_emitted() == 0)
            .await;

        match &result {
            Err(RelayError::CircuitOpen { dependency }) => {
                warn!(handler = handler.name(), dependency = %dependency, "熔断器打开，拒绝执行");
            }
            Err(e) => error!(handler = handler.name(), "消息处理失败: {}", e),
            Ok(_) => {}
        }
        Outcome::from_result(result)
    }

    async fn publish_outcome(&self, route: &Route, outcome: &Outcome, correlation_id: CorrelationId) {
        let (topic, reply) = match &route.mode {
            RouteMode::RequestResponse { reply_topic } => {
                (reply_topic, outcome.to_reply(Some(correlation_id.clone())))
            }
            RouteMode::Streaming { event_topic } => {
                (event_topic, outcome.to_terminal_event(correlation_id.clone()))
            }
            RouteMode::FireAndForget => {
                if !outcome.is_success() {
                    warn!(correlation_id = %correlation_id, outcome = outcome.label(), "消息处理未成功");
                }
                return;
            }
        };

        if let Err(e) = self
            .broker
            .publish(topic, Some(correlation_id.as_str()), &reply)
            .await
        {
            error!(correlation_id = %correlation_id, reply_topic = %topic, "发布响应失败: {}", e);
        }
    }
}
