use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use relay_core::{
    BrokerConsumer, CorrelationId, Envelope, MessageBroker, RelayError, RelayResult, Subscription,
};

/// Request/response topic pair served by one channel
#[derive(Debug, Clone)]
pub struct RpcChannelConfig {
    pub request_topic: String,
    pub response_topic: String,
    /// Prefix of the channel's private reply group
    pub group_prefix: String,
    pub poll_wait: Duration,
    pub max_records: usize,
}

impl RpcChannelConfig {
    pub fn new(request_topic: impl Into<String>, response_topic: impl Into<String>) -> Self {
        Self {
            request_topic: request_topic.into(),
            response_topic: response_topic.into(),
            group_prefix: "relay-rpc".to_string(),
            poll_wait: Duration::from_millis(500),
            max_records: 100,
        }
    }

    pub fn with_group_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.group_prefix = prefix.into();
        self
    }

    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }
}

type PendingMap = Mutex<HashMap<CorrelationId, oneshot::Sender<Envelope>>>;

/// Removes the pending entry on every exit path of `call`, including caller cancellation.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    correlation_id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.correlation_id);
        }
    }
}

struct ReplyLoop {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
    group: String,
}

/// 请求/响应通道
///
/// Lets a caller await the single reply to a request published on a one-way
/// topic. A background loop consumes the response topic through a private
/// consumer group and resolves pending calls by correlation id; replies for
/// unknown or already-resolved ids are dropped.
pub struct RpcChannel {
    name: String,
    broker: Arc<dyn MessageBroker>,
    config: RpcChannelConfig,
    pending: Arc<PendingMap>,
    started: AtomicBool,
    reply_loop: tokio::sync::Mutex<Option<ReplyLoop>>,
}

impl RpcChannel {
    pub fn new(name: impl Into<String>, broker: Arc<dyn MessageBroker>, config: RpcChannelConfig) -> Self {
        Self {
            name: name.into(),
            broker,
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
            started: AtomicBool::new(false),
            reply_loop: tokio::sync::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RpcChannelConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Subscribes the response topic and spawns the reply loop. Calling it
    /// again while running is a no-op.
    pub async fn start(&self) -> RelayResult<()> {
        let mut reply_loop = self.reply_loop.lock().await;
        if reply_loop.is_some() {
            return Ok(());
        }

        let group = format!("{}-{}", self.config.group_prefix, Uuid::new_v4());
        let consumer = self
            .broker
            .subscribe(Subscription::ephemeral(&self.config.response_topic, &group))
            .await?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_reply_loop(
            self.name.clone(),
            consumer,
            self.pending.clone(),
            self.config.clone(),
            stop_rx,
        ));

        info!(
            channel = %self.name,
            group = %group,
            response_topic = %self.config.response_topic,
            "RPC通道已启动"
        );
        *reply_loop = Some(ReplyLoop { stop_tx, task, group });
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Publishes `payload` under a fresh correlation id and waits for the matching reply.
    #[instrument(skip(self, payload), fields(channel = %self.name))]
    pub async fn call(&self, mut payload: Envelope, timeout: Duration) -> RelayResult<Envelope> {
        if !self.is_started() {
            return Err(RelayError::NotStarted(format!("rpc channel {}", self.name)));
        }

        let started = Instant::now();
        let correlation_id = CorrelationId::new();
        payload.correlation_id = Some(correlation_id.clone());

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|e| RelayError::Internal(format!("pending map poisoned: {e}")))?
            .insert(correlation_id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id: correlation_id.clone(),
        };

        self.broker
            .publish(&self.config.request_topic, Some(correlation_id.as_str()), &payload)
            .await?;
        debug!(correlation_id = %correlation_id, "请求已发布，等待响应");

        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RelayError::Cancelled),
            Err(_) => {
                warn!(correlation_id = %correlation_id, ?timeout, "等待响应超时");
                Err(RelayError::Timeout { timeout })
            }
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(RelayError::Timeout { .. }) => "timeout",
            Err(_) => "cancelled",
        };
        counter!("relay_rpc_calls_total", "channel" => self.name.clone(), "outcome" => outcome).increment(1);
        histogram!("relay_rpc_call_duration_ms", "channel" => self.name.clone())
            .record(started.elapsed().as_secs_f64() * 1000.0);

        result
    }

    /// Stops the reply loop, deletes its group and fails every in-flight call
    /// with `Cancelled`.
    pub async fn stop(&self) -> RelayResult<()> {
        let Some(reply_loop) = self.reply_loop.lock().await.take() else {
            return Ok(());
        };
        self.started.store(false, Ordering::Release);

        let _ = reply_loop.stop_tx.send(());
        if let Err(e) = reply_loop.task.await {
            warn!(channel = %self.name, "RPC响应循环异常退出: {}", e);
        }

        let dropped = match self.pending.lock() {
            Ok(mut pending) => {
                let count = pending.len();
                pending.clear();
                count
            }
            Err(_) => 0,
        };
        info!(channel = %self.name, group = %reply_loop.group, dropped, "RPC通道已停止");
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }
}

async fn run_reply_loop(
    name: String,
    mut consumer: Box<dyn BrokerConsumer>,
    pending: Arc<PendingMap>,
    config: RpcChannelConfig,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            polled = consumer.poll(config.max_records, config.poll_wait) => match polled {
                Ok(records) => {
                    for record in records {
                        resolve(&name, &pending, record.envelope);
                    }
                }
                Err(e) => {
                    warn!(channel = %name, "拉取响应失败: {}", e);
                    tokio::select! {
                        _ = &mut stop_rx => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
    }

    if let Err(e) = consumer.close().await {
        warn!(channel = %name, "关闭响应消费者失败: {}", e);
    }
}

fn resolve(name: &str, pending: &PendingMap, reply: Envelope) {
    let Some(correlation_id) = reply.correlation_id.clone() else {
        debug!(channel = %name, "响应缺少correlation_id，已丢弃");
        return;
    };

    let sender = match pending.lock() {
        Ok(mut pending) => pending.remove(&correlation_id),
        Err(_) => None,
    };
    match sender {
        Some(tx) => {
            let _ = tx.send(reply);
        }
        None => debug!(channel = %name, correlation_id = %correlation_id, "未知或已完成的correlation_id，已丢弃"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory_broker::InMemoryBroker;

    fn channel(broker: Arc<InMemoryBroker>) -> RpcChannel {
        RpcChannel::new(
            "budget",
            broker,
            RpcChannelConfig::new("budget_requests", "budget_responses").with_poll_wait(Duration::from_millis(20)),
        )
    }

    #[tokio::test]
    async fn test_call_before_start_fails() {
        let rpc = channel(Arc::new(InMemoryBroker::new()));
        let err = rpc
            .call(Envelope::default(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotStarted(_)));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let broker = Arc::new(InMemoryBroker::new());
        let rpc = channel(broker.clone());
        rpc.start().await.unwrap();
        rpc.start().await.unwrap();

        assert_eq!(broker.list_groups("budget_responses").await.unwrap().len(), 1);
        rpc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry() {
        let rpc = channel(Arc::new(InMemoryBroker::new()));
        rpc.start().await.unwrap();

        let err = rpc
            .call(Envelope::default(), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Timeout { .. }));
        assert_eq!(rpc.pending_count(), 0);
        rpc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_deletes_group_and_is_repeatable() {
        let broker = Arc::new(InMemoryBroker::new());
        let rpc = channel(broker.clone());
        rpc.start().await.unwrap();
        rpc.stop().await.unwrap();
        rpc.stop().await.unwrap();

        assert!(broker.list_groups("budget_responses").await.unwrap().is_empty());
        assert!(!rpc.is_started());
    }
}
