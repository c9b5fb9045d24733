use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use metrics::gauge;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use relay_core::{
    BrokerConsumer, BrokerRecord, CorrelationId, MessageBroker, PushEvent, RelayResult, Subscription,
};

/// Which records of the topic belong to a session
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFilter {
    /// Streaming replies of one request; ends on `done` or `error`
    Correlation(CorrelationId),
    /// Every record whose body field `name` equals `value`; ends on disconnect
    Field { name: String, value: String },
}

impl StreamFilter {
    pub fn field(name: impl Into<String>, value: impl Into<String>) -> Self {
        StreamFilter::Field {
            name: name.into(),
            value: value.into(),
        }
    }

    fn matches(&self, record: &BrokerRecord) -> bool {
        match self {
            StreamFilter::Correlation(id) => match &record.envelope.correlation_id {
                Some(found) => found == id,
                None => record.key.as_deref() == Some(id.as_str()),
            },
            StreamFilter::Field { name, value } => match record.envelope.body.get(name) {
                Some(Value::String(found)) => found == value,
                Some(Value::Null) | None => false,
                Some(other) => other.to_string() == *value,
            },
        }
    }

    /// `None` for correlated records that carry no stream marker.
    fn to_event(&self, record: BrokerRecord) -> Option<PushEvent> {
        match self {
            StreamFilter::Correlation(_) => PushEvent::from_stream_envelope(&record.envelope),
            StreamFilter::Field { .. } => Some(PushEvent::Data(record.envelope.to_value())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamBridgeConfig {
    pub group_prefix: String,
    pub poll_wait: Duration,
    pub max_records: usize,
    /// Frames buffered between the pump and the push connection
    pub buffer: usize,
}

impl Default for StreamBridgeConfig {
    fn default() -> Self {
        Self {
            group_prefix: "relay-stream".to_string(),
            poll_wait: Duration::from_millis(500),
            max_records: 50,
            buffer: 64,
        }
    }
}

/// 消息总线到推送流的桥接
///
/// Every session gets its own ephemeral consumer group positioned at the
/// latest offset, so it only sees records published after `open` returned.
#[derive(Clone)]
pub struct StreamBridge {
    broker: Arc<dyn MessageBroker>,
    config: StreamBridgeConfig,
}

impl StreamBridge {
    pub fn new(broker: Arc<dyn MessageBroker>, config: StreamBridgeConfig) -> Self {
        Self { broker, config }
    }

    pub fn config(&self) -> &StreamBridgeConfig {
        &self.config
    }

    pub async fn open(&self, filter: StreamFilter, topic: &str) -> RelayResult<StreamSession> {
        let group = format!("{}-{}", self.config.group_prefix, Uuid::new_v4());
        let consumer = self
            .broker
            .subscribe(Subscription::ephemeral(topic, &group))
            .await?;

        let (tx, rx) = mpsc::channel(self.config.buffer.max(1));
        let (cancel_tx, cancel_rx) = oneshot::channel();

        debug!(topic, group = %group, ?filter, "推送会话已打开");
        gauge!("relay_stream_sessions_active").increment(1.0);
        tokio::spawn(pump(consumer, filter, self.config.clone(), tx, cancel_rx));

        Ok(StreamSession {
            group,
            rx,
            _cancel: cancel_tx,
        })
    }
}

/// An open push stream. Dropping it cancels the pump, which deletes the
/// session's consumer group.
pub struct StreamSession {
    group: String,
    rx: mpsc::Receiver<PushEvent>,
    _cancel: oneshot::Sender<()>,
}

impl StreamSession {
    pub fn group(&self) -> &str {
        &self.group
    }
}

impl Stream for StreamSession {
    type Item = PushEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

async fn pump(
    mut consumer: Box<dyn BrokerConsumer>,
    filter: StreamFilter,
    config: StreamBridgeConfig,
    tx: mpsc::Sender<PushEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let group = consumer.group().to_string();
    let mut forwarded = 0usize;

    'session: loop {
        let records = tokio::select! {
            _ = &mut cancel_rx => break 'session,
            polled = consumer.poll(config.max_records, config.poll_wait) => match polled {
                Ok(records) => records,
                Err(e) => {
                    warn!(group = %group, "推送会话拉取失败: {}", e);
                    let _ = tx.send(PushEvent::Error("stream interrupted".to_string())).await;
                    break 'session;
                }
            },
        };

        for record in records {
            if !filter.matches(&record) {
                continue;
            }
            let Some(event) = filter.to_event(record) else {
                debug!(group = %group, "跳过无事件标记的记录");
                continue;
            };
            let terminal = event.is_terminal();
            if tx.send(event).await.is_err() {
                break 'session;
            }
            forwarded += 1;
            if terminal {
                break 'session;
            }
            tokio::task::yield_now().await;
        }
    }

    if let Err(e) = consumer.close().await {
        warn!(group = %group, "关闭推送消费者失败: {}", e);
    }
    gauge!("relay_stream_sessions_active").decrement(1.0);
    info!(group = %group, forwarded, "推送会话已结束");
}
