use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use relay_core::{CorrelationId, Envelope, MessageBroker, RelayError, RelayResult};

/// 消息处理器
///
/// A handler returns a JSON object carrying a `success` (or `ok`) boolean and,
/// on failure, an `error` string. Returning `Err` means a dependency failed:
/// the error is counted by the route's circuit breaker and may be retried.
/// Problems with the caller's input belong in `validate` or in a structured
/// `{success: false}` result, never in `Err`.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    /// Checked before the breaker; a `Validation` error short-circuits the record.
    fn validate(&self, _request: &Envelope) -> RelayResult<()> {
        Ok(())
    }

    async fn handle(&self, request: &Envelope, ctx: &HandlerContext) -> RelayResult<Value>;
}

/// Publishes `chunk` events for one streaming request.
pub struct ChunkPublisher {
    broker: Arc<dyn MessageBroker>,
    topic: String,
    correlation_id: CorrelationId,
    emitted: AtomicUsize,
}

impl ChunkPublisher {
    pub fn new(broker: Arc<dyn MessageBroker>, topic: impl Into<String>, correlation_id: CorrelationId) -> Self {
        Self {
            broker,
            topic: topic.into(),
            correlation_id,
            emitted: AtomicUsize::new(0),
        }
    }

    pub async fn send(&self, text: &str) -> RelayResult<()> {
        let chunk = Envelope::chunk(self.correlation_id.clone(), text);
        self.broker
            .publish(&self.topic, Some(self.correlation_id.as_str()), &chunk)
            .await?;
        self.emitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn emitted(&self) -> usize {
        self.emitted.load(Ordering::Relaxed)
    }
}

/// 处理上下文
pub struct HandlerContext {
    pub topic: String,
    pub correlation_id: Option<CorrelationId>,
    pub metadata: BTreeMap<String, String>,
    chunks: Option<ChunkPublisher>,
}

impl HandlerContext {
    pub fn new(topic: impl Into<String>, correlation_id: Option<CorrelationId>) -> Self {
        Self {
            topic: topic.into(),
            correlation_id,
            metadata: BTreeMap::new(),
            chunks: None,
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_chunks(mut self, chunks: ChunkPublisher) -> Self {
        self.chunks = Some(chunks);
        self
    }

    pub fn is_streaming(&self) -> bool {
        self.chunks.is_some()
    }

    /// 发送一个流式分片
    pub async fn emit_chunk(&self, text: &str) -> RelayResult<()> {
        match &self.chunks {
            Some(chunks) => chunks.send(text).await,
            None => Err(RelayError::Internal(format!(
                "route for {} does not stream",
                self.topic
            ))),
        }
    }

    pub fn chunks_emitted(&self) -> usize {
        self.chunks.as_ref().map_or(0, ChunkPublisher::emitted)
    }

    pub fn access_token(&self) -> Option<&str> {
        self.metadata
            .get("access_token")
            .map(String::as_str)
            .filter(|token| !token.is_empty())
    }
}
