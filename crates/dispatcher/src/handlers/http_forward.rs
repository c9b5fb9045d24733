use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use relay_core::config::HandlerConfig;
use relay_core::{Envelope, RelayError, RelayResult};

use super::sse::SseTextDecoder;
use super::validation::RequiredFields;
use crate::handler::{Handler, HandlerContext};

/// HTTP转发处理器
///
/// POSTs the request body (plus its `correlation_id`) to the configured URL.
/// Network errors, timeouts and 5xx answers are dependency failures; 4xx
/// answers become structured failures; a 2xx JSON body is the result. In
/// streaming mode the body is read as SSE and every text fragment is emitted
/// as a chunk.
pub struct HttpForwardHandler {
    name: String,
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    streaming: bool,
    required: RequiredFields,
    require_access_token: bool,
}

impl HttpForwardHandler {
    pub fn new(name: impl Into<String>, config: &HandlerConfig) -> RelayResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RelayError::Configuration(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self::with_client(name, config, client))
    }

    pub fn with_client(name: impl Into<String>, config: &HandlerConfig, client: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            client,
            url: config.url.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
            streaming: config.streaming,
            required: RequiredFields::new(&config.required_fields),
            require_access_token: config.require_access_token,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn payload(request: &Envelope) -> Value {
        let mut body = request.body.clone();
        if let Some(correlation_id) = &request.correlation_id {
            body.insert("correlation_id".to_string(), json!(correlation_id));
        }
        Value::Object(body)
    }

    fn transient(&self, message: impl Into<String>) -> RelayError {
        RelayError::transient(&self.name, message)
    }

    async fn read_stream(&self, response: reqwest::Response, ctx: &HandlerContext) -> RelayResult<Value> {
        let mut decoder = SseTextDecoder::new();
        let mut body = response.bytes_stream();

        while let Some(bytes) = body.next().await {
            let bytes = bytes.map_err(|e| self.transient(format!("stream interrupted: {e}")))?;
            for fragment in decoder.push(&bytes) {
                ctx.emit_chunk(&fragment).await?;
            }
        }
        if let Some(fragment) = decoder.finish() {
            ctx.emit_chunk(&fragment).await?;
        }

        debug!(handler = %self.name, chunks = ctx.chunks_emitted(), "流式响应读取完成");
        Ok(json!({"ok": true}))
    }
}

#[async_trait]
impl Handler for HttpForwardHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, request: &Envelope) -> RelayResult<()> {
        self.required.check(request)?;
        if self.require_access_token
            && !matches!(request.metadata.get("access_token"), Some(token) if !token.is_empty())
        {
            return Err(RelayError::Validation("Authorization token is required".to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self, request, ctx), fields(handler = %self.name))]
    async fn handle(&self, request: &Envelope, ctx: &HandlerContext) -> RelayResult<Value> {
        let mut builder = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&Self::payload(request));
        if let Some(token) = ctx.access_token() {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| {
                warn!(url = %self.url, "转发请求失败: {}", e);
                self.transient(e.without_url().to_string())
            })?;
        let status = response.status();

        if status.is_server_error() {
            return Err(self.transient(format!("HTTP {}", status.as_u16())));
        }
        if status.is_client_error() {
            let error = client_error_message(status, response.text().await.unwrap_or_default());
            info!(status = status.as_u16(), "处理服务拒绝了请求: {}", error);
            return Ok(json!({"success": false, "error": error}));
        }

        if self.streaming && ctx.is_streaming() {
            return self.read_stream(response, ctx).await;
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| self.transient(format!("invalid response body: {e}")))
    }
}

/// Uses the body's `error`/`detail`/`message` when the service sent JSON.
fn client_error_message(status: StatusCode, body: String) -> String {
    let from_json = serde_json::from_str::<Value>(&body).ok().and_then(|value| {
        ["error", "detail", "message"]
            .iter()
            .find_map(|field| value.get(*field).and_then(Value::as_str).map(str::to_string))
    });
    from_json.unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::CorrelationId;

    fn config(required: &[&str], token: bool) -> HandlerConfig {
        HandlerConfig {
            url: "http://127.0.0.1:9/logic".to_string(),
            streaming: false,
            timeout_seconds: 1,
            required_fields: required.iter().map(|s| s.to_string()).collect(),
            require_access_token: token,
        }
    }

    #[test]
    fn test_validate_requires_token() {
        let handler = HttpForwardHandler::new("ocr", &config(&["image_url|image_data"], true)).unwrap();
        let request = Envelope::from_value(json!({"image_url": "https://x/y.png"})).unwrap();

        let err = handler.validate(&request).unwrap_err();
        assert!(matches!(err, RelayError::Validation(msg) if msg == "Authorization token is required"));

        let request = request.with_metadata("access_token", "t-1");
        assert!(handler.validate(&request).is_ok());
    }

    #[test]
    fn test_payload_includes_correlation_id_but_not_metadata() {
        let request = Envelope::from_value(json!({"message": "hi"}))
            .unwrap()
            .with_correlation_id(CorrelationId::from("c-9"))
            .with_metadata("access_token", "secret");
        assert_eq!(
            HttpForwardHandler::payload(&request),
            json!({"message": "hi", "correlation_id": "c-9"})
        );
    }

    #[test]
    fn test_client_error_message() {
        assert_eq!(
            client_error_message(StatusCode::BAD_REQUEST, r#"{"detail":"period must be monthly"}"#.to_string()),
            "period must be monthly"
        );
        assert_eq!(
            client_error_message(StatusCode::NOT_FOUND, "<html>".to_string()),
            "HTTP 404"
        );
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let handler = HttpForwardHandler::new("budget", &config(&[], false)).unwrap();
        let ctx = HandlerContext::new("budget_requests", None);
        let err = handler.handle(&Envelope::default(), &ctx).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
