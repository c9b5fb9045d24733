use std::time::Duration;

use axum::{extract::State, http::HeaderMap, Json};
use serde_json::Value;
use tracing::{info, warn};

use relay_core::Envelope;
use relay_infrastructure::RpcChannel;

use super::request_envelope;
use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub async fn budget_suggest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let timeout = state.budget_timeout();
    relay_call(&state.budget_rpc, body, &headers, timeout, "budget-suggest failed").await
}

pub async fn ocr_process(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let timeout = state.ocr_timeout();
    relay_call(&state.ocr_rpc, body, &headers, timeout, "ocr-process failed").await
}

async fn relay_call(
    channel: &RpcChannel,
    body: Value,
    headers: &HeaderMap,
    timeout: Duration,
    fallback_error: &str,
) -> ApiResult<Json<Value>> {
    let request = request_envelope(body, headers)?;
    let reply = channel.call(request, timeout).await?;
    info!(channel = channel.name(), success = ?reply.succeeded(), "收到RPC响应");
    reply_to_response(reply, fallback_error).map(Json)
}

/// A reply carrying `success: false` (or `ok: false`) becomes an error response.
fn reply_to_response(reply: Envelope, fallback_error: &str) -> ApiResult<Value> {
    if reply.succeeded() == Some(false) {
        let message = reply.error_message().unwrap_or(fallback_error).to_string();
        let retryable = reply
            .body
            .get("retryable")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        warn!(retryable, "RPC处理失败: {}", message);
        return Err(if retryable {
            ApiError::Unavailable(message)
        } else {
            ApiError::Upstream(message)
        });
    }
    Ok(Value::Object(reply.body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_failed_reply_mapping() {
        let reply = Envelope::from_value(json!({"success": false})).unwrap();
        match reply_to_response(reply, "budget-suggest failed") {
            Err(ApiError::Upstream(msg)) => assert_eq!(msg, "budget-suggest failed"),
            other => panic!("unexpected: {other:?}"),
        }

        let reply = Envelope::from_value(json!({
            "success": false,
            "error": "gemini service temporarily unavailable",
            "retryable": true
        }))
        .unwrap();
        assert!(matches!(
            reply_to_response(reply, "budget-suggest failed"),
            Err(ApiError::Unavailable(_))
        ));
    }

    #[test]
    fn test_successful_reply_passes_through() {
        let reply = Envelope::from_value(json!({"success": true, "suggestions": [1, 2]}))
            .unwrap()
            .with_correlation_id("c-1".into());
        let value = reply_to_response(reply, "ocr-process failed").unwrap();
        assert_eq!(value, json!({"success": true, "suggestions": [1, 2]}));
    }
}
