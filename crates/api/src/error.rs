use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{error, warn};

use relay_core::RelayError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("中继错误: {0}")]
    Relay(#[from] RelayError),

    /// The handler answered with `success: false`
    #[error("处理失败: {0}")]
    Upstream(String),

    #[error("服务暂不可用: {0}")]
    Unavailable(String),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("未找到资源")]
    NotFound,
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::Relay(err) => {
                let (status, code) = match err {
                    RelayError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
                    RelayError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
                    RelayError::CircuitOpen { .. } => (StatusCode::SERVICE_UNAVAILABLE, "CIRCUIT_OPEN"),
                    RelayError::NotStarted(_) | RelayError::Cancelled => {
                        (StatusCode::SERVICE_UNAVAILABLE, "NOT_READY")
                    }
                    RelayError::TransientDependency { .. } => (StatusCode::BAD_GATEWAY, "DEPENDENCY_ERROR"),
                    RelayError::Broker(_)
                    | RelayError::Serialization(_)
                    | RelayError::Configuration(_)
                    | RelayError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
                };
                (status, code, err.public_message())
            }
            ApiError::Upstream(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "REQUEST_FAILED", msg.clone()),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", "resource not found".to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            error!("API错误: {} - {}", status, self);
        } else {
            warn!("API错误: {} - {}", status, self);
        }

        let body = Json(json!({
            "success": false,
            "error": message,
            "code": code,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
