use std::time::Duration;

use thiserror::Error;

/// 中继错误类型定义
#[derive(Debug, Error)]
pub enum RelayError {
    /// Bad caller input. Never retried, never counted by a circuit breaker.
    #[error("输入校验失败: {0}")]
    Validation(String),

    /// Network, timeout or 5xx failure of an external dependency.
    #[error("依赖服务 {dependency} 调用失败: {message}")]
    TransientDependency { dependency: String, message: String },

    #[error("等待响应超时 ({timeout:?})")]
    Timeout { timeout: Duration },

    #[error("依赖服务 {dependency} 熔断中")]
    CircuitOpen { dependency: String },

    #[error("消息总线错误: {0}")]
    Broker(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("组件尚未启动: {0}")]
    NotStarted(String),

    #[error("调用已取消")]
    Cancelled,

    #[error("内部错误: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn transient(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientDependency {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    /// Whether a retry loop may attempt the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::TransientDependency { .. } | RelayError::Broker(_) | RelayError::Internal(_)
        )
    }

    /// Whether the failure should be recorded against a dependency's breaker.
    pub fn counts_against_breaker(&self) -> bool {
        !matches!(
            self,
            RelayError::Validation(_) | RelayError::CircuitOpen { .. } | RelayError::Cancelled
        )
    }

    /// Hint surfaced to end callers that the same request may succeed later.
    pub fn is_retryable_hint(&self) -> bool {
        matches!(
            self,
            RelayError::CircuitOpen { .. } | RelayError::Timeout { .. }
        )
    }

    /// Message safe to hand to an end caller: broker and internal detail is withheld.
    pub fn public_message(&self) -> String {
        match self {
            RelayError::Validation(msg) => msg.clone(),
            // 依赖的原始错误可能带有内部地址，只写日志
            RelayError::TransientDependency { dependency, .. } => format!("{dependency} request failed"),
            RelayError::Timeout { .. } => "request timed out".to_string(),
            RelayError::CircuitOpen { dependency } => {
                format!("{dependency} service temporarily unavailable")
            }
            RelayError::NotStarted(_) | RelayError::Cancelled => {
                "service not ready".to_string()
            }
            RelayError::Broker(_)
            | RelayError::Serialization(_)
            | RelayError::Configuration(_)
            | RelayError::Internal(_) => "internal error".to_string(),
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type RelayResult<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(RelayError::transient("ocr", "502").is_retryable());
        assert!(!RelayError::Validation("userId is required".into()).is_retryable());
        assert!(!RelayError::CircuitOpen { dependency: "ocr".into() }.is_retryable());
        assert!(!RelayError::Timeout { timeout: Duration::from_secs(1) }.is_retryable());
    }

    #[test]
    fn test_breaker_accounting() {
        assert!(RelayError::transient("gemini", "connection reset").counts_against_breaker());
        assert!(!RelayError::Validation("period is required".into()).counts_against_breaker());
        assert!(!RelayError::CircuitOpen { dependency: "gemini".into() }.counts_against_breaker());
    }

    #[test]
    fn test_public_message_hides_broker_detail() {
        let err = RelayError::Broker("XREADGROUP failed on 10.0.0.3:6379 stream=budget_responses".into());
        assert_eq!(err.public_message(), "internal error");

        let err = RelayError::transient(
            "gemini",
            "error sending request for url (http://10.0.0.7:8000/logic/chat-stream)",
        );
        assert_eq!(err.public_message(), "gemini request failed");

        let err = RelayError::CircuitOpen { dependency: "ocr".into() };
        assert_eq!(err.public_message(), "ocr service temporarily unavailable");
        assert!(err.is_retryable_hint());
    }
}
