//! Handler outcome → reply shaping

use serde_json::{Map, Value};

use relay_core::{CorrelationId, Envelope, RelayError, StreamEventKind};

/// Result of running one record through validation, breaker and retry.
#[derive(Debug)]
pub enum Outcome {
    /// Handler returned; the value may still be a structured `{success: false}`
    Completed(Value),
    /// Input validation failed before the breaker was consulted
    Rejected(String),
    /// Breaker denied the call; the handler was not invoked
    CircuitOpen { dependency: String },
    /// Handler error after retries were exhausted or not allowed
    Failed(RelayError),
}

impl Outcome {
    pub fn from_result(result: Result<Value, RelayError>) -> Self {
        match result {
            Ok(value) => Outcome::Completed(value),
            Err(RelayError::Validation(message)) => Outcome::Rejected(message),
            Err(RelayError::CircuitOpen { dependency }) => Outcome::CircuitOpen { dependency },
            Err(err) => Outcome::Failed(err),
        }
    }

    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Completed(value) if reported_failure(value) => "handler_failure",
            Outcome::Completed(_) => "ok",
            Outcome::Rejected(_) => "rejected",
            Outcome::CircuitOpen { .. } => "circuit_open",
            Outcome::Failed(_) => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        self.label() == "ok"
    }

    /// Reply published to a request/response topic.
    pub fn to_reply(&self, correlation_id: Option<CorrelationId>) -> Envelope {
        match self {
            Outcome::Completed(Value::Object(body)) => {
                let mut body = body.clone();
                body.remove("correlation_id");
                if body
                    .get("event")
                    .and_then(Value::as_str)
                    .and_then(StreamEventKind::parse)
                    .is_some()
                {
                    body.remove("event");
                }
                let mut reply = Envelope::new(body);
                reply.correlation_id = correlation_id;
                reply
            }
            Outcome::Completed(other) => {
                let mut body = Map::new();
                body.insert("success".to_string(), Value::Bool(true));
                body.insert("result".to_string(), other.clone());
                let mut reply = Envelope::new(body);
                reply.correlation_id = correlation_id;
                reply
            }
            Outcome::Rejected(message) => Envelope::failure(correlation_id, message.clone()),
            Outcome::CircuitOpen { dependency } => {
                let error = RelayError::CircuitOpen {
                    dependency: dependency.clone(),
                };
                with_retryable(Envelope::failure(correlation_id, error.public_message()))
            }
            Outcome::Failed(err) => {
                let reply = Envelope::failure(correlation_id, err.public_message());
                if err.is_retryable_hint() {
                    with_retryable(reply)
                } else {
                    reply
                }
            }
        }
    }

    /// Terminal event closing a streaming request: `done`, or one `error`.
    pub fn to_terminal_event(&self, correlation_id: CorrelationId) -> Envelope {
        match self {
            Outcome::Completed(value) if reported_failure(value) => {
                let error = value
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("request failed");
                Envelope::error(correlation_id, error)
            }
            Outcome::Completed(_) => Envelope::done(correlation_id),
            Outcome::Rejected(message) => Envelope::error(correlation_id, message.clone()),
            Outcome::CircuitOpen { dependency } => Envelope::error(
                correlation_id,
                RelayError::CircuitOpen {
                    dependency: dependency.clone(),
                }
                .public_message(),
            ),
            Outcome::Failed(err) => Envelope::error(correlation_id, err.public_message()),
        }
    }
}

/// `success: false` or `ok: false` in a handler result
fn reported_failure(value: &Value) -> bool {
    value
        .get("success")
        .or_else(|| value.get("ok"))
        .and_then(Value::as_bool)
        == Some(false)
}

fn with_retryable(mut reply: Envelope) -> Envelope {
    reply.body.insert("retryable".to_string(), Value::Bool(true));
    reply
}
