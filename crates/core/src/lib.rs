pub mod circuit_breaker;
pub mod config;
pub mod errors;
pub mod models;
pub mod retry;
pub mod traits;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats, CircuitState};
pub use errors::{RelayError, RelayResult};
pub use models::{CorrelationId, Envelope, PushEvent, StreamEventKind};
pub use retry::RetryPolicy;
pub use traits::{BrokerConsumer, BrokerRecord, GroupInfo, MessageBroker, StartOffset, Subscription};
