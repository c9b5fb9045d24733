pub mod api_observability;
pub mod app_config;
pub mod broker;
pub mod dispatcher;
pub mod resilience;

pub use api_observability::{ApiConfig, JanitorConfig, LogFormat, ObservabilityConfig};
pub use app_config::{AppConfig, ENV_PREFIX};
pub use broker::{BrokerConfig, BrokerType, RedisConfig, TopicsConfig};
pub use dispatcher::{
    default_handlers, DispatcherConfig, HandlerConfig, RetrySettings, RouteConfig, RouteModeKind,
};
pub use resilience::{BreakerSettings, ResilienceConfig};
