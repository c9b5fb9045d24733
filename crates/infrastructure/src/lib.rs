pub mod broker_factory;
pub mod group_janitor;
pub mod in_memory_broker;
pub mod metrics_collector;
pub mod redis_stream;
pub mod rpc_channel;
pub mod stream_bridge;

pub use broker_factory::BrokerFactory;
pub use group_janitor::{GroupJanitor, GroupJanitorConfig, SweepReport};
pub use in_memory_broker::{InMemoryBroker, InMemoryBrokerConfig};
pub use metrics_collector::{BrokerMetrics, MetricsSnapshot};
pub use redis_stream::{RedisStreamBroker, RedisStreamConfig};
pub use rpc_channel::{RpcChannel, RpcChannelConfig};
pub use stream_bridge::{StreamBridge, StreamBridgeConfig, StreamFilter, StreamSession};
