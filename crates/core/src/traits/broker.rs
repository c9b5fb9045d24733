use std::time::Duration;

use async_trait::async_trait;

use crate::{models::Envelope, RelayResult};

/// Where a brand-new consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartOffset {
    /// Only records published after the group exists
    #[default]
    Latest,
    /// Everything still retained on the topic
    Earliest,
}

/// 订阅参数
#[derive(Debug, Clone)]
pub struct Subscription {
    pub topics: Vec<String>,
    pub group: String,
    pub start: StartOffset,
    /// Ephemeral groups are private to one consumer and deleted on close.
    pub ephemeral: bool,
}

impl Subscription {
    /// A shared, durable group starting from the oldest retained record.
    pub fn shared(topics: Vec<String>, group: impl Into<String>) -> Self {
        Self {
            topics,
            group: group.into(),
            start: StartOffset::Earliest,
            ephemeral: false,
        }
    }

    /// A private group that only sees records published from now on.
    pub fn ephemeral(topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            topics: vec![topic.into()],
            group: group.into(),
            start: StartOffset::Latest,
            ephemeral: true,
        }
    }
}

/// A consumed record.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerRecord {
    pub topic: String,
    pub key: Option<String>,
    pub envelope: Envelope,
}

/// Consumer group as reported by the broker, used for ephemeral-group expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupInfo {
    pub name: String,
    pub consumers: usize,
    /// Smallest idle time across the group's consumers, `None` when it has none.
    pub idle: Option<Duration>,
}

/// 消息总线抽象接口
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Appends `envelope` to `topic`; `key` is carried for key-consistent partitioning.
    async fn publish(&self, topic: &str, key: Option<&str>, envelope: &Envelope) -> RelayResult<()>;

    /// Opens a consumer for `subscription`, creating its group when needed.
    async fn subscribe(&self, subscription: Subscription) -> RelayResult<Box<dyn BrokerConsumer>>;

    async fn list_groups(&self, topic: &str) -> RelayResult<Vec<GroupInfo>>;

    async fn delete_group(&self, topic: &str, group: &str) -> RelayResult<()>;

    /// Backend name for logs and health output.
    fn backend(&self) -> &'static str;
}

/// A single consumer in a group. Records are committed as they are returned.
#[async_trait]
pub trait BrokerConsumer: Send {
    /// Returns up to `max_records`, waiting at most `wait` when nothing is available.
    async fn poll(&mut self, max_records: usize, wait: Duration) -> RelayResult<Vec<BrokerRecord>>;

    /// Leaves the group; ephemeral groups are deleted.
    async fn close(self: Box<Self>) -> RelayResult<()>;

    fn group(&self) -> &str;
}
