use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info};

use relay_core::{
    BrokerConsumer, BrokerRecord, Envelope, GroupInfo, MessageBroker, RelayError, RelayResult,
    StartOffset, Subscription,
};

use crate::metrics_collector::BrokerMetrics;

/// 内存消息总线配置
#[derive(Debug, Clone)]
pub struct InMemoryBrokerConfig {
    /// Records kept per topic; older ones are dropped
    pub retention: usize,
}

impl Default for InMemoryBrokerConfig {
    fn default() -> Self {
        Self { retention: 10_000 }
    }
}

#[derive(Debug)]
struct StoredRecord {
    key: Option<String>,
    envelope: Envelope,
}

#[derive(Debug)]
struct GroupState {
    next_offset: u64,
    consumers: usize,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct TopicLog {
    /// Offset of `records[0]`
    base_offset: u64,
    records: VecDeque<StoredRecord>,
    groups: HashMap<String, GroupState>,
}

impl TopicLog {
    fn end_offset(&self) -> u64 {
        self.base_offset + self.records.len() as u64
    }
}

#[derive(Debug)]
struct Shared {
    config: InMemoryBrokerConfig,
    topics: Mutex<HashMap<String, TopicLog>>,
    notify: Notify,
    metrics: BrokerMetrics,
}

impl Shared {
    fn topics(&self) -> RelayResult<MutexGuard<'_, HashMap<String, TopicLog>>> {
        self.topics
            .lock()
            .map_err(|e| RelayError::Broker(format!("in-memory broker lock poisoned: {e}")))
    }
}

/// 内存消息总线
///
/// Append-only log per topic with per-group cursors, used for embedded
/// deployments and tests. Consumers of the same group share one cursor, so each
/// record is delivered to exactly one of them.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_config(InMemoryBrokerConfig::default())
    }

    pub fn with_config(config: InMemoryBrokerConfig) -> Self {
        info!(retention = config.retention, "初始化内存消息总线");
        Self {
            shared: Arc::new(Shared {
                config,
                topics: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                metrics: BrokerMetrics::new("in_memory"),
            }),
        }
    }

    pub fn metrics(&self) -> &BrokerMetrics {
        &self.shared.metrics
    }

    /// Records currently retained on `topic`.
    pub fn topic_len(&self, topic: &str) -> usize {
        self.shared
            .topics()
            .map(|topics| topics.get(topic).map_or(0, |log| log.records.len()))
            .unwrap_or(0)
    }

    pub fn group_exists(&self, topic: &str, group: &str) -> bool {
        self.shared
            .topics()
            .map(|topics| {
                topics
                    .get(topic)
                    .is_some_and(|log| log.groups.contains_key(group))
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, topic: &str, key: Option<&str>, envelope: &Envelope) -> RelayResult<()> {
        let start = Instant::now();
        {
            let mut topics = self.shared.topics()?;
            let log = topics.entry(topic.to_string()).or_default();
            log.records.push_back(StoredRecord {
                key: key.map(str::to_string),
                envelope: envelope.clone(),
            });
            while log.records.len() > self.shared.config.retention {
                log.records.pop_front();
                log.base_offset += 1;
            }
        }
        self.shared.notify.notify_waiters();
        self.shared
            .metrics
            .record_published(topic, start.elapsed().as_secs_f64() * 1000.0);
        debug!(topic, key, "消息已发布");
        Ok(())
    }

    async fn subscribe(&self, subscription: Subscription) -> RelayResult<Box<dyn BrokerConsumer>> {
        if subscription.topics.is_empty() {
            return Err(RelayError::Broker("subscription has no topics".to_string()));
        }

        {
            let mut topics = self.shared.topics()?;
            for topic in &subscription.topics {
                let log = topics.entry(topic.clone()).or_default();
                let start_offset = match subscription.start {
                    StartOffset::Latest => log.end_offset(),
                    StartOffset::Earliest => log.base_offset,
                };
                let group = log
                    .groups
                    .entry(subscription.group.clone())
                    .or_insert_with(|| GroupState {
                        next_offset: start_offset,
                        consumers: 0,
                        last_seen: Instant::now(),
                    });
                group.consumers += 1;
                group.last_seen = Instant::now();
            }
        }

        debug!(group = %subscription.group, topics = ?subscription.topics, "创建内存消费者");
        Ok(Box::new(InMemoryConsumer {
            shared: self.shared.clone(),
            subscription,
            next_topic: 0,
        }))
    }

    async fn list_groups(&self, topic: &str) -> RelayResult<Vec<GroupInfo>> {
        let topics = self.shared.topics()?;
        Ok(topics
            .get(topic)
            .map(|log| {
                log.groups
                    .iter()
                    .map(|(name, state)| GroupInfo {
                        name: name.clone(),
                        consumers: state.consumers,
                        idle: Some(state.last_seen.elapsed()),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_group(&self, topic: &str, group: &str) -> RelayResult<()> {
        let removed = {
            let mut topics = self.shared.topics()?;
            topics
                .get_mut(topic)
                .and_then(|log| log.groups.remove(group))
                .is_some()
        };
        if removed {
            self.shared.metrics.record_group_deleted();
            debug!(topic, group, "消费组已删除");
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "in_memory"
    }
}

/// Consumer handle of [`InMemoryBroker`]
pub struct InMemoryConsumer {
    shared: Arc<Shared>,
    subscription: Subscription,
    /// Rotates the first topic drained so one busy topic cannot starve the rest
    next_topic: usize,
}

impl InMemoryConsumer {
    fn drain(&mut self, max_records: usize) -> RelayResult<Vec<BrokerRecord>> {
        let mut topics = self.shared.topics()?;
        let mut out = Vec::new();
        let count = self.subscription.topics.len();

        for i in 0..count {
            if out.len() >= max_records {
                break;
            }
            let topic = &self.subscription.topics[(self.next_topic + i) % count];
            let Some(log) = topics.get_mut(topic) else {
                continue;
            };
            let base_offset = log.base_offset;
            let end_offset = log.end_offset();
            let Some(group) = log.groups.get_mut(&self.subscription.group) else {
                return Err(RelayError::Broker(format!(
                    "NOGROUP consumer group {} no longer exists on {}",
                    self.subscription.group, topic
                )));
            };
            group.last_seen = Instant::now();

            // Records dropped by retention are skipped.
            let mut offset = group.next_offset.max(base_offset);
            while offset < end_offset && out.len() < max_records {
                let record = &log.records[(offset - base_offset) as usize];
                out.push(BrokerRecord {
                    topic: topic.clone(),
                    key: record.key.clone(),
                    envelope: record.envelope.clone(),
                });
                offset += 1;
            }
            group.next_offset = offset;
        }

        self.next_topic = (self.next_topic + 1) % count.max(1);
        Ok(out)
    }
}

#[async_trait]
impl BrokerConsumer for InMemoryConsumer {
    async fn poll(&mut self, max_records: usize, wait: Duration) -> RelayResult<Vec<BrokerRecord>> {
        let deadline = tokio::time::Instant::now() + wait;
        let shared = self.shared.clone();

        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            // Register interest before draining so a concurrent publish is never missed.
            notified.as_mut().enable();

            let records = self.drain(max_records.max(1))?;
            if !records.is_empty() {
                self.shared.metrics.record_consumed(records.len() as u64);
                return Ok(records);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn close(self: Box<Self>) -> RelayResult<()> {
        let mut topics = self.shared.topics()?;
        for topic in &self.subscription.topics {
            let Some(log) = topics.get_mut(topic) else {
                continue;
            };
            if self.subscription.ephemeral {
                if log.groups.remove(&self.subscription.group).is_some() {
                    self.shared.metrics.record_group_deleted();
                }
            } else if let Some(group) = log.groups.get_mut(&self.subscription.group) {
                group.consumers = group.consumers.saturating_sub(1);
            }
        }
        debug!(group = %self.subscription.group, "内存消费者已关闭");
        Ok(())
    }

    fn group(&self) -> &str {
        &self.subscription.group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(n: i64) -> Envelope {
        Envelope::from_value(json!({ "n": n })).unwrap()
    }

    #[tokio::test]
    async fn test_latest_group_skips_history() {
        let broker = InMemoryBroker::new();
        broker.publish("t", None, &envelope(1)).await.unwrap();

        let mut consumer = broker
            .subscribe(Subscription::ephemeral("t", "g1"))
            .await
            .unwrap();
        broker.publish("t", Some("k"), &envelope(2)).await.unwrap();

        let records = consumer.poll(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].envelope.body["n"], 2);
        assert_eq!(records[0].key.as_deref(), Some("k"));
    }

    #[tokio::test]
    async fn test_earliest_group_reads_history() {
        let broker = InMemoryBroker::new();
        for n in 0..3 {
            broker.publish("t", None, &envelope(n)).await.unwrap();
        }

        let mut consumer = broker
            .subscribe(Subscription::shared(vec!["t".to_string()], "workers"))
            .await
            .unwrap();
        let records = consumer.poll(2, Duration::from_millis(10)).await.unwrap();
        assert_eq!(records.len(), 2);
        let records = consumer.poll(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].envelope.body["n"], 2);
    }

    #[tokio::test]
    async fn test_shared_group_delivers_each_record_once() {
        let broker = InMemoryBroker::new();
        let mut a = broker
            .subscribe(Subscription::shared(vec!["t".to_string()], "workers"))
            .await
            .unwrap();
        let mut b = broker
            .subscribe(Subscription::shared(vec!["t".to_string()], "workers"))
            .await
            .unwrap();

        for n in 0..4 {
            broker.publish("t", None, &envelope(n)).await.unwrap();
        }

        let first = a.poll(3, Duration::from_millis(10)).await.unwrap();
        let second = b.poll(3, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.len() + second.len(), 4);
    }

    #[tokio::test]
    async fn test_poll_wakes_on_publish() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker
            .subscribe(Subscription::ephemeral("t", "g"))
            .await
            .unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("t", None, &envelope(7)).await.unwrap();
        });

        let started = Instant::now();
        let records = consumer.poll(10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_poll_times_out_empty() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker
            .subscribe(Subscription::ephemeral("t", "g"))
            .await
            .unwrap();
        let records = consumer.poll(10, Duration::from_millis(20)).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_retention_drops_oldest() {
        let broker = InMemoryBroker::with_config(InMemoryBrokerConfig { retention: 2 });
        for n in 0..5 {
            broker.publish("t", None, &envelope(n)).await.unwrap();
        }
        assert_eq!(broker.topic_len("t"), 2);

        let mut consumer = broker
            .subscribe(Subscription::shared(vec!["t".to_string()], "late"))
            .await
            .unwrap();
        let records = consumer.poll(10, Duration::from_millis(10)).await.unwrap();
        let values: Vec<_> = records.iter().map(|r| r.envelope.body["n"].clone()).collect();
        assert_eq!(values, vec![json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn test_closing_ephemeral_consumer_deletes_group() {
        let broker = InMemoryBroker::new();
        let consumer = broker
            .subscribe(Subscription::ephemeral("t", "relay-stream-1"))
            .await
            .unwrap();
        assert!(broker.group_exists("t", "relay-stream-1"));

        consumer.close().await.unwrap();
        assert!(!broker.group_exists("t", "relay-stream-1"));
        assert_eq!(broker.metrics().get_stats().groups_deleted, 1);
    }

    #[tokio::test]
    async fn test_list_and_delete_groups() {
        let broker = InMemoryBroker::new();
        let _a = broker
            .subscribe(Subscription::ephemeral("t", "relay-rpc-a"))
            .await
            .unwrap();
        let _b = broker
            .subscribe(Subscription::shared(vec!["t".to_string()], "relay-dispatcher"))
            .await
            .unwrap();

        let mut names: Vec<_> = broker
            .list_groups("t")
            .await
            .unwrap()
            .into_iter()
            .map(|g| g.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["relay-dispatcher", "relay-rpc-a"]);

        broker.delete_group("t", "relay-rpc-a").await.unwrap();
        assert!(!broker.group_exists("t", "relay-rpc-a"));
        assert!(broker.list_groups("missing").await.unwrap().is_empty());
    }
}
