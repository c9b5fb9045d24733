use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use relay_core::config::{ApiConfig, JanitorConfig, TopicsConfig};
use relay_core::{GroupInfo, MessageBroker, RelayResult};

/// 消费组清理配置
#[derive(Debug, Clone)]
pub struct GroupJanitorConfig {
    pub enabled: bool,
    /// 清理间隔
    pub interval: Duration,
    /// 超过该空闲时间的消费组会被删除
    pub max_idle: Duration,
    pub topics: Vec<String>,
    /// Only groups whose name starts with one of these are considered
    pub group_prefixes: Vec<String>,
}

impl GroupJanitorConfig {
    pub fn from_config(janitor: &JanitorConfig, topics: &TopicsConfig, api: &ApiConfig) -> Self {
        Self {
            enabled: janitor.enabled,
            interval: Duration::from_secs(janitor.interval_seconds),
            max_idle: Duration::from_secs(janitor.max_idle_seconds),
            topics: topics.all().into_iter().map(str::to_string).collect(),
            group_prefixes: vec![
                api.rpc_group_prefix.clone(),
                api.stream_group_prefix.clone(),
            ],
        }
    }
}

/// 单次清理结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub inspected: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// 消费组清理服务
///
/// Removes ephemeral groups left behind by connections that went away without
/// closing their consumer (crashed process, killed pod). The dispatcher's
/// shared group never matches a prefix and is left alone.
///
/// A group without consumers has no idle time to judge by; it is only removed
/// when it is still empty on the following sweep.
pub struct GroupJanitor {
    broker: Arc<dyn MessageBroker>,
    config: GroupJanitorConfig,
    /// (topic, group) pairs seen without consumers on the previous sweep
    empty_groups: Mutex<HashSet<(String, String)>>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl GroupJanitor {
    pub fn new(broker: Arc<dyn MessageBroker>, config: GroupJanitorConfig) -> Self {
        Self {
            broker,
            config,
            empty_groups: Mutex::new(HashSet::new()),
            shutdown_tx: None,
            handle: None,
        }
    }

    fn is_ephemeral(&self, group: &GroupInfo) -> bool {
        self.config
            .group_prefixes
            .iter()
            .any(|prefix| group.name.starts_with(prefix.as_str()))
    }

    /// Ephemeral group whose consumers have all been idle past `max_idle`.
    pub fn is_stale(&self, group: &GroupInfo) -> bool {
        if !self.is_ephemeral(group) || group.consumers == 0 {
            return false;
        }
        matches!(group.idle, Some(idle) if idle > self.config.max_idle)
    }

    fn is_empty_ephemeral(&self, group: &GroupInfo) -> bool {
        self.is_ephemeral(group) && group.consumers == 0
    }

    pub async fn sweep_once(&self) -> RelayResult<SweepReport> {
        let mut report = SweepReport::default();
        let previously_empty = match self.empty_groups.lock() {
            Ok(mut empty) => std::mem::take(&mut *empty),
            Err(_) => HashSet::new(),
        };
        let mut empty_now = HashSet::new();

        for topic in &self.config.topics {
            let groups = match self.broker.list_groups(topic).await {
                Ok(groups) => groups,
                Err(e) => {
                    warn!(topic = %topic, "列出消费组失败: {}", e);
                    report.failed += 1;
                    continue;
                }
            };

            for group in groups {
                report.inspected += 1;
                let stale = if self.is_empty_ephemeral(&group) {
                    let entry = (topic.clone(), group.name.clone());
                    let seen_before = previously_empty.contains(&entry);
                    if !seen_before {
                        empty_now.insert(entry);
                    }
                    seen_before
                } else {
                    self.is_stale(&group)
                };
                if !stale {
                    continue;
                }
                match self.broker.delete_group(topic, &group.name).await {
                    Ok(()) => {
                        debug!(topic = %topic, group = %group.name, idle = ?group.idle, "已删除空闲消费组");
                        report.deleted += 1;
                    }
                    Err(e) => {
                        warn!(topic = %topic, group = %group.name, "删除消费组失败: {}", e);
                        report.failed += 1;
                    }
                }
            }
        }

        if let Ok(mut empty) = self.empty_groups.lock() {
            *empty = empty_now;
        }

        counter!("relay_janitor_groups_deleted_total").increment(report.deleted as u64);
        Ok(report)
    }

    /// 启动清理服务
    pub async fn start(&mut self) -> RelayResult<()> {
        if !self.config.enabled {
            info!("Group janitor is disabled");
            return Ok(());
        }
        if self.handle.is_some() {
            return Ok(());
        }

        info!(
            interval = ?self.config.interval,
            max_idle = ?self.config.max_idle,
            "Starting group janitor"
        );

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let janitor = GroupJanitor::new(self.broker.clone(), self.config.clone());
        let handle = tokio::spawn(async move {
            let mut ticker = interval(janitor.config.interval);
            // interval 的第一次 tick 立即返回
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match janitor.sweep_once().await {
                            Ok(report) if report.deleted > 0 || report.failed > 0 => {
                                info!(?report, "消费组清理完成");
                            }
                            Ok(_) => {}
                            Err(e) => error!("消费组清理失败: {}", e),
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("Group janitor shutdown requested");
                        break;
                    }
                }
            }
        });

        self.handle = Some(handle);
        Ok(())
    }

    /// 停止清理服务
    pub async fn stop(&mut self) -> RelayResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Error waiting for group janitor to stop: {}", e);
            }
        }
        info!("Group janitor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory_broker::InMemoryBroker;
    use relay_core::{BrokerConsumer, Subscription};

    fn config(max_idle: Duration) -> GroupJanitorConfig {
        GroupJanitorConfig {
            enabled: true,
            interval: Duration::from_millis(20),
            max_idle,
            topics: vec!["chat_responses".to_string()],
            group_prefixes: vec!["relay-stream".to_string()],
        }
    }

    #[test]
    fn test_is_stale_requires_prefix() {
        let janitor = GroupJanitor::new(Arc::new(InMemoryBroker::new()), config(Duration::from_secs(1)));
        let idle = GroupInfo {
            name: "relay-dispatcher".to_string(),
            consumers: 1,
            idle: Some(Duration::from_secs(100)),
        };
        assert!(!janitor.is_stale(&idle));

        let orphan = GroupInfo {
            name: "relay-stream-abc".to_string(),
            consumers: 1,
            idle: Some(Duration::from_secs(100)),
        };
        assert!(janitor.is_stale(&orphan));
    }

    #[tokio::test]
    async fn test_empty_group_survives_first_sweep() {
        let broker = Arc::new(InMemoryBroker::new());
        // 关闭非临时订阅后组仍在，但没有消费者
        let consumer = broker
            .subscribe(Subscription::shared(vec!["chat_responses".to_string()], "relay-stream-new"))
            .await
            .unwrap();
        consumer.close().await.unwrap();

        let janitor = GroupJanitor::new(broker.clone(), config(Duration::from_secs(60)));
        let first = janitor.sweep_once().await.unwrap();
        assert_eq!(first.deleted, 0);
        assert!(broker.group_exists("chat_responses", "relay-stream-new"));

        let second = janitor.sweep_once().await.unwrap();
        assert_eq!(second.deleted, 1);
        assert!(!broker.group_exists("chat_responses", "relay-stream-new"));
    }

    #[tokio::test]
    async fn test_sweep_deletes_idle_prefixed_groups() {
        let broker = Arc::new(InMemoryBroker::new());
        let _stale = broker
            .subscribe(Subscription::ephemeral("chat_responses", "relay-stream-old"))
            .await
            .unwrap();
        let _shared = broker
            .subscribe(Subscription::shared(vec!["chat_responses".to_string()], "relay-dispatcher"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let janitor = GroupJanitor::new(broker.clone(), config(Duration::from_millis(10)));
        let report = janitor.sweep_once().await.unwrap();

        assert_eq!(report.inspected, 2);
        assert_eq!(report.deleted, 1);
        assert!(!broker.group_exists("chat_responses", "relay-stream-old"));
        assert!(broker.group_exists("chat_responses", "relay-dispatcher"));
    }

    #[tokio::test]
    async fn test_sweep_keeps_recent_groups() {
        let broker = Arc::new(InMemoryBroker::new());
        let _fresh = broker
            .subscribe(Subscription::ephemeral("chat_responses", "relay-stream-new"))
            .await
            .unwrap();

        let janitor = GroupJanitor::new(broker.clone(), config(Duration::from_secs(60)));
        let report = janitor.sweep_once().await.unwrap();
        assert_eq!(report.deleted, 0);
        assert!(broker.group_exists("chat_responses", "relay-stream-new"));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let mut janitor = GroupJanitor::new(Arc::new(InMemoryBroker::new()), config(Duration::from_secs(60)));
        janitor.start().await.unwrap();
        janitor.stop().await.unwrap();
        janitor.stop().await.unwrap();
    }
}
