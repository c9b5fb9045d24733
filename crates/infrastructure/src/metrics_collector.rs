use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use metrics::{counter, histogram};

/// 消息总线性能监控指标
///
/// Atomic counters for in-process inspection, mirrored to the `metrics`
/// recorder under the `relay_broker_*` names with a `backend` label.
#[derive(Debug, Clone)]
pub struct BrokerMetrics {
    backend: &'static str,
    pub messages_published: Arc<AtomicU64>,
    pub messages_consumed: Arc<AtomicU64>,
    pub publish_errors: Arc<AtomicU64>,
    pub malformed_records: Arc<AtomicU64>,
    pub connection_errors: Arc<AtomicU64>,
    pub groups_deleted: Arc<AtomicU64>,
}

impl BrokerMetrics {
    pub fn new(backend: &'static str) -> Self {
        Self {
            backend,
            messages_published: Arc::new(AtomicU64::new(0)),
            messages_consumed: Arc::new(AtomicU64::new(0)),
            publish_errors: Arc::new(AtomicU64::new(0)),
            malformed_records: Arc::new(AtomicU64::new(0)),
            connection_errors: Arc::new(AtomicU64::new(0)),
            groups_deleted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_published(&self, topic: &str, duration_ms: f64) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        counter!(
            "relay_broker_messages_published_total",
            "backend" => self.backend,
            "topic" => topic.to_string()
        )
        .increment(1);
        histogram!("relay_broker_publish_duration_ms", "backend" => self.backend).record(duration_ms);
    }

    pub fn record_consumed(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.messages_consumed.fetch_add(count, Ordering::Relaxed);
        counter!("relay_broker_messages_consumed_total", "backend" => self.backend).increment(count);
    }

    pub fn record_publish_error(&self) {
        self.publish_errors.fetch_add(1, Ordering::Relaxed);
        counter!("relay_broker_publish_errors_total", "backend" => self.backend).increment(1);
    }

    pub fn record_malformed(&self) {
        self.malformed_records.fetch_add(1, Ordering::Relaxed);
        counter!("relay_broker_malformed_records_total", "backend" => self.backend).increment(1);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
        counter!("relay_broker_connection_errors_total", "backend" => self.backend).increment(1);
    }

    pub fn record_group_deleted(&self) {
        self.groups_deleted.fetch_add(1, Ordering::Relaxed);
        counter!("relay_broker_groups_deleted_total", "backend" => self.backend).increment(1);
    }

    pub fn get_stats(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            messages_consumed: self.messages_consumed.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            malformed_records: self.malformed_records.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            groups_deleted: self.groups_deleted.load(Ordering::Relaxed),
        }
    }
}

/// 指标快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_published: u64,
    pub messages_consumed: u64,
    pub publish_errors: u64,
    pub malformed_records: u64,
    pub connection_errors: u64,
    pub groups_deleted: u64,
}
