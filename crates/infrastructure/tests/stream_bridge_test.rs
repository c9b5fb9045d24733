use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tokio::time::timeout;

use relay_core::{CorrelationId, Envelope, MessageBroker, PushEvent};
use relay_infrastructure::{InMemoryBroker, StreamBridge, StreamBridgeConfig, StreamFilter};

const CHAT_RESPONSES: &str = "chat_responses";

fn bridge(broker: Arc<InMemoryBroker>) -> StreamBridge {
    StreamBridge::new(
        broker,
        StreamBridgeConfig {
            poll_wait: Duration::from_millis(20),
            ..Default::default()
        },
    )
}

async fn wait_for_group_removal(broker: &InMemoryBroker, topic: &str, group: &str) -> bool {
    for _ in 0..100 {
        if !broker.group_exists(topic, group) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_chunks_arrive_in_order_and_done_ends_session() {
    let broker = Arc::new(InMemoryBroker::new());
    let id = CorrelationId::from("chat-1");
    let mut session = bridge(broker.clone())
        .open(StreamFilter::Correlation(id.clone()), CHAT_RESPONSES)
        .await
        .unwrap();
    let group = session.group().to_string();

    for text in ["Hel", "lo", "!"] {
        broker
            .publish(CHAT_RESPONSES, Some(id.as_str()), &Envelope::chunk(id.clone(), text))
            .await
            .unwrap();
    }
    // Same id but no stream marker: not part of the push protocol.
    let unmarked = Envelope::from_value(json!({"text": "raw", "success": true}))
        .unwrap()
        .with_correlation_id(id.clone());
    broker
        .publish(CHAT_RESPONSES, Some(id.as_str()), &unmarked)
        .await
        .unwrap();
    // Another request's chunk interleaved on the same topic.
    let other = CorrelationId::from("chat-2");
    broker
        .publish(CHAT_RESPONSES, Some(other.as_str()), &Envelope::chunk(other.clone(), "noise"))
        .await
        .unwrap();
    broker
        .publish(CHAT_RESPONSES, Some(id.as_str()), &Envelope::done(id.clone()))
        .await
        .unwrap();

    let events: Vec<PushEvent> = timeout(Duration::from_secs(2), session.by_ref().collect())
        .await
        .unwrap();
    assert_eq!(
        events,
        vec![
            PushEvent::Text("Hel".to_string()),
            PushEvent::Text("lo".to_string()),
            PushEvent::Text("!".to_string()),
            PushEvent::Done,
        ]
    );

    assert!(wait_for_group_removal(&broker, CHAT_RESPONSES, &group).await);
}

#[tokio::test]
async fn test_error_event_is_terminal() {
    let broker = Arc::new(InMemoryBroker::new());
    let id = CorrelationId::from("chat-err");
    let mut session = bridge(broker.clone())
        .open(StreamFilter::Correlation(id.clone()), CHAT_RESPONSES)
        .await
        .unwrap();

    broker
        .publish(CHAT_RESPONSES, None, &Envelope::error(id.clone(), "model unavailable"))
        .await
        .unwrap();
    broker
        .publish(CHAT_RESPONSES, None, &Envelope::chunk(id, "ignored"))
        .await
        .unwrap();

    let first = timeout(Duration::from_secs(2), session.next()).await.unwrap();
    assert_eq!(first, Some(PushEvent::Error("model unavailable".to_string())));
    let second = timeout(Duration::from_secs(2), session.next()).await.unwrap();
    assert_eq!(second, None);
}

#[tokio::test]
async fn test_records_before_open_are_not_delivered() {
    let broker = Arc::new(InMemoryBroker::new());
    let id = CorrelationId::from("chat-3");
    broker
        .publish(CHAT_RESPONSES, None, &Envelope::chunk(id.clone(), "stale"))
        .await
        .unwrap();

    let mut session = bridge(broker.clone())
        .open(StreamFilter::Correlation(id.clone()), CHAT_RESPONSES)
        .await
        .unwrap();
    broker
        .publish(CHAT_RESPONSES, None, &Envelope::chunk(id.clone(), "fresh"))
        .await
        .unwrap();

    let first = timeout(Duration::from_secs(2), session.next()).await.unwrap();
    assert_eq!(first, Some(PushEvent::Text("fresh".to_string())));
}

#[tokio::test]
async fn test_field_session_forwards_matching_records() {
    let broker = Arc::new(InMemoryBroker::new());
    let mut session = bridge(broker.clone())
        .open(StreamFilter::field("user_id", "u-1"), "transactions")
        .await
        .unwrap();

    for (user, amount) in [("u-2", 5), ("u-1", 10), ("u-1", 20)] {
        let record = Envelope::from_value(json!({"user_id": user, "amount": amount})).unwrap();
        broker.publish("transactions", None, &record).await.unwrap();
    }

    let events: Vec<PushEvent> = timeout(Duration::from_secs(2), session.by_ref().take(2).collect())
        .await
        .unwrap();
    assert_eq!(
        events,
        vec![
            PushEvent::Data(json!({"user_id": "u-1", "amount": 10})),
            PushEvent::Data(json!({"user_id": "u-1", "amount": 20})),
        ]
    );
}

#[tokio::test]
async fn test_dropping_session_deletes_group() {
    let broker = Arc::new(InMemoryBroker::new());
    let session = bridge(broker.clone())
        .open(StreamFilter::field("user_id", "u-1"), "transactions")
        .await
        .unwrap();
    let group = session.group().to_string();
    assert!(broker.group_exists("transactions", &group));

    drop(session);
    assert!(wait_for_group_removal(&broker, "transactions", &group).await);
}
