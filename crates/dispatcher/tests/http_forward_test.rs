use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use relay_core::config::HandlerConfig;
use relay_core::{BrokerConsumer, CorrelationId, Envelope, MessageBroker, StreamEventKind, Subscription};
use relay_dispatcher::{ChunkPublisher, Handler, HandlerContext, HttpForwardHandler};
use relay_infrastructure::InMemoryBroker;

async fn echo(headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    Json(json!({"success": true, "received": body, "authorization": auth}))
}

async fn rejected() -> impl IntoResponse {
    (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({"detail": "period must be monthly"})))
}

async fn broken() -> impl IntoResponse {
    (StatusCode::BAD_GATEWAY, "upstream down")
}

async fn slow() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(3)).await;
    Json(json!({"success": true}))
}

async fn sse() -> impl IntoResponse {
    let body = concat!(
        "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hello\"}]}}]}\n\n",
        "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\", world\"}]}}]}\n\n",
        "data: [DONE]\n\n",
    );
    ([(header::CONTENT_TYPE, "text/event-stream")], body)
}

async fn spawn_server() -> String {
    let app = Router::new()
        .route("/echo", post(echo))
        .route("/rejected", post(rejected))
        .route("/broken", post(broken))
        .route("/slow", post(slow))
        .route("/sse", post(sse));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn handler(base: &str, path: &str, streaming: bool) -> HttpForwardHandler {
    let config = HandlerConfig {
        url: format!("{base}{path}"),
        streaming,
        timeout_seconds: 1,
        required_fields: Vec::new(),
        require_access_token: false,
    };
    HttpForwardHandler::new("budget", &config).unwrap()
}

#[tokio::test]
async fn test_success_forwards_body_and_token() {
    let base = spawn_server().await;
    let request = Envelope::from_value(json!({"userId": "u-1"}))
        .unwrap()
        .with_correlation_id(CorrelationId::from("c-1"))
        .with_metadata("access_token", "tok");
    let ctx = HandlerContext::new("budget_requests", request.correlation_id.clone())
        .with_metadata(request.metadata.clone());

    let result = handler(&base, "/echo", false).handle(&request, &ctx).await.unwrap();

    assert_eq!(result["success"], json!(true));
    assert_eq!(result["received"], json!({"userId": "u-1", "correlation_id": "c-1"}));
    assert_eq!(result["authorization"], json!("Bearer tok"));
}

#[tokio::test]
async fn test_client_error_becomes_structured_failure() {
    let base = spawn_server().await;
    let ctx = HandlerContext::new("budget_requests", None);

    let result = handler(&base, "/rejected", false)
        .handle(&Envelope::default(), &ctx)
        .await
        .unwrap();
    assert_eq!(result, json!({"success": false, "error": "period must be monthly"}));
}

#[tokio::test]
async fn test_server_error_and_timeout_are_transient() {
    let base = spawn_server().await;
    let ctx = HandlerContext::new("budget_requests", None);

    let err = handler(&base, "/broken", false)
        .handle(&Envelope::default(), &ctx)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(err.to_string().contains("502"));

    let err = handler(&base, "/slow", false)
        .handle(&Envelope::default(), &ctx)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_connection_failure_keeps_upstream_address_private() {
    // 绑定后立即释放端口，连接会被拒绝
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    let ctx = HandlerContext::new("budget_requests", None);

    let err = handler(&base, "/logic/budget-suggest", false)
        .handle(&Envelope::default(), &ctx)
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert!(!err.to_string().contains("/logic/budget-suggest"), "{err}");
    assert_eq!(err.public_message(), "budget request failed");
}

#[tokio::test]
async fn test_sse_fragments_become_chunks() {
    let base = spawn_server().await;
    let broker = Arc::new(InMemoryBroker::new());
    let id = CorrelationId::from("s-1");
    let ctx = HandlerContext::new("chat_requests", Some(id.clone()))
        .with_chunks(ChunkPublisher::new(broker.clone(), "chat_responses", id));

    let result = handler(&base, "/sse", true)
        .handle(&Envelope::default(), &ctx)
        .await
        .unwrap();
    assert_eq!(result, json!({"ok": true}));
    assert_eq!(ctx.chunks_emitted(), 2);

    let mut consumer: Box<dyn BrokerConsumer> = broker
        .subscribe(Subscription::shared(vec!["chat_responses".to_string()], "reader"))
        .await
        .unwrap();
    let texts: Vec<String> = consumer
        .poll(10, Duration::from_millis(20))
        .await
        .unwrap()
        .into_iter()
        .inspect(|record| assert_eq!(record.envelope.event, Some(StreamEventKind::Chunk)))
        .filter_map(|record| record.envelope.get_str("text").map(str::to_string))
        .collect();
    assert_eq!(texts, vec!["Hello", ", world"]);
}
