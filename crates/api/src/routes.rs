use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers::{
    health::health_check,
    metrics::render_metrics,
    rpc::{budget_suggest, ocr_process},
    stream::chat_stream,
    transactions::{create_transaction, transactions_stream},
};
use crate::state::AppState;

/// 创建路由
pub fn create_routes(state: AppState) -> Router {
    let metrics_path = state.metrics_path.clone();
    Router::new()
        // 健康检查
        .route("/health", get(health_check))
        .route(&metrics_path, get(render_metrics))
        // 请求/响应
        .route("/api/budget/suggest", post(budget_suggest))
        .route("/api/ocr/process", post(ocr_process))
        // 推送
        .route("/api/chat/stream", post(chat_stream))
        .route("/api/transactions/create", post(create_transaction))
        .route("/api/transactions/stream", get(transactions_stream))
        .with_state(state)
}
