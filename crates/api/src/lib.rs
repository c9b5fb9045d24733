//! # relay-api
//!
//! HTTP 接入层。
//!
//! Turns synchronous HTTP calls into broker traffic:
//!
//! - `POST /api/budget/suggest`, `POST /api/ocr/process` wait on an
//!   [`RpcChannel`](relay_infrastructure::RpcChannel) for the correlated reply.
//! - `POST /api/chat/stream` and `GET /api/transactions/stream` hold an SSE
//!   connection fed by a [`StreamSession`](relay_infrastructure::StreamSession).
//! - `POST /api/transactions/create` publishes fire-and-forget.
//!
//! ```rust,no_run
//! # async fn example(state: relay_api::AppState, config: relay_core::config::ApiConfig) {
//! state.start().await.unwrap();
//! let app = relay_api::create_app(state, &config);
//! let listener = tokio::net::TcpListener::bind(&config.bind_address).await.unwrap();
//! axum::serve(listener, app).await.unwrap();
//! # }
//! ```

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;

use axum::Router;

use middleware::{cors_layer, request_logging, trace_layer};
use relay_core::config::ApiConfig;
use routes::create_routes;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

/// 创建完整的API应用
pub fn create_app(state: AppState, config: &ApiConfig) -> Router {
    let router = create_routes(state)
        .layer(axum::middleware::from_fn(request_logging))
        .layer(trace_layer());

    if config.cors_enabled {
        router.layer(cors_layer(&config.cors_origins))
    } else {
        router
    }
}
