use axum::{extract::State, Json};
use serde_json::{json, Map, Value};

use crate::state::AppState;

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let channels: Map<String, Value> = state
        .rpc_channels()
        .into_iter()
        .map(|channel| {
            (
                channel.name().to_string(),
                json!({
                    "started": channel.is_started(),
                    "pending": channel.pending_count(),
                }),
            )
        })
        .collect();

    Json(json!({
        "ok": true,
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": "relay",
        "version": env!("CARGO_PKG_VERSION"),
        "rpc_channels": channels,
    }))
}
