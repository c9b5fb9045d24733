use std::convert::Infallible;

use axum::{
    extract::{Query, State},
    response::sse::{Event, Sse},
    Json,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use relay_core::Envelope;
use relay_infrastructure::StreamFilter;

use super::stream::sse_response;
use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const USER_FIELD: &str = "user_id";

/// Publishes the transaction to the fire-and-forget topic and echoes it back.
///
/// No token is attached: records on this topic are replayed verbatim to every
/// push session of the same user.
pub async fn create_transaction(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let envelope = Envelope::from_value(body.clone())?;
    let key = envelope
        .get_str(USER_FIELD)
        .or_else(|| envelope.get_str("userId"))
        .map(str::to_string);

    state
        .broker
        .publish(&state.topics.transactions, key.as_deref(), &envelope)
        .await?;
    debug!(user_id = ?key, "交易事件已发布");

    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct TransactionStreamQuery {
    pub user_id: String,
}

pub async fn transactions_stream(
    State(state): State<AppState>,
    Query(query): Query<TransactionStreamQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let user_id = query.user_id.trim();
    if user_id.is_empty() {
        return Err(ApiError::BadRequest("user_id is required".to_string()));
    }

    let session = state
        .bridge
        .open(StreamFilter::field(USER_FIELD, user_id), &state.topics.transactions)
        .await?;
    info!(user_id, group = session.group(), "交易推送会话已打开");

    Ok(sse_response(session, &state))
}
