use std::convert::Infallible;

use axum::{
    extract::State,
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::{info, instrument};

use relay_core::{CorrelationId, PushEvent};
use relay_infrastructure::{StreamFilter, StreamSession};

use super::request_envelope;
use crate::{error::ApiResult, state::AppState};

/// 流式对话
///
/// The push session is subscribed before the request is published, so even
/// the first chunk of a fast handler reaches the client.
#[instrument(skip_all)]
pub async fn chat_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let correlation_id = CorrelationId::new();
    let request = request_envelope(body, &headers)?.with_correlation_id(correlation_id.clone());

    let session = state
        .bridge
        .open(
            StreamFilter::Correlation(correlation_id.clone()),
            &state.topics.chat_responses,
        )
        .await?;

    // 会话在此处被丢弃时会自行删除临时消费组
    state
        .broker
        .publish(
            &state.topics.chat_requests,
            Some(correlation_id.as_str()),
            &request,
        )
        .await?;
    info!(correlation_id = %correlation_id, group = session.group(), "对话请求已发布");

    Ok(sse_response(session, &state))
}

/// Frames every push event as an SSE `message` event.
pub fn sse_response(
    session: StreamSession,
    state: &AppState,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = session.map(|event: PushEvent| {
        Ok::<_, Infallible>(Event::default().event("message").data(event.to_json().to_string()))
    });
    Sse::new(events).keep_alive(KeepAlive::new().interval(state.keep_alive()))
}
