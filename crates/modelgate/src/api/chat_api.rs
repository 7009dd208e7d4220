//! OpenAI-compatible chat completions.
//!
//! Non-streaming requests block until the model serves and answers.
//! Streaming requests get SSE: `event: status` while loading, the engine's
//! own chunks as plain `data:` events, `event: error` on failure and a final
//! `data: [DONE]`.

use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tracing::debug;

use crate::dispatcher::StreamEvent;
use crate::error::GatewayError;
use crate::model_runtime::ChatCompletionRequest;
use crate::shared_state::AppState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// POST /chat/completions, POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    if request.model.trim().is_empty() {
        return GatewayError::InvalidRequest("model is required".into()).into_response();
    }
    if let Err(e) = state.resolver().parse(&request.model) {
        return e.into_response();
    }

    if !request.stream {
        return match state.dispatcher.complete(request).await {
            Ok(body) => Json(body).into_response(),
            Err(e) => e.into_response(),
        };
    }

    debug!("Streaming completion for {}", request.model);
    let events = state
        .dispatcher
        .stream(request)
        .map(|event| Ok::<_, Infallible>(to_sse(event)));
    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
        .into_response()
}

fn to_sse(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Status(progress) => {
            let body = json!({
                "object": "model.status",
                "state": progress.state,
                "downloadedBytes": progress.downloaded_bytes,
                "totalBytes": progress.total_bytes,
                "percent": progress.percent(),
                "message": progress.message,
            });
            Event::default().event("status").data(body.to_string())
        }
        StreamEvent::Data(chunk) => Event::default().data(chunk),
        StreamEvent::Error(e) => Event::default().event("error").data(e.to_json().to_string()),
        StreamEvent::Done => Event::default().data("[DONE]"),
    }
}
