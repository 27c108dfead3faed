//! HTTP request handlers.

use axum::{
    body::Bytes,
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::inference::FinishReason;
use crate::server::{error::ServerError, sse, state::AppState};
use crate::system::metrics;

/// Body of a successful non-streaming completion
#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub response: String,
    pub finish_reason: FinishReason,
    pub prompt_tokens: u32,
    pub generated_tokens: u32,
}

/// Validated `{ "prompt": string, "stream": bool }` body
#[derive(Debug, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub stream: bool,
}

impl CompletionRequest {
    /// Parse the raw body. Anything other than `"stream": true` means a
    /// buffered response.
    pub fn parse(body: &[u8]) -> Result<Self, ServerError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|_| ServerError::InvalidRequest("Invalid JSON".to_string()))?;

        let prompt = value
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| ServerError::InvalidRequest("Missing prompt field".to_string()))?;
        let stream = value.get("stream").and_then(Value::as_bool) == Some(true);

        Ok(Self {
            prompt: prompt.to_string(),
            stream,
        })
    }
}

/// Handle `POST /` and `POST /completion`.
///
/// The body is taken as raw bytes so malformed JSON gets the same error shape
/// as every other failure.
pub async fn handle_completion(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ServerError> {
    let request = CompletionRequest::parse(&body)?;
    let request_id = Uuid::new_v4();
    tracing::info!(
        %request_id,
        stream = request.stream,
        prompt_bytes = request.prompt.len(),
        "Completion request"
    );

    if request.stream {
        let rx = state.engine.generate_stream(&request.prompt)?;
        return Ok(sse::completion_stream(rx).into_response());
    }

    let completion = state.engine.generate(&request.prompt).await?;
    tracing::debug!(%request_id, generated_tokens = completion.generated_tokens, "Completion sent");

    Ok(Json(CompletionResponse {
        response: completion.text,
        finish_reason: completion.finish_reason,
        prompt_tokens: completion.prompt_tokens,
        generated_tokens: completion.generated_tokens,
    })
    .into_response())
}

/// Handle `GET /metrics`.
pub async fn handle_metrics(State(state): State<AppState>) -> Json<Value> {
    let snapshot = metrics::read(&state.metrics).snapshot();
    Json(json!({
        "status": "success",
        "data": snapshot,
    }))
}

/// Handle health check requests. Includes the slot state and the loaded model.
pub async fn handle_health(State(state): State<AppState>) -> Json<Value> {
    let slot_state = metrics::read(&state.metrics).slot_state();
    Json(json!({
        "status": "ok",
        "slot": {
            "id": 0,
            "state": slot_state,
        },
        "model": state.engine.model_info(),
        "started_at": state.started_at.to_rfc3339(),
    }))
}
