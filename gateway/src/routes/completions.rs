use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use gw_pool::TokenEvent;
use gw_types::{GenerationRequest, GenerationSettings, RequestKind};
use tracing::debug;
use utoipa::OpenApi;
use uuid::Uuid;

use crate::error::ServerError;
use crate::schemas::{CompletionChoice, CompletionChunk, CompletionRequest, CompletionResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(completions),
    components(schemas(CompletionRequest, CompletionResponse, CompletionChoice))
)]
pub struct CompletionsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/completions", post(completions))
        // legacy Copilot-style alias, same handler and response shape
        .route("/v1/engines/copilot-codex/completions", post(completions))
}

#[utoipa::path(
    post,
    path = "/v1/completions",
    tag = "completions",
    request_body = CompletionRequest,
    responses(
        (status = 200, description = "Completion generated", body = CompletionResponse),
        (status = 400, description = "Bad request"),
        (status = 500, description = "Backend error"),
    )
)]
pub async fn completions(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompletionRequest>,
) -> Result<Response, ServerError> {
    if req.prompt.is_empty() {
        return Err(ServerError::BadRequest("prompt must not be empty".into()));
    }

    let max_tokens = req.max_tokens.unwrap_or(512);
    if max_tokens == 0 || max_tokens > 4096 {
        return Err(ServerError::BadRequest(format!(
            "invalid max_tokens ({max_tokens}): must be between 1 and 4096"
        )));
    }

    debug!(model = %req.model, prompt_len = req.prompt.len(), stream = req.stream, "text completion request");

    let settings = GenerationSettings {
        max_tokens,
        temperature: req.temperature.unwrap_or(0.7),
        stop: req.stop.clone(),
        ..GenerationSettings::default()
    };

    let generation_request = GenerationRequest {
        model: req.model.clone(),
        prompt: req.prompt.clone(),
        kind: RequestKind::TextCompletion,
        stream: req.stream,
        settings,
    };

    let (token_rx, interrupt, _acquired) = state.dispatcher.text_completion(generation_request).await?;

    if req.stream {
        let model = req.model.clone();
        let id = format!("cmpl-{}", Uuid::new_v4());
        let created = Utc::now().timestamp();
        let chunk_wait_timeout = state.config.chunk_wait_timeout();

        let steps = stream::unfold(Some(token_rx), move |state| {
            let chunk_wait_timeout = chunk_wait_timeout;
            async move {
                let mut rx = state?;
                match tokio::time::timeout(chunk_wait_timeout, rx.recv()).await {
                    Ok(Some(event)) => Some((Some(event), Some(rx))),
                    Ok(None) => None,
                    Err(_) => Some((None, None)),
                }
            }
        });

        let body = steps.map(move |step| {
            let chunk = match step {
                Some(TokenEvent::Token(text)) => CompletionChunk {
                    id: id.clone(),
                    object: "text_completion".into(),
                    created,
                    model: model.clone(),
                    choices: vec![CompletionChoice {
                        text,
                        index: 0,
                        finish_reason: "".into(),
                    }],
                },
                Some(TokenEvent::Done(_)) => CompletionChunk {
                    id: id.clone(),
                    object: "text_completion".into(),
                    created,
                    model: model.clone(),
                    choices: vec![CompletionChoice {
                        text: String::new(),
                        index: 0,
                        finish_reason: "stop".into(),
                    }],
                },
                Some(TokenEvent::Error(e)) => {
                    return Ok::<Event, Infallible>(Event::default().data(serde_json::json!({ "error": e }).to_string()))
                }
                None => {
                    return Ok::<Event, Infallible>(
                        Event::default().data(serde_json::json!({ "error": "timed out waiting for the next chunk" }).to_string()),
                    )
                }
            };
            Ok::<Event, Infallible>(Event::default().data(serde_json::to_string(&chunk).unwrap()))
        });

        let done = stream::once(async { Ok::<Event, Infallible>(Event::default().data("[DONE]")) });
        let body = body.chain(done);

        let guard_stream = super::chat::DisconnectGuardStream::new(body, interrupt);
        return Ok(Sse::new(guard_stream)
            .keep_alive(KeepAlive::default())
            .into_response());
    }

    let mut final_text = String::new();
    let mut rx = token_rx;
    let disconnect_guard = super::chat::DisconnectGuard::new(interrupt);
    let chunk_wait_timeout = state.config.chunk_wait_timeout();
    loop {
        match tokio::time::timeout(chunk_wait_timeout, rx.recv()).await {
            Ok(Some(TokenEvent::Token(text))) => final_text.push_str(&text),
            Ok(Some(TokenEvent::Done(_))) | Ok(None) => break,
            Ok(Some(TokenEvent::Error(e))) => return Err(ServerError::Internal(e)),
            Err(_) => return Err(ServerError::Internal("timed out waiting for the next chunk".into())),
        }
    }
    disconnect_guard.disarm();

    let resp = CompletionResponse {
        id: format!("cmpl-{}", Uuid::new_v4()),
        object: "text_completion".into(),
        created: Utc::now().timestamp(),
        model: req.model,
        choices: vec![CompletionChoice {
            text: final_text,
            index: 0,
            finish_reason: "stop".into(),
        }],
    };

    Ok(Json(resp).into_response())
}
