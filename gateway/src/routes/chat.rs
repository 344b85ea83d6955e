use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
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
use crate::schemas::{
    ChatChoice, ChatCompletionChunk, ChatCompletionChunkChoice, ChatCompletionChunkDelta,
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage,
};
use crate::state::AppState;

const MAX_PROMPT_BYTES: usize = 128 * 1024;

#[derive(OpenApi)]
#[openapi(
    paths(chat_completions),
    components(schemas(
        ChatCompletionRequest,
        ChatCompletionResponse,
        ChatMessage,
        ChatChoice
    ))
)]
pub struct ChatApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/chat/completions", post(chat_completions))
}

#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    tag = "chat",
    request_body = ChatCompletionRequest,
    responses(
        (status = 200, description = "Completion generated", body = ChatCompletionResponse),
        (status = 400, description = "Bad request"),
        (status = 500, description = "Backend error"),
    )
)]
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<Response, ServerError> {
    if req.messages.iter().rev().find(|m| m.role == "user").is_none() {
        return Err(ServerError::BadRequest("no user message found".into()));
    }

    let prompt = build_prompt(&req.messages);
    if prompt.len() > MAX_PROMPT_BYTES {
        return Err(ServerError::BadRequest(format!(
            "prompt too large ({} bytes); maximum is {} bytes",
            prompt.len(),
            MAX_PROMPT_BYTES
        )));
    }

    let max_tokens = req.max_tokens.unwrap_or(512);
    if max_tokens == 0 || max_tokens > 4096 {
        return Err(ServerError::BadRequest(format!(
            "invalid max_tokens ({max_tokens}): must be between 1 and 4096"
        )));
    }

    let temperature = req.temperature.unwrap_or(0.7);
    if !(0.0..=2.0).contains(&temperature) {
        return Err(ServerError::BadRequest(format!(
            "invalid temperature ({temperature}): must be between 0.0 and 2.0"
        )));
    }

    debug!(model = %req.model, prompt_len = prompt.len(), stream = req.stream, "chat completion request");

    let settings = GenerationSettings {
        max_tokens,
        temperature,
        top_p: req.top_p.unwrap_or(0.95),
        stop: req.stop.clone(),
        ..GenerationSettings::default()
    };

    let generation_request = GenerationRequest {
        model: req.model.clone(),
        prompt,
        kind: RequestKind::ChatCompletion,
        stream: req.stream,
        settings,
    };

    let (token_rx, interrupt, _acquired) = state.dispatcher.chat_completion(generation_request).await?;

    if req.stream {
        let model = req.model.clone();
        let id = format!("chatcmpl-{}", Uuid::new_v4());
        let created = Utc::now().timestamp();
        let chunk_wait_timeout = state.config.chunk_wait_timeout();

        // Each item waits at most `chunk_wait_timeout` for the worker's
        // next chunk; a stalled generation surfaces as an error chunk
        // instead of hanging the connection open indefinitely.
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
                Some(TokenEvent::Token(text)) => ChatCompletionChunk {
                    id: id.clone(),
                    object: "chat.completion.chunk".into(),
                    created,
                    model: model.clone(),
                    choices: vec![ChatCompletionChunkChoice {
                        index: 0,
                        delta: ChatCompletionChunkDelta { content: Some(text) },
                        finish_reason: None,
                    }],
                },
                Some(TokenEvent::Done(_)) => ChatCompletionChunk {
                    id: id.clone(),
                    object: "chat.completion.chunk".into(),
                    created,
                    model: model.clone(),
                    choices: vec![ChatCompletionChunkChoice {
                        index: 0,
                        delta: ChatCompletionChunkDelta { content: None },
                        finish_reason: Some("stop".into()),
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

        // OpenAI-compatible clients block on the literal `[DONE]`
        // sentinel; append it after the chunk stream ends however it ends
        // (clean finish, error, or chunk-wait timeout).
        let done = stream::once(async { Ok::<Event, Infallible>(Event::default().data("[DONE]")) });
        let body = body.chain(done);

        // The SSE response's own drop (client disconnects) is what
        // actually severs the generation; this guard sets the
        // interrupt flag as soon as that happens.
        let guard_stream = DisconnectGuardStream::new(body, interrupt);

        return Ok(Sse::new(guard_stream)
            .keep_alive(KeepAlive::default())
            .into_response());
    }

    let mut final_text = String::new();
    let mut rx = token_rx;
    let disconnect_guard = DisconnectGuard::new(interrupt);
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

    let resp = ChatCompletionResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4()),
        object: "chat.completion".into(),
        created: Utc::now().timestamp(),
        model: req.model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".into(),
                content: final_text,
            },
            finish_reason: "stop".into(),
        }],
    };

    Ok(Json(resp).into_response())
}

fn build_prompt(messages: &[ChatMessage]) -> String {
    let mut parts: Vec<String> = messages
        .iter()
        .map(|m| format!("{}: {}", capitalize_role(&m.role), m.content))
        .collect();
    parts.push("Assistant:".into());
    parts.join("\n")
}

fn capitalize_role(role: &str) -> &str {
    match role {
        "user" => "User",
        "assistant" => "Assistant",
        "system" => "System",
        other => other,
    }
}

/// Wraps a token-event stream so that dropping it (the client
/// disconnected mid-stream) sets the worker's interrupt flag.
pub(crate) struct DisconnectGuardStream<S> {
    inner: S,
    interrupt: Arc<std::sync::atomic::AtomicBool>,
}

impl<S> DisconnectGuardStream<S> {
    pub(crate) fn new(inner: S, interrupt: Arc<std::sync::atomic::AtomicBool>) -> Self {
        Self { inner, interrupt }
    }
}

impl<S: futures::Stream + Unpin> futures::Stream for DisconnectGuardStream<S> {
    type Item = S::Item;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut this.inner).poll_next(cx)
    }
}

impl<S> Drop for DisconnectGuardStream<S> {
    fn drop(&mut self) {
        self.interrupt.store(true, Ordering::Relaxed);
    }
}

/// Sets the worker's interrupt flag on drop unless `disarm`ed first.
///
/// A non-streaming handler's future is dropped outright (not polled to
/// completion) when the client disconnects mid-wait, so this is armed for
/// the whole token-receive loop and disarmed only once that loop breaks
/// on a normal `Done`/channel-close — a disconnect-drop never reaches
/// the disarm call and leaves the flag set.
pub(crate) struct DisconnectGuard {
    interrupt: Arc<AtomicBool>,
    armed: bool,
}

impl DisconnectGuard {
    pub(crate) fn new(interrupt: Arc<AtomicBool>) -> Self {
        Self { interrupt, armed: true }
    }

    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.armed {
            self.interrupt.store(true, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_prompt_with_role_prefixes() {
        let messages = vec![
            ChatMessage { role: "system".into(), content: "be terse".into() },
            ChatMessage { role: "user".into(), content: "hi".into() },
        ];
        let prompt = build_prompt(&messages);
        assert_eq!(prompt, "System: be terse\nUser: hi\nAssistant:");
    }

    #[test]
    fn validate_max_tokens_out_of_range() {
        let mt = 9999_u32;
        assert!(mt > 4096);
    }

    #[test]
    fn validate_temperature_out_of_range() {
        let temp = 3.0_f32;
        assert!(!(0.0..=2.0).contains(&temp));
    }

    #[test]
    fn validate_prompt_too_large() {
        let long_prompt = "x".repeat(MAX_PROMPT_BYTES + 1);
        assert!(long_prompt.len() > MAX_PROMPT_BYTES);
    }
}
