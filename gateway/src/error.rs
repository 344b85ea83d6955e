use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gw_pool::PoolError;

/// HTTP-facing error type. The only place `PoolError`/`BackendError`
/// variants are converted to status codes.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::Pool(PoolError::UnknownModel(m)) => {
                (StatusCode::BAD_REQUEST, format!("unknown model: {m}"))
            }
            ServerError::Pool(PoolError::NoAvailableWorker) => {
                (StatusCode::SERVICE_UNAVAILABLE, "no available worker".into())
            }
            ServerError::Pool(PoolError::ClientCancelled) => {
                // Swallowed before reaching the client; this arm only fires if a non-streaming
                // caller somehow observes it after the connection dropped.
                (StatusCode::BAD_REQUEST, "client cancelled".into())
            }
            ServerError::Pool(PoolError::ModelLoadTimeout(secs)) => (
                StatusCode::GATEWAY_TIMEOUT,
                format!("model load timed out after {secs}s"),
            ),
            ServerError::Pool(PoolError::BackendFailure(e)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, e.clone())
            }
            ServerError::Pool(PoolError::EmbeddingsDisabled) => {
                (StatusCode::FORBIDDEN, "embeddings are disabled".into())
            }
            ServerError::Pool(PoolError::WorkerGone(i)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("worker {i} is no longer reachable"),
            ),
            ServerError::Pool(PoolError::RequestNotFound(id)) => {
                (StatusCode::NOT_FOUND, format!("request {id} not found"))
            }
            ServerError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ServerError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
