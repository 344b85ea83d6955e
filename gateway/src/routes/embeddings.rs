use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use tracing::debug;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::{EmbeddingData, EmbeddingsRequest, EmbeddingsResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(embeddings),
    components(schemas(EmbeddingsRequest, EmbeddingsResponse, EmbeddingData))
)]
pub struct EmbeddingsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/embeddings", post(embeddings))
}

#[utoipa::path(
    post,
    path = "/v1/embeddings",
    tag = "embeddings",
    request_body = EmbeddingsRequest,
    responses(
        (status = 200, description = "Embeddings computed", body = EmbeddingsResponse),
        (status = 403, description = "Embeddings disabled"),
        (status = 400, description = "Bad request"),
    )
)]
pub async fn embeddings(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EmbeddingsRequest>,
) -> Result<impl IntoResponse, ServerError> {
    if state.dispatcher.no_embed() {
        return Err(ServerError::Pool(gw_pool::PoolError::EmbeddingsDisabled));
    }

    let inputs = req.input.into_vec();
    if inputs.is_empty() {
        return Err(ServerError::BadRequest("input must not be empty".into()));
    }

    debug!(model = %req.model, count = inputs.len(), "embeddings request");

    let mut data = Vec::with_capacity(inputs.len());
    for (index, text) in inputs.into_iter().enumerate() {
        let embedding = state.dispatcher.embeddings(&req.model, text).await?;
        data.push(EmbeddingData {
            object: "embedding".into(),
            embedding,
            index: index as u32,
        });
    }

    Ok(Json(EmbeddingsResponse {
        object: "list".into(),
        data,
        model: req.model,
    }))
}
