use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::schemas::{ModelInfo, ModelListResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(list_models), components(schemas(ModelInfo, ModelListResponse)))]
pub struct ModelsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/models", get(list_models))
}

#[utoipa::path(
    get,
    path = "/v1/models",
    tag = "models",
    responses((status = 200, description = "Configured models", body = ModelListResponse))
)]
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelListResponse> {
    let data = state
        .dispatcher
        .registry()
        .list()
        .map(|d| ModelInfo {
            id: d.id.clone(),
            object: "model".into(),
            created: 0,
            owned_by: "local".into(),
        })
        .collect();

    Json(ModelListResponse {
        object: "list".into(),
        data,
    })
}
