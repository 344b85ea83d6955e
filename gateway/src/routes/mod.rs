//! Axum router construction: middleware layers, OpenAPI docs, and the
//! OpenAI-compatible `/v1` surface.

pub mod chat;
pub mod completions;
pub mod doc;
pub mod embeddings;
pub mod health;
pub mod models;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa_swagger_ui::SwaggerUi;

use crate::state::AppState;

fn cors_layer(state: &AppState) -> CorsLayer {
    match &state.config.cors_allowed_origins {
        Some(origins_str) => {
            let origins: Vec<axum::http::HeaderValue> = origins_str
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            if origins.is_empty() {
                CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any)
            } else {
                CorsLayer::new()
                    .allow_origin(origins)
                    .allow_headers(Any)
                    .allow_methods(Any)
            }
        }
        None => CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any),
    }
}

pub fn build(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state);

    let v1 = Router::new()
        .merge(models::router())
        .merge(chat::router())
        .merge(completions::router())
        .merge(embeddings::router());

    let mut app = Router::new().merge(health::router()).nest("/v1", v1);

    if state.config.enable_swagger {
        let api_doc = doc::get_docs();
        app = app.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", api_doc));
    }

    app.layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
