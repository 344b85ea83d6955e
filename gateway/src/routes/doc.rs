use utoipa::OpenApi;

use super::{chat, completions, embeddings, health, models};

#[derive(OpenApi)]
#[openapi(info(
    title = "gateway",
    description = "OpenAI-compatible local inference gateway",
    version = "0.1.0"
))]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut root = ApiDoc::openapi();
    root.merge(health::HealthApi::openapi());
    root.merge(models::ModelsApi::openapi());
    root.merge(chat::ChatApi::openapi());
    root.merge(completions::CompletionsApi::openapi());
    root.merge(embeddings::EmbeddingsApi::openapi());
    root
}
