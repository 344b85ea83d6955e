use serde::{Deserialize, Serialize};

/// Which OpenAI-compatible surface a request came in through. The
/// dispatcher and generation loop branch on this only where the response
/// shape differs; sampling and stop-string handling are shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    ChatCompletion,
    TextCompletion,
    Embedding,
}

/// Sampling and generation-budget knobs, independent of backend kind.
///
/// Defaults follow the source's generation defaults (a large max-token
/// ceiling, standard top-k/top-p nucleus sampling).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSettings {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    pub seed: u32,
    pub stop: Vec<String>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            repeat_penalty: 1.1,
            seed: 0,
            stop: Vec::new(),
        }
    }
}

/// A fully-resolved request handed from the gateway's HTTP layer to the
/// dispatcher. The prompt is already rendered to plain text (chat
/// templating, if any, has already run) by the time it reaches here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub kind: RequestKind,
    pub stream: bool,
    pub settings: GenerationSettings,
}
