use gw_types::GenerationSettings;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to load model from {path}: {reason}")]
    Load { path: String, reason: String },
    #[error("tokenize failed: {0}")]
    Tokenize(String),
    #[error("detokenize failed: {0}")]
    Detokenize(String),
    #[error("decode step failed: {0}")]
    Step(String),
    #[error("state serialization failed: {0}")]
    State(String),
    #[error("embeddings are not supported by this model")]
    EmbeddingUnsupported,
    #[error("embedding failed: {0}")]
    Embedding(String),
}

/// The capability set a generation loop is allowed to assume.
/// `supports_embedding` varies per model; `supports_state_resume` varies
/// per backend kind and reflects whether `save_state`/`load_state`
/// round-trip real KV-cache state rather than a placeholder blob — a
/// generation loop must not attempt to warm a generator from the prefix
/// cache unless this is true, or it will resume a position counter with
/// no matching attention state behind it.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub supports_embedding: bool,
    pub supports_state_resume: bool,
}

/// Uniform surface over a loaded model, regardless of which native
/// library backs it. A `Box<dyn InferenceBackend>` is owned by exactly
/// one worker thread for the lifetime of the generator that wraps it.
///
/// Not `Send`: native backend handles (llama.cpp's context, candle's
/// device buffers) are created and driven entirely within the worker
/// thread that owns them and are never handed across threads.
pub trait InferenceBackend {
    fn capabilities(&self) -> Capabilities;

    /// Tokenize text to the backend's vocabulary.
    fn tokenize(&self, text: &str) -> Result<Vec<i32>, BackendError>;

    /// Decode a single token id to its raw byte representation. Left as
    /// raw bytes (not `String`) because a multi-byte UTF-8 character can
    /// straddle a token boundary.
    fn detokenize_one(&self, token: i32) -> Result<Vec<u8>, BackendError>;

    /// Evaluate `tokens` against the model's context, advancing its
    /// internal position. Used both to warm the prompt and to replay a
    /// prefix-cache hit's token sequence.
    fn warm(&mut self, tokens: &[i32]) -> Result<(), BackendError>;

    /// Sample and evaluate the next token given the settings in effect,
    /// advancing context position by one. `step_index` is the 0-based
    /// index into the generation (used by backends whose sampler chain
    /// is seeded per-position).
    fn sample_next(
        &mut self,
        settings: &GenerationSettings,
        step_index: u32,
    ) -> Result<i32, BackendError>;

    fn is_eos(&self, token: i32) -> bool;

    /// Serialize enough backend state (KV cache contents, current
    /// position) to resume generation later via `load_state`.
    fn save_state(&self) -> Result<Vec<u8>, BackendError>;

    /// Restore state previously produced by `save_state`.
    fn load_state(&mut self, state: &[u8]) -> Result<(), BackendError>;

    fn embed(&mut self, text: &str) -> Result<Vec<f32>, BackendError> {
        let _ = text;
        Err(BackendError::EmbeddingUnsupported)
    }
}
