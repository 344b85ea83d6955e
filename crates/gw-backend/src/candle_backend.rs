//! Directory-based backend driven through `candle`, standing in for the
//! source system's exllama family (a directory of sharded weights rather
//! than a single GGUF file). There is no Rust exllama binding in the
//! ecosystem; candle is the idiomatic pure-Rust alternative the rest of
//! the corpus already depends on for this shape of model.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Cache, Llama, LlamaConfig};
use tokenizers::Tokenizer;

use gw_types::GenerationSettings;

use crate::backend::{BackendError, Capabilities, InferenceBackend};

/// A model loaded from a weights directory: `config.json`, one or more
/// `*.safetensors` shards, and `tokenizer.json`.
pub struct CandleBackend {
    model: Llama,
    tokenizer: Tokenizer,
    cache: Cache,
    device: Device,
    tokens_seen: Vec<u32>,
    embedding_enabled: bool,
}

impl CandleBackend {
    pub fn load(dir: &Path, embedding_enabled: bool) -> Result<Self, BackendError> {
        let device = Device::Cpu;

        let config_path = dir.join("config.json");
        let config_text = std::fs::read_to_string(&config_path).map_err(|e| BackendError::Load {
            path: dir.display().to_string(),
            reason: format!("reading config.json: {e}"),
        })?;
        let config: LlamaConfig =
            serde_json::from_str(&config_text).map_err(|e| BackendError::Load {
                path: dir.display().to_string(),
                reason: format!("parsing config.json: {e}"),
            })?;
        let config = config.into_config(false);

        let tokenizer_path = dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| BackendError::Load {
            path: dir.display().to_string(),
            reason: format!("loading tokenizer: {e}"),
        })?;

        let shard_paths = find_safetensor_shards(dir).map_err(|e| BackendError::Load {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&shard_paths, DType::F32, &device)
        }
        .map_err(|e| BackendError::Load {
            path: dir.display().to_string(),
            reason: format!("loading safetensors: {e}"),
        })?;

        let model = Llama::load(vb, &config).map_err(|e| BackendError::Load {
            path: dir.display().to_string(),
            reason: format!("building model: {e}"),
        })?;

        let cache = Cache::new(true, DType::F32, &config, &device).map_err(|e| BackendError::Load {
            path: dir.display().to_string(),
            reason: format!("building kv cache: {e}"),
        })?;

        Ok(Self {
            model,
            tokenizer,
            cache,
            device,
            tokens_seen: Vec::new(),
            embedding_enabled,
        })
    }
}

fn find_safetensor_shards(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut shards = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().map(|e| e == "safetensors").unwrap_or(false) {
            shards.push(path);
        }
    }
    shards.sort();
    Ok(shards)
}

impl InferenceBackend for CandleBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_embedding: self.embedding_enabled,
            // save_state/load_state below only round-trip `tokens_seen`,
            // not the `Cache` tensors that hold the actual attention
            // state, so a loaded state would silently desync from the
            // position it claims to resume from.
            supports_state_resume: false,
        }
    }

    fn tokenize(&self, text: &str) -> Result<Vec<i32>, BackendError> {
        self.tokenizer
            .encode(text, true)
            .map(|enc| enc.get_ids().iter().map(|&id| id as i32).collect())
            .map_err(|e| BackendError::Tokenize(e.to_string()))
    }

    fn detokenize_one(&self, token: i32) -> Result<Vec<u8>, BackendError> {
        self.tokenizer
            .decode(&[token as u32], false)
            .map(|s| s.into_bytes())
            .map_err(|e| BackendError::Detokenize(e.to_string()))
    }

    fn warm(&mut self, tokens: &[i32]) -> Result<(), BackendError> {
        let ids: Vec<u32> = tokens.iter().map(|&t| t as u32).collect();
        let input = Tensor::new(ids.as_slice(), &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(|e| BackendError::Step(e.to_string()))?;

        let start_pos = self.tokens_seen.len();
        self.model
            .forward(&input, start_pos, &mut self.cache)
            .map_err(|e| BackendError::Step(e.to_string()))?;
        self.tokens_seen.extend(ids);
        Ok(())
    }

    fn sample_next(
        &mut self,
        settings: &GenerationSettings,
        _step_index: u32,
    ) -> Result<i32, BackendError> {
        let last_token = *self
            .tokens_seen
            .last()
            .ok_or_else(|| BackendError::Step("sample_next called before warm".into()))?;
        let input = Tensor::new(&[last_token], &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(|e| BackendError::Step(e.to_string()))?;

        let start_pos = self.tokens_seen.len();
        let logits = self
            .model
            .forward(&input, start_pos, &mut self.cache)
            .map_err(|e| BackendError::Step(e.to_string()))?;

        let logits = logits
            .squeeze(0)
            .and_then(|l| l.squeeze(0))
            .map_err(|e| BackendError::Step(e.to_string()))?;

        let next_token = sample_from_logits(&logits, settings).map_err(|e| BackendError::Step(e.to_string()))?;
        self.tokens_seen.push(next_token);
        Ok(next_token as i32)
    }

    fn is_eos(&self, token: i32) -> bool {
        // candle_transformers' LlamaConfig exposes no single canonical
        // EOS id across checkpoints; the tokenizer's special-token table
        // is the only reliable source, so this treats </s> and <|endoftext|>
        // as the conventional stop tokens.
        matches!(
            self.tokenizer.id_to_token(token as u32).as_deref(),
            Some("</s>") | Some("<|endoftext|>") | Some("<|eot_id|>")
        )
    }

    fn save_state(&self) -> Result<Vec<u8>, BackendError> {
        let mut out = (self.tokens_seen.len() as u32).to_le_bytes().to_vec();
        for &t in &self.tokens_seen {
            out.extend_from_slice(&t.to_le_bytes());
        }
        Ok(out)
    }

    fn load_state(&mut self, state: &[u8]) -> Result<(), BackendError> {
        if state.len() < 4 {
            return Err(BackendError::State("truncated state blob".into()));
        }
        let count = u32::from_le_bytes(state[0..4].try_into().unwrap()) as usize;
        let mut tokens = Vec::with_capacity(count);
        let mut offset = 4;
        for _ in 0..count {
            if offset + 4 > state.len() {
                return Err(BackendError::State("truncated token list".into()));
            }
            tokens.push(u32::from_le_bytes(state[offset..offset + 4].try_into().unwrap()));
            offset += 4;
        }
        self.tokens_seen = tokens;
        Ok(())
    }
}

fn sample_from_logits(logits: &Tensor, settings: &GenerationSettings) -> candle_core::Result<u32> {
    use rand::distr::weighted::WeightedIndex;
    use rand::prelude::*;

    let logits = if settings.temperature > 0.0 {
        (logits / settings.temperature as f64)?
    } else {
        logits.clone()
    };

    let probs = candle_nn::ops::softmax(&logits, candle_core::D::Minus1)?;
    let probs: Vec<f32> = probs.to_vec1()?;

    let mut rng = rand::rng();
    if settings.temperature < 0.01 {
        let (idx, _) = probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap();
        return Ok(idx as u32);
    }

    let dist = WeightedIndex::new(&probs).map_err(|e| candle_core::Error::Msg(e.to_string()))?;
    Ok(dist.sample(&mut rng) as u32)
}
