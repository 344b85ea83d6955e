use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Which native inference library a descriptor's weights are loaded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// A single GGUF file, driven through llama.cpp-style stepping.
    GgufLlama,
    /// A weights directory loaded through candle, standing in for the
    /// exllama-style "directory of shards" backend of the source system.
    CandleDirectory,
}

/// Where (if anywhere) a model's prefix cache lives, and how big it may grow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CachePolicy {
    Off,
    Ram { capacity_bytes: u64 },
    Disk { capacity_bytes: u64, dir: PathBuf },
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::Ram {
            capacity_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

fn default_cache_policy() -> CachePolicy {
    CachePolicy::default()
}

fn default_true() -> bool {
    true
}

/// Backend-specific knobs that don't belong to the generic descriptor shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendParams {
    #[serde(default)]
    pub rope_freq_base: Option<f32>,
    #[serde(default)]
    pub rope_freq_scale: Option<f32>,
    #[serde(default = "default_true")]
    pub embedding_enabled: bool,
}

/// Immutable, registry-resolved configuration for one loadable model.
///
/// The `id` field is the affinity key the dispatcher ranks workers against
/// and the name clients pass as `model` in a request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub backend: BackendKind,
    pub path: PathBuf,
    pub context_size: u32,
    #[serde(default = "default_cache_policy")]
    pub cache_policy: CachePolicy,
    #[serde(default)]
    pub params: BackendParams,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read model registry at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse model registry at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("unknown model: {0}")]
    UnknownModel(String),
}

/// On-disk shape of the registry file: a map of descriptors plus an
/// OpenAI-name-to-local-name alias map, mirroring the source's
/// `openai_replacement_models` table.
#[derive(Debug, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    models: Vec<ModelDescriptor>,
    #[serde(default)]
    openai_replacement_models: HashMap<String, String>,
}

/// Read-only-after-startup map from model name to descriptor, plus the
/// alias table used to resolve OpenAI-style model names to local ones.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    descriptors: HashMap<String, ModelDescriptor>,
    aliases: HashMap<String, String>,
}

impl ModelRegistry {
    pub fn from_file(path: &Path) -> Result<Self, RegistryError> {
        let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: RegistryFile = toml::from_str(&text).map_err(|source| RegistryError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let descriptors = file
            .models
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
        Ok(Self {
            descriptors,
            aliases: file.openai_replacement_models,
        })
    }

    /// Resolve an alias (if any) and return the descriptor for `name`.
    ///
    /// Mirrors the source's alias-before-lookup ordering: a
    /// client-supplied OpenAI model name is rewritten to its local
    /// equivalent before the registry is consulted.
    pub fn resolve(&self, name: &str) -> Result<&ModelDescriptor, RegistryError> {
        let local_name = self.aliases.get(name).map(|s| s.as_str()).unwrap_or(name);
        self.descriptors
            .get(local_name)
            .ok_or_else(|| RegistryError::UnknownModel(name.to_owned()))
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.descriptors.values()
    }

    pub fn insert(&mut self, descriptor: ModelDescriptor) {
        self.descriptors.insert(descriptor.id.clone(), descriptor);
    }

    pub fn alias(&mut self, openai_name: impl Into<String>, local_name: impl Into<String>) {
        self.aliases.insert(openai_name.into(), local_name.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_alias_before_lookup() {
        let mut reg = ModelRegistry::default();
        reg.insert(ModelDescriptor {
            id: "orca-mini-3b".into(),
            backend: BackendKind::GgufLlama,
            path: PathBuf::from("/models/orca-mini-3b.gguf"),
            context_size: 2048,
            cache_policy: CachePolicy::default(),
            params: BackendParams::default(),
        });
        reg.alias("gpt-3.5-turbo", "orca-mini-3b");

        let resolved = reg.resolve("gpt-3.5-turbo").unwrap();
        assert_eq!(resolved.id, "orca-mini-3b");
    }

    #[test]
    fn unknown_model_is_an_error() {
        let reg = ModelRegistry::default();
        assert!(matches!(
            reg.resolve("nope"),
            Err(RegistryError::UnknownModel(_))
        ));
    }

    #[test]
    fn loads_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        use std::io::Write;
        write!(
            file,
            r#"
            [[models]]
            id = "tiny"
            backend = "gguf_llama"
            path = "/models/tiny.gguf"
            context_size = 4096

            [openai_replacement_models]
            "gpt-4" = "tiny"
            "#
        )
        .unwrap();

        let reg = ModelRegistry::from_file(file.path()).unwrap();
        assert_eq!(reg.resolve("gpt-4").unwrap().id, "tiny");
        assert_eq!(reg.resolve("tiny").unwrap().context_size, 4096);
    }
}
