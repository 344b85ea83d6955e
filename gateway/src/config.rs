use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Gateway-wide configuration, loaded from environment variables with
/// defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    /// W: number of worker threads in the pool.
    pub max_workers: usize,
    /// S: concurrent-request budget per worker.
    pub max_semaphores: usize,
    pub no_embed: bool,
    pub log_level: String,
    pub log_json: bool,
    pub model_registry_path: PathBuf,
    pub prefix_cache_dir: PathBuf,
    pub model_load_timeout_secs: u64,
    pub chunk_wait_timeout_secs: u64,
    pub cors_allowed_origins: Option<String>,
    pub enable_swagger: bool,
    pub gpu_layers: u32,
    /// Recycle a worker's resident-model LRU after this many evictions;
    /// 0 disables recycling.
    pub recycle_after_evictions: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("GATEWAY_BIND_ADDRESS", "0.0.0.0:8080"),
            max_workers: parse_env("GATEWAY_MAX_WORKERS", 1),
            max_semaphores: parse_env("GATEWAY_MAX_SEMAPHORES", 1),
            no_embed: parse_env("GATEWAY_NO_EMBED", false),
            log_level: env_or("GATEWAY_LOG_LEVEL", "info"),
            log_json: parse_env("GATEWAY_LOG_JSON", false),
            model_registry_path: PathBuf::from(env_or("GATEWAY_MODEL_REGISTRY", "./models.toml")),
            prefix_cache_dir: PathBuf::from(env_or("GATEWAY_PREFIX_CACHE_DIR", "/tmp/gateway-prefix-cache")),
            model_load_timeout_secs: parse_env("GATEWAY_MODEL_LOAD_TIMEOUT_SECS", 60),
            chunk_wait_timeout_secs: parse_env("GATEWAY_CHUNK_WAIT_TIMEOUT_SECS", 30),
            cors_allowed_origins: std::env::var("GATEWAY_CORS_ALLOWED_ORIGINS").ok(),
            enable_swagger: parse_env("GATEWAY_ENABLE_SWAGGER", true),
            gpu_layers: parse_env("GATEWAY_GPU_LAYERS", 0),
            recycle_after_evictions: parse_env("GATEWAY_RECYCLE_AFTER_EVICTIONS", 0),
        }
    }

    pub fn model_load_timeout(&self) -> Duration {
        Duration::from_secs(self.model_load_timeout_secs)
    }

    pub fn chunk_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_wait_timeout_secs)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
