//! The uniform surface over native inference libraries, the stop-string checker, and the two
//! prefix-cache implementations.

pub mod backend;
pub mod gguf;
pub mod prefix_cache;
pub mod stop;

#[cfg(feature = "llama")]
pub mod llama;

#[cfg(feature = "candle")]
pub mod candle_backend;

pub use backend::{BackendError, Capabilities, InferenceBackend};
pub use prefix_cache::{DiskPrefixCache, PrefixCache, RamPrefixCache};
pub use stop::{StopChecker, StopOutcome};
