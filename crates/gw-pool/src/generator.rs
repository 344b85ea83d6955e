use std::collections::HashMap;
use std::sync::Arc;

use gw_backend::PrefixCache;
use gw_types::{CompletionStatus, ModelDescriptor};
use uuid::Uuid;

/// A loaded model plus the mutable state that accompanies it. Bound
/// to exactly one worker for its lifetime: the worker's LRU owns it and
/// drops it on eviction.
pub struct Generator {
    pub descriptor: ModelDescriptor,
    pub backend: Box<dyn gw_backend::InferenceBackend>,
    pub prefix_cache: Option<Arc<dyn PrefixCache>>,
    /// Token sequence currently resident in the backend's context. Used
    /// to compute how much of a freshly tokenized prompt is already warm.
    pub last_evaluated: Vec<i32>,
    /// In-flight completion statuses, keyed by request id. A status
    /// exists here iff generation is in progress for that request.
    pub statuses: HashMap<Uuid, CompletionStatus>,
}

impl Generator {
    pub fn new(
        descriptor: ModelDescriptor,
        backend: Box<dyn gw_backend::InferenceBackend>,
        prefix_cache: Option<Arc<dyn PrefixCache>>,
    ) -> Self {
        Self {
            descriptor,
            backend,
            prefix_cache,
            last_evaluated: Vec::new(),
            statuses: HashMap::new(),
        }
    }
}
