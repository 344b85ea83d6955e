use std::collections::VecDeque;

use crate::generator::Generator;

/// Two separate size-bounded LRUs per worker: one for completion
/// generators, one for embedding generators. Kept apart because eviction
/// order favors dropping the embedding generator first — it's cheaper to
/// reload than a completion model.
pub struct ModelLru {
    completion: VecDeque<Generator>,
    embedding: VecDeque<Generator>,
    capacity: usize,
    evictions: u64,
}

pub enum GeneratorKind {
    Completion,
    Embedding,
}

impl ModelLru {
    pub fn new(capacity: usize) -> Self {
        Self {
            completion: VecDeque::with_capacity(capacity),
            embedding: VecDeque::with_capacity(capacity),
            capacity,
            evictions: 0,
        }
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Find a resident generator for `model_id`, moving it to the back
    /// (most-recently-used) of whichever deque holds it.
    pub fn find_and_touch(&mut self, model_id: &str) -> Option<&mut Generator> {
        if let Some(pos) = self.completion.iter().position(|g| g.descriptor.id == model_id) {
            let g = self.completion.remove(pos).unwrap();
            self.completion.push_back(g);
            return self.completion.back_mut();
        }
        if let Some(pos) = self.embedding.iter().position(|g| g.descriptor.id == model_id) {
            let g = self.embedding.remove(pos).unwrap();
            self.embedding.push_back(g);
            return self.embedding.back_mut();
        }
        None
    }

    /// Make room for a new generator of `kind`: the *other* kind's oldest
    /// entry is evicted unconditionally first (mirroring
    /// `get_completion_generator`/`get_embedding_generator`'s symmetric
    /// "free the other container's first item" behavior), then the
    /// target deque's own oldest entry if it is still at capacity.
    pub fn make_room(&mut self, kind: &GeneratorKind) {
        let other = match kind {
            GeneratorKind::Completion => &mut self.embedding,
            GeneratorKind::Embedding => &mut self.completion,
        };
        if !other.is_empty() {
            other.pop_front();
            self.evictions += 1;
        }

        let deque = match kind {
            GeneratorKind::Completion => &mut self.completion,
            GeneratorKind::Embedding => &mut self.embedding,
        };
        while deque.len() >= self.capacity {
            deque.pop_front();
            self.evictions += 1;
        }
    }

    pub fn insert(&mut self, kind: GeneratorKind, generator: Generator) {
        match kind {
            GeneratorKind::Completion => self.completion.push_back(generator),
            GeneratorKind::Embedding => self.embedding.push_back(generator),
        }
    }

    /// Remove a resident generator by model id, wherever it lives. Used
    /// to evict a generator whose backend just failed mid-generation, so
    /// the next request for that model retries a fresh load instead of
    /// being handed the same broken instance.
    pub fn remove(&mut self, model_id: &str) -> bool {
        if let Some(pos) = self.completion.iter().position(|g| g.descriptor.id == model_id) {
            self.completion.remove(pos);
            self.evictions += 1;
            return true;
        }
        if let Some(pos) = self.embedding.iter().position(|g| g.descriptor.id == model_id) {
            self.embedding.remove(pos);
            self.evictions += 1;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_backend::backend::{BackendError, Capabilities, InferenceBackend};
    use gw_types::{BackendKind, CachePolicy, ModelDescriptor};
    use std::path::PathBuf;

    struct StubBackend;
    impl InferenceBackend for StubBackend {
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_embedding: false,
                supports_state_resume: false,
            }
        }
        fn tokenize(&self, _text: &str) -> Result<Vec<i32>, BackendError> {
            Ok(vec![])
        }
        fn detokenize_one(&self, _token: i32) -> Result<Vec<u8>, BackendError> {
            Ok(vec![])
        }
        fn warm(&mut self, _tokens: &[i32]) -> Result<(), BackendError> {
            Ok(())
        }
        fn sample_next(&mut self, _s: &gw_types::GenerationSettings, _i: u32) -> Result<i32, BackendError> {
            Ok(0)
        }
        fn is_eos(&self, _token: i32) -> bool {
            true
        }
        fn save_state(&self) -> Result<Vec<u8>, BackendError> {
            Ok(vec![])
        }
        fn load_state(&mut self, _state: &[u8]) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn stub_generator(id: &str) -> Generator {
        Generator::new(
            ModelDescriptor {
                id: id.to_owned(),
                backend: BackendKind::GgufLlama,
                path: PathBuf::from("/dev/null"),
                context_size: 512,
                cache_policy: CachePolicy::Off,
                params: Default::default(),
            },
            Box::new(StubBackend),
            None,
        )
    }

    #[test]
    fn evicts_embedding_before_completion() {
        let mut lru = ModelLru::new(1);
        lru.insert(GeneratorKind::Embedding, stub_generator("embed-a"));
        lru.insert(GeneratorKind::Completion, stub_generator("chat-a"));

        lru.make_room(&GeneratorKind::Completion);
        assert!(lru.embedding.is_empty(), "embedding generator should be evicted first");
        assert_eq!(lru.completion.len(), 1, "completion generator should be untouched yet");
    }

    #[test]
    fn reusing_a_resident_model_does_not_evict() {
        let mut lru = ModelLru::new(1);
        lru.insert(GeneratorKind::Completion, stub_generator("chat-a"));
        assert!(lru.find_and_touch("chat-a").is_some());
        assert_eq!(lru.evictions(), 0);
    }

    #[test]
    fn evicts_completion_before_embedding() {
        let mut lru = ModelLru::new(1);
        lru.insert(GeneratorKind::Completion, stub_generator("chat-a"));
        lru.insert(GeneratorKind::Embedding, stub_generator("embed-a"));

        lru.make_room(&GeneratorKind::Embedding);
        assert!(lru.completion.is_empty(), "completion generator should be evicted first");
        assert_eq!(lru.embedding.len(), 1, "embedding generator should be untouched yet");
    }

    #[test]
    fn remove_evicts_from_either_deque() {
        let mut lru = ModelLru::new(2);
        lru.insert(GeneratorKind::Completion, stub_generator("chat-a"));
        lru.insert(GeneratorKind::Embedding, stub_generator("embed-a"));

        assert!(lru.remove("chat-a"));
        assert!(lru.find_and_touch("chat-a").is_none());
        assert!(lru.find_and_touch("embed-a").is_some());
        assert_eq!(lru.evictions(), 1);
        assert!(!lru.remove("not-resident"));
    }

    #[test]
    fn capacity_one_evicts_oldest_completion() {
        let mut lru = ModelLru::new(1);
        lru.insert(GeneratorKind::Completion, stub_generator("chat-a"));
        lru.make_room(&GeneratorKind::Completion);
        lru.insert(GeneratorKind::Completion, stub_generator("chat-b"));

        assert!(lru.find_and_touch("chat-a").is_none());
        assert!(lru.find_and_touch("chat-b").is_some());
        assert_eq!(lru.evictions(), 1);
    }
}
