use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gw_types::{GenerationRequest, ModelRegistry, RequestKind};
use rand::seq::IndexedRandom;
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;
use uuid::Uuid;

use crate::error::PoolError;
use crate::worker::{TokenEvent, WorkerHandle};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_workers: usize,
    pub max_semaphores: usize,
    pub no_embed: bool,
    pub lru_capacity: usize,
    pub recycle_after_evictions: u64,
    pub gpu_layers: u32,
    pub model_load_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: 1,
            max_semaphores: 1,
            no_embed: false,
            lru_capacity: 1,
            recycle_after_evictions: 0,
            gpu_layers: 0,
            model_load_timeout: Duration::from_secs(60),
        }
    }
}

/// Ranks workers by model affinity, acquires a semaphore slot, and pumps
/// jobs to the worker tier. Single-threaded cooperative tier: no
/// CPU-heavy work runs here, only bookkeeping and channel plumbing.
pub struct Dispatcher {
    workers: Vec<Arc<WorkerHandle>>,
    registry: Arc<ModelRegistry>,
    config: DispatcherConfig,
}

/// Holds an acquired worker permit; releasing it (on drop, any exit path
/// including panics) is what frees the semaphore slot, matching the
/// `defer`-style scoped release.
pub struct AcquiredWorker {
    pub worker: Arc<WorkerHandle>,
    _permit: OwnedSemaphorePermit,
}

fn rank(affinity: &Option<String>, available: usize, max_semaphores: usize, request_key: Option<&str>) -> i64 {
    let processed_key = affinity.as_deref();
    if request_key == processed_key {
        return -2;
    }
    if request_key.is_none() || processed_key.is_none() {
        return -1;
    }
    (max_semaphores as i64) - (available as i64)
}

impl Dispatcher {
    pub fn new(registry: Arc<ModelRegistry>, config: DispatcherConfig) -> Self {
        let workers = (0..config.max_workers)
            .map(|i| {
                WorkerHandle::spawn(
                    i,
                    config.max_semaphores,
                    config.lru_capacity,
                    config.recycle_after_evictions,
                    config.gpu_layers,
                    config.model_load_timeout,
                )
            })
            .collect();

        Self {
            workers,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Select a worker for `request_key` per the rank function below,
    /// breaking ties uniformly at random among the minimum-rank
    /// candidates, then acquire its semaphore.
    ///
    /// There is no synchronous "is the client still connected" signal to
    /// poll at this point: axum/hyper cancel a handler by dropping its
    /// future outright rather than leaving it running to observe a flag,
    /// so a check here could never see anything but "yes" while it's
    /// still executing to be asked. Real disconnect handling lives where
    /// the signal actually exists — the response future's own `Drop` —
    /// via `DisconnectGuardStream` for streaming responses and the
    /// equivalent non-streaming guard in the chat/completions handlers.
    pub async fn acquire_worker(&self, request_key: Option<&str>) -> Result<AcquiredWorker, PoolError> {
        if self.workers.is_empty() {
            return Err(PoolError::NoAvailableWorker);
        }

        let ranks: Vec<i64> = self
            .workers
            .iter()
            .map(|w| {
                let affinity = w.affinity.lock().unwrap().clone();
                rank(&affinity, w.available_permits(), self.config.max_semaphores, request_key)
            })
            .collect();

        let min_rank = *ranks.iter().min().ok_or(PoolError::NoAvailableWorker)?;
        let candidates: Vec<usize> = ranks
            .iter()
            .enumerate()
            .filter(|(_, r)| **r == min_rank)
            .map(|(i, _)| i)
            .collect();

        let mut rng = rand::rng();
        let chosen = *candidates.choose(&mut rng).ok_or(PoolError::NoAvailableWorker)?;
        let worker = self.workers[chosen].clone();

        debug!(worker = chosen, rank = min_rank, request_key = ?request_key, "selected worker");

        let permit = worker
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::WorkerGone(chosen))?;

        *worker.affinity.lock().unwrap() = request_key.map(|s| s.to_owned());

        Ok(AcquiredWorker {
            worker,
            _permit: permit,
        })
    }

    pub async fn chat_completion(
        &self,
        request: GenerationRequest,
    ) -> Result<(mpsc::UnboundedReceiver<TokenEvent>, Arc<AtomicBool>, AcquiredWorker), PoolError> {
        self.run_generation(request, RequestKind::ChatCompletion).await
    }

    pub async fn text_completion(
        &self,
        request: GenerationRequest,
    ) -> Result<(mpsc::UnboundedReceiver<TokenEvent>, Arc<AtomicBool>, AcquiredWorker), PoolError> {
        self.run_generation(request, RequestKind::TextCompletion).await
    }

    async fn run_generation(
        &self,
        request: GenerationRequest,
        kind: RequestKind,
    ) -> Result<(mpsc::UnboundedReceiver<TokenEvent>, Arc<AtomicBool>, AcquiredWorker), PoolError> {
        debug_assert_eq!(request.kind, kind);
        let descriptor = self
            .registry
            .resolve(&request.model)
            .map_err(|_| PoolError::UnknownModel(request.model.clone()))?
            .clone();

        let acquired = self.acquire_worker(Some(&descriptor.id)).await?;
        let request_id = Uuid::new_v4();
        let (token_rx, interrupt) = acquired.worker.generate(request_id, request, descriptor).await;
        Ok((token_rx, interrupt, acquired))
    }

    pub async fn embeddings(&self, model: &str, text: String) -> Result<Vec<f32>, PoolError> {
        if self.config.no_embed {
            return Err(PoolError::EmbeddingsDisabled);
        }
        let descriptor = self
            .registry
            .resolve(model)
            .map_err(|_| PoolError::UnknownModel(model.to_owned()))?
            .clone();

        if !descriptor.params.embedding_enabled {
            return Err(PoolError::EmbeddingsDisabled);
        }

        let acquired = self.acquire_worker(Some(&descriptor.id)).await?;
        acquired.worker.embed(descriptor, text).await
    }

    pub fn no_embed(&self) -> bool {
        self.config.no_embed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_model_ranks_best() {
        let affinity = Some("orca-mini-3b".to_string());
        assert_eq!(rank(&affinity, 1, 1, Some("orca-mini-3b")), -2);
    }

    #[test]
    fn idle_worker_ranks_second_best() {
        let affinity: Option<String> = None;
        assert_eq!(rank(&affinity, 1, 1, Some("orca-mini-3b")), -1);
    }

    #[test]
    fn busy_worker_on_different_model_ranks_by_availability() {
        let affinity = Some("other-model".to_string());
        // W=2, S=1: a fully booked worker on a different model
        // (available=0) ranks worse than an idle one.
        assert_eq!(rank(&affinity, 0, 1, Some("orca-mini-3b")), 1);
    }

    #[test]
    fn null_request_key_always_ranks_second_best() {
        let affinity = Some("whatever".to_string());
        assert_eq!(rank(&affinity, 1, 1, None), -1);
    }
}
