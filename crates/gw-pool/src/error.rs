use uuid::Uuid;

/// Error kinds surfaced from the pool/dispatcher tier, matching the
/// disposition table in the error-handling design: each variant maps to
/// exactly one HTTP outcome at the gateway layer.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("no available worker")]
    NoAvailableWorker,

    #[error("client disconnected before a worker could be acquired")]
    ClientCancelled,

    #[error("timed out loading model after {0}s")]
    ModelLoadTimeout(u64),

    #[error("backend failure: {0}")]
    BackendFailure(String),

    #[error("embeddings are disabled")]
    EmbeddingsDisabled,

    #[error("worker {0} is no longer reachable")]
    WorkerGone(usize),

    #[error("request {0} was not found")]
    RequestNotFound(Uuid),
}
