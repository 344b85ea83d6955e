//! Fixed pool of isolated workers, each owning an LRU of resident models,
//! and the dispatcher that ranks workers by model affinity and admits
//! requests through per-worker semaphores.

pub mod dispatcher;
pub mod error;
pub mod generator;
pub mod ipc;
pub mod lru;
pub mod worker;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::PoolError;
pub use worker::{run_worker_process, TokenEvent, WorkerProcessOptions};
