//! Embedding generation for semantic goal similarity
//!
//! Provides the remote embedding client and the background worker that keeps
//! the vector index in sync with saved goal trees.

pub mod remote;
pub mod worker;

pub use remote::{EmbeddingService, RemoteEmbeddingService};
pub use worker::{EmbedJob, EmbeddingWorker, WorkerHandle};
