//! Background embedding worker
//!
//! Tree saves return as soon as the goals are persisted; this worker picks
//! the saved tree up from a bounded queue, embeds goal texts that changed,
//! and upserts them into the vector index. A failed pass degrades match
//! quality (the ranker falls back to exhaustive scoring) but never fails or
//! delays a save.

use crate::embeddings::EmbeddingService;
use crate::error::{KindredError, Result};
use crate::storage::vectors::VectorIndex;
use crate::types::{EmbeddingRecord, GoalNode, GoalNodeId, UserId};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Queue capacity; jobs beyond this are dropped with a warning
const QUEUE_CAPACITY: usize = 256;

/// One saved tree awaiting embedding
#[derive(Debug)]
pub struct EmbedJob {
    pub owner_id: UserId,
    pub nodes: Vec<GoalNode>,
}

/// Handle for enqueueing jobs and observing queue depth
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<EmbedJob>,
    depth: Arc<AtomicUsize>,
}

impl WorkerHandle {
    /// Enqueue a tree for embedding without blocking the save path
    ///
    /// Dropped jobs are only a freshness loss: the next save of the same
    /// tree re-enqueues every stale node.
    pub fn enqueue(&self, job: EmbedJob) {
        let owner = job.owner_id;
        // Increment before send so depth never underflows if the worker
        // finishes the job before this thread resumes
        self.depth.fetch_add(1, Ordering::Relaxed);
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                warn!("Embedding queue full, dropping job for user {}", owner);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                warn!("Embedding worker stopped, dropping job for user {}", owner);
            }
        }
    }

    /// Jobs currently queued or in flight
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

/// Worker that keeps the vector index in sync with saved trees
pub struct EmbeddingWorker {
    embedder: Arc<dyn EmbeddingService>,
    index: Arc<dyn VectorIndex>,
}

impl EmbeddingWorker {
    pub fn new(embedder: Arc<dyn EmbeddingService>, index: Arc<dyn VectorIndex>) -> Self {
        Self { embedder, index }
    }

    /// Spawn the worker loop
    ///
    /// The loop ends when every [`WorkerHandle`] clone has been dropped.
    pub fn spawn(self) -> (WorkerHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<EmbedJob>(QUEUE_CAPACITY);
        let depth = Arc::new(AtomicUsize::new(0));
        let handle = WorkerHandle {
            tx,
            depth: depth.clone(),
        };

        let join = tokio::spawn(async move {
            info!(
                "Embedding worker started (model: {})",
                self.embedder.model_name()
            );
            while let Some(job) = rx.recv().await {
                let owner = job.owner_id;
                if let Err(e) = self.process(job).await {
                    warn!("Embedding pass failed for user {}: {}", owner, e);
                }
                depth.fetch_sub(1, Ordering::Relaxed);
            }
            info!("Embedding worker stopped");
        });

        (handle, join)
    }

    /// Embed changed goals for one tree and prune removed ones
    async fn process(&self, job: EmbedJob) -> Result<()> {
        let known = self.index.digests_for_owner(job.owner_id).await?;

        let keep: Vec<GoalNodeId> = job.nodes.iter().map(|n| n.id).collect();
        let pruned = self.index.prune_owner(job.owner_id, &keep).await?;

        // Unchanged text means an unchanged vector; skip those nodes
        let pending: Vec<(&GoalNode, String)> = job
            .nodes
            .iter()
            .filter_map(|node| {
                let digest = text_digest(&node.embedding_text());
                if known.get(&node.id) == Some(&digest) {
                    None
                } else {
                    Some((node, digest))
                }
            })
            .collect();

        if pending.is_empty() {
            debug!(
                "No embedding work for user {} ({} goals up to date, {} pruned)",
                job.owner_id,
                job.nodes.len(),
                pruned
            );
            return Ok(());
        }

        let texts: Vec<String> = pending
            .iter()
            .map(|(node, _)| node.embedding_text())
            .collect();
        let text_refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let vectors = self.embedder.embed_batch(&text_refs).await?;

        if vectors.len() != pending.len() {
            return Err(KindredError::Embedding(format!(
                "Provider returned {} embeddings for {} texts",
                vectors.len(),
                pending.len()
            )));
        }

        let total = pending.len();
        let mut stored = 0usize;
        for ((node, digest), vector) in pending.into_iter().zip(vectors) {
            let record = EmbeddingRecord {
                owner_id: node.owner_id,
                goal_node_id: node.id,
                domain: node.domain,
                vector,
                updated_at: Utc::now(),
            };
            match self.index.upsert(&record, &digest).await {
                Ok(()) => stored += 1,
                Err(e) => warn!("Failed to index goal {}: {}", node.id, e),
            }
        }

        info!(
            "Embedded {}/{} goals for user {} ({} pruned)",
            stored, total, job.owner_id, pruned
        );
        Ok(())
    }
}

/// Stable digest of a goal's embedding text
pub fn text_digest(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}
