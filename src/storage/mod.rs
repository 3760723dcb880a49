//! Storage layer for the Kindred matching engine
//!
//! Provides the goal-tree store abstraction, a libsql-backed implementation,
//! and the in-process tree cache that sits in front of it.

pub mod libsql;
pub mod vectors;

pub use libsql::{ConnectionMode, LibsqlGoalStore};
pub use vectors::{SqliteVectorIndex, VectorIndex};

use crate::error::Result;
use crate::types::{FeedbackEvent, GoalTree, UserId};
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};

/// Goal-tree store trait defining all required operations
///
/// Trees are replaced wholesale on save; there is no partial node update.
/// Implementations must tolerate concurrent readers.
#[async_trait]
pub trait GoalTreeStore: Send + Sync {
    /// Retrieve one user's tree, or `None` when the user has never saved one
    async fn get(&self, user_id: UserId) -> Result<Option<GoalTree>>;

    /// Bulk-read every tree except the excluded user's (slow-path scan)
    async fn get_many(&self, exclude: UserId) -> Result<Vec<GoalTree>>;

    /// Persist a full replacement tree for its owner
    async fn put(&self, tree: &GoalTree) -> Result<()>;

    /// Append a feedback event to the audit log
    async fn log_feedback(&self, event: &FeedbackEvent) -> Result<()>;
}

/// LRU cache of decoded goal trees
///
/// Trees are shared out as `Arc` clones so a cache hit never copies the node
/// set. Every write path must invalidate the owner's entry.
pub struct TreeCache {
    cache: RwLock<LruCache<UserId, Arc<GoalTree>>>,
}

impl TreeCache {
    /// Create a cache holding up to `capacity` trees; zero is clamped to one
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// Look up a cached tree
    pub fn get(&self, user_id: UserId) -> Option<Arc<GoalTree>> {
        let mut cache = self.cache.write().ok()?;
        cache.get(&user_id).cloned()
    }

    /// Insert or refresh a tree
    pub fn insert(&self, tree: Arc<GoalTree>) {
        if let Ok(mut cache) = self.cache.write() {
            cache.put(tree.owner_id, tree);
        }
    }

    /// Drop a user's entry after a write to their tree
    pub fn invalidate(&self, user_id: UserId) {
        if let Ok(mut cache) = self.cache.write() {
            cache.pop(&user_id);
        }
    }

    /// Number of currently cached trees
    pub fn len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Check whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caching decorator over a goal-tree store
///
/// Single-user reads go through the cache; bulk reads bypass it (a slow-path
/// scan touches every tree once, which would only churn the LRU). Writes go
/// through to the inner store and invalidate the owner's entry.
pub struct CachedTreeStore {
    inner: Arc<dyn GoalTreeStore>,
    cache: TreeCache,
}

impl CachedTreeStore {
    pub fn new(inner: Arc<dyn GoalTreeStore>, capacity: usize) -> Self {
        Self {
            inner,
            cache: TreeCache::new(capacity),
        }
    }

    /// Number of trees currently cached
    pub fn cached_trees(&self) -> usize {
        self.cache.len()
    }
}

#[async_trait]
impl GoalTreeStore for CachedTreeStore {
    async fn get(&self, user_id: UserId) -> Result<Option<GoalTree>> {
        if let Some(tree) = self.cache.get(user_id) {
            return Ok(Some((*tree).clone()));
        }
        let tree = self.inner.get(user_id).await?;
        if let Some(ref tree) = tree {
            self.cache.insert(Arc::new(tree.clone()));
        }
        Ok(tree)
    }

    async fn get_many(&self, exclude: UserId) -> Result<Vec<GoalTree>> {
        self.inner.get_many(exclude).await
    }

    async fn put(&self, tree: &GoalTree) -> Result<()> {
        self.inner.put(tree).await?;
        self.cache.invalidate(tree.owner_id);
        Ok(())
    }

    async fn log_feedback(&self, event: &FeedbackEvent) -> Result<()> {
        self.inner.log_feedback(event).await
    }
}
