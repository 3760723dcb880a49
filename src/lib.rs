//! Kindred - Goal-Compatibility Matching Engine
//!
//! Kindred ranks users by how compatible their life goals are:
//! - Weighted goal trees spanning nine life domains
//! - Pair scoring from domain overlap and semantic similarity
//! - Vector-index candidate retrieval with an exhaustive fallback
//! - Multiplicative weight recalibration driven by peer feedback
//!
//! # Architecture
//!
//! The crate is organized into layers:
//! - **Types**: core data structures (GoalTree, FeedbackEvent, MatchResult)
//! - **Storage**: libSQL tree persistence and the sqlite-vec vector index
//! - **Embeddings**: remote embedding client and the background index worker
//! - **Matching**: pair scoring, candidate ranking, weight recalibration
//! - **Engine**: the facade tying storage, embeddings, and matching together
//! - **API**: HTTP surface for matches, feedback, and tree saves
//!
//! # Example
//!
//! ```ignore
//! use kindred_core::{EngineConfig, MatchEngine, MatchFilter};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::from_env()?;
//!     let engine = build_engine(&config).await?;
//!
//!     // Rank everyone against this user's goal tree
//!     let matches = engine
//!         .get_matches(user_id, &MatchFilter::default(), &CancellationToken::new())
//!         .await?;
//!
//!     for m in matches {
//!         println!("{}: {:.3}", m.user_id, m.score);
//!     }
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod matching;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use config::{EmbeddingConfig, EngineConfig, IndexConfig, MatchingConfig};
pub use engine::MatchEngine;
pub use error::{KindredError, Result};
pub use matching::{recalibrate_tree, score_trees, MatchRanker, PairScore, WeightBounds};
pub use storage::{
    CachedTreeStore, ConnectionMode, GoalTreeStore, LibsqlGoalStore, SqliteVectorIndex,
    VectorIndex,
};
pub use types::{
    FeedbackEvent, FeedbackGrade, GoalNode, GoalNodeId, GoalTree, LifeDomain, MatchFilter,
    MatchResult, UserId, WeightUpdate,
};
