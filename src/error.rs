//! Error types for the Kindred matching engine
//!
//! This module provides comprehensive error handling using thiserror for
//! structured error definitions and anyhow for error propagation.

use crate::types::{GoalNodeId, UserId};
use thiserror::Error;

/// Main error type for Kindred operations
#[derive(Error, Debug)]
pub enum KindredError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// Vector index operation failed
    #[error("Vector index error: {0}")]
    VectorIndex(String),

    /// Embedding provider request failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Embedding provider rejected the request for rate limiting; retryable
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Invalid identifier format
    #[error("Invalid identifier: {0}")]
    InvalidId(#[from] uuid::Error),

    /// Requesting user has not set up a goal tree yet
    ///
    /// Distinct from an empty match list: empty means "we looked and found
    /// nobody," this means "there was nothing to look with."
    #[error("No goals configured for user {0}")]
    NoGoalsConfigured(UserId),

    /// Feedback targeted a node absent from the receiver's tree
    #[error("Feedback target not found: node {node_id} in tree of user {receiver_id}")]
    FeedbackTargetNotFound {
        receiver_id: UserId,
        node_id: GoalNodeId,
    },

    /// Goal tree failed a structural invariant
    #[error("Invalid goal tree: {0}")]
    InvalidTree(String),

    /// Request parameters failed validation before reaching the engine
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Match computation was cancelled by the caller
    #[error("Match request cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Kindred operations
pub type Result<T> = std::result::Result<T, KindredError>;

/// Convert anyhow::Error to KindredError
impl From<anyhow::Error> for KindredError {
    fn from(err: anyhow::Error) -> Self {
        KindredError::Other(err.to_string())
    }
}
