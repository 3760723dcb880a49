//! Common test utilities and helpers

use kindred_core::{
    ConnectionMode, EngineConfig, GoalNode, LibsqlGoalStore, LifeDomain, MatchEngine, UserId,
};
use std::sync::Arc;
use uuid;

/// Create a file-backed goal store for testing
///
/// Uses a unique temporary file instead of :memory: so that every connection
/// handed out by the store sees the same database.
pub async fn create_test_store() -> Arc<LibsqlGoalStore> {
    let temp_file = format!("/tmp/kindred_test_{}.db", uuid::Uuid::new_v4());
    Arc::new(
        LibsqlGoalStore::new_with_validation(
            ConnectionMode::Local(temp_file),
            true, // create_if_missing - required for test databases
        )
        .await
        .expect("Failed to create test store"),
    )
}

/// Build an engine with no vector index and no embedding worker
///
/// Every match query scores exhaustively, which keeps ranking tests
/// deterministic and independent of any embedding provider.
pub fn exhaustive_engine(store: Arc<LibsqlGoalStore>) -> MatchEngine {
    MatchEngine::new(store, None, None, &EngineConfig::default())
}

/// Root goal with default weight 1.0
pub fn goal(owner: UserId, domain: LifeDomain, name: &str) -> GoalNode {
    GoalNode::new(owner, domain, name)
}
