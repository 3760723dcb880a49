//! Engine facade wiring storage, matching, and embeddings together
//!
//! [`MatchEngine`] owns the assembled collaborators and exposes the three
//! operations the outside world calls: ranking matches for a user, applying
//! peer feedback, and saving a replacement goal tree. HTTP handlers and the
//! CLI go through this facade rather than the layers below it.

use crate::config::EngineConfig;
use crate::embeddings::{EmbedJob, WorkerHandle};
use crate::error::{KindredError, Result};
use crate::matching::ranker::MatchRanker;
use crate::matching::recalibrate::{recalibrate_tree, WeightBounds};
use crate::storage::vectors::VectorIndex;
use crate::storage::GoalTreeStore;
use crate::types::{
    FeedbackEvent, GoalNode, GoalNodeId, GoalTree, MatchFilter, MatchResult, UserId, WeightUpdate,
};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Facade over the goal store, vector index, and embedding worker
pub struct MatchEngine {
    store: Arc<dyn GoalTreeStore>,
    ranker: MatchRanker,
    worker: Option<WorkerHandle>,
    weight_bounds: Option<WeightBounds>,
    index_configured: bool,
}

impl MatchEngine {
    /// Assemble an engine from its collaborators
    ///
    /// `index` and `worker` are optional: without an index every match query
    /// scores exhaustively, and without a worker saved trees simply never
    /// get embedded.
    pub fn new(
        store: Arc<dyn GoalTreeStore>,
        index: Option<Arc<dyn VectorIndex>>,
        worker: Option<WorkerHandle>,
        config: &EngineConfig,
    ) -> Self {
        let index_configured = index.is_some();
        let ranker = MatchRanker::new(
            store.clone(),
            index,
            config.index.top_k,
            config.matching.effective_parallelism(),
        );
        Self {
            store,
            ranker,
            worker,
            weight_bounds: config.matching.weight_bounds,
            index_configured,
        }
    }

    /// Rank all other users by compatibility with `user_id`
    ///
    /// Returns `NoGoalsConfigured` when the requester has no saved goals,
    /// which callers must keep distinct from an empty match list.
    pub async fn get_matches(
        &self,
        user_id: UserId,
        filter: &MatchFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<MatchResult>> {
        let mut results = self.ranker.rank(user_id, filter, cancel).await?;
        if let Some(limit) = filter.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    /// Apply one feedback event to the receiver's tree
    ///
    /// Recalibrates the target node's weight, persists the replacement tree,
    /// and appends the event to the feedback log. A receiver with no tree is
    /// reported as `FeedbackTargetNotFound`: from the giver's point of view
    /// the graded goal does not exist either way.
    pub async fn apply_feedback(&self, event: FeedbackEvent) -> Result<WeightUpdate> {
        let mut tree = match self.store.get(event.receiver_id).await? {
            Some(tree) => tree,
            None => {
                return Err(KindredError::FeedbackTargetNotFound {
                    receiver_id: event.receiver_id,
                    node_id: event.target_goal_node_id,
                })
            }
        };

        let weight = recalibrate_tree(
            &mut tree,
            event.target_goal_node_id,
            event.grade,
            self.weight_bounds,
        )?;
        tree.updated_at = Utc::now();

        self.store.put(&tree).await?;
        self.store.log_feedback(&event).await?;

        info!(
            "Recalibrated goal {} for user {} to weight {:.4} ({})",
            event.target_goal_node_id,
            event.receiver_id,
            weight,
            event.grade.as_str()
        );

        Ok(WeightUpdate {
            receiver_id: event.receiver_id,
            goal_node_id: event.target_goal_node_id,
            weight,
        })
    }

    /// Replace a user's goal tree
    ///
    /// Validates the node set, persists it wholesale, and hands the saved
    /// tree to the embedding worker. The save is complete when this returns;
    /// embedding happens in the background.
    pub async fn save_tree(&self, owner_id: UserId, nodes: Vec<GoalNode>) -> Result<GoalTree> {
        let tree = build_tree(owner_id, nodes)?;
        self.store.put(&tree).await?;
        debug!("Saved {} goals for user {}", tree.len(), owner_id);
        self.on_tree_saved(&tree);
        Ok(tree)
    }

    /// Enqueue a saved tree for embedding; returns immediately
    pub fn on_tree_saved(&self, tree: &GoalTree) {
        if let Some(worker) = &self.worker {
            worker.enqueue(EmbedJob {
                owner_id: tree.owner_id,
                nodes: tree.nodes.clone(),
            });
        }
    }

    /// Embedding jobs queued or in flight
    pub fn queue_depth(&self) -> usize {
        self.worker.as_ref().map(|w| w.queue_depth()).unwrap_or(0)
    }

    /// Whether a vector index was wired in at startup
    pub fn index_configured(&self) -> bool {
        self.index_configured
    }
}

/// Validate a replacement node set and assemble it into a tree
///
/// Rejects nodes owned by someone else, empty names, non-finite or negative
/// weights, progress outside [0, 1], duplicate ids, and parent references
/// that are missing, self-referential, or cyclic.
fn build_tree(owner_id: UserId, nodes: Vec<GoalNode>) -> Result<GoalTree> {
    let mut ids = HashSet::with_capacity(nodes.len());

    for node in &nodes {
        if node.owner_id != owner_id {
            return Err(KindredError::InvalidTree(format!(
                "goal {} belongs to user {}, not {}",
                node.id, node.owner_id, owner_id
            )));
        }
        if node.name.trim().is_empty() {
            return Err(KindredError::InvalidTree(format!(
                "goal {} has an empty name",
                node.id
            )));
        }
        if !node.weight.is_finite() || node.weight < 0.0 {
            return Err(KindredError::InvalidTree(format!(
                "goal {} has invalid weight {}",
                node.id, node.weight
            )));
        }
        if !node.progress.is_finite() || !(0.0..=1.0).contains(&node.progress) {
            return Err(KindredError::InvalidTree(format!(
                "goal {} has progress {} outside [0, 1]",
                node.id, node.progress
            )));
        }
        if !ids.insert(node.id) {
            return Err(KindredError::InvalidTree(format!(
                "duplicate goal id {}",
                node.id
            )));
        }
    }

    for node in &nodes {
        if let Some(parent_id) = node.parent_id {
            if parent_id == node.id {
                return Err(KindredError::InvalidTree(format!(
                    "goal {} is its own parent",
                    node.id
                )));
            }
            if !ids.contains(&parent_id) {
                return Err(KindredError::InvalidTree(format!(
                    "goal {} references missing parent {}",
                    node.id, parent_id
                )));
            }
        }
    }

    // Parent chains must terminate at a root within the node set
    let parents: HashMap<GoalNodeId, Option<GoalNodeId>> =
        nodes.iter().map(|n| (n.id, n.parent_id)).collect();
    for node in &nodes {
        let mut hops = 0;
        let mut current = node.parent_id;
        while let Some(id) = current {
            hops += 1;
            if hops > nodes.len() {
                return Err(KindredError::InvalidTree(format!(
                    "goal {} sits in a parent cycle",
                    node.id
                )));
            }
            current = parents.get(&id).copied().flatten();
        }
    }

    let mut tree = GoalTree::new(owner_id);
    for node in nodes {
        tree.insert(node);
    }
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FeedbackGrade, LifeDomain};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeStore {
        trees: Mutex<HashMap<UserId, GoalTree>>,
        feedback: Mutex<Vec<FeedbackEvent>>,
    }

    impl FakeStore {
        fn with_trees(trees: Vec<GoalTree>) -> Arc<Self> {
            Arc::new(Self {
                trees: Mutex::new(trees.into_iter().map(|t| (t.owner_id, t)).collect()),
                feedback: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl GoalTreeStore for FakeStore {
        async fn get(&self, user_id: UserId) -> Result<Option<GoalTree>> {
            Ok(self.trees.lock().unwrap().get(&user_id).cloned())
        }

        async fn get_many(&self, exclude: UserId) -> Result<Vec<GoalTree>> {
            Ok(self
                .trees
                .lock()
                .unwrap()
                .values()
                .filter(|t| t.owner_id != exclude)
                .cloned()
                .collect())
        }

        async fn put(&self, tree: &GoalTree) -> Result<()> {
            self.trees.lock().unwrap().insert(tree.owner_id, tree.clone());
            Ok(())
        }

        async fn log_feedback(&self, event: &FeedbackEvent) -> Result<()> {
            self.feedback.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn engine_over(store: Arc<FakeStore>) -> MatchEngine {
        MatchEngine::new(store, None, None, &EngineConfig::default())
    }

    fn tree_with_goals(goals: &[(LifeDomain, &str)]) -> GoalTree {
        let owner = UserId::new();
        let mut tree = GoalTree::new(owner);
        for (domain, name) in goals {
            tree.insert(GoalNode::new(owner, *domain, *name));
        }
        tree
    }

    fn feedback_for(receiver: &GoalTree, node: GoalNodeId, grade: FeedbackGrade) -> FeedbackEvent {
        FeedbackEvent {
            giver_id: UserId::new(),
            receiver_id: receiver.owner_id,
            target_goal_node_id: node,
            grade,
            comment: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_get_matches_applies_limit() {
        let requester = tree_with_goals(&[(LifeDomain::Fitness, "Run a marathon")]);
        let requester_id = requester.owner_id;
        let mut trees = vec![requester];
        for _ in 0..5 {
            trees.push(tree_with_goals(&[(LifeDomain::Fitness, "Run a marathon")]));
        }

        let engine = engine_over(FakeStore::with_trees(trees));
        let filter = MatchFilter {
            domains: Vec::new(),
            limit: Some(2),
        };
        let results = engine
            .get_matches(requester_id, &filter, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_apply_feedback_persists_new_weight() {
        let tree = tree_with_goals(&[(LifeDomain::Career, "Ship the launch")]);
        let owner = tree.owner_id;
        let node_id = tree.nodes[0].id;
        let store = FakeStore::with_trees(vec![tree]);
        let engine = engine_over(store.clone());

        let update = engine
            .apply_feedback(feedback_for(
                &store.get(owner).await.unwrap().unwrap(),
                node_id,
                FeedbackGrade::Succeeded,
            ))
            .await
            .unwrap();

        assert_eq!(update.receiver_id, owner);
        assert_eq!(update.goal_node_id, node_id);
        assert!((update.weight - 0.8).abs() < 1e-6);

        let stored = store.get(owner).await.unwrap().unwrap();
        assert!((stored.node(node_id).unwrap().weight - 0.8).abs() < 1e-6);
        assert_eq!(store.feedback.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_feedback_missing_node() {
        let tree = tree_with_goals(&[(LifeDomain::Career, "Ship the launch")]);
        let store = FakeStore::with_trees(vec![tree.clone()]);
        let engine = engine_over(store.clone());

        let missing = GoalNodeId::new();
        let err = engine
            .apply_feedback(feedback_for(&tree, missing, FeedbackGrade::Learned))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            KindredError::FeedbackTargetNotFound { node_id, .. } if node_id == missing
        ));
        // Neither the tree nor the log changed
        assert!(store.feedback.lock().unwrap().is_empty());
        let stored = store.get(tree.owner_id).await.unwrap().unwrap();
        assert_eq!(stored.nodes[0].weight, 1.0);
    }

    #[tokio::test]
    async fn test_apply_feedback_missing_tree() {
        let engine = engine_over(FakeStore::with_trees(vec![]));
        let ghost = tree_with_goals(&[(LifeDomain::Career, "Ship the launch")]);

        let err = engine
            .apply_feedback(feedback_for(&ghost, ghost.nodes[0].id, FeedbackGrade::Adapted))
            .await
            .unwrap_err();

        assert!(matches!(err, KindredError::FeedbackTargetNotFound { .. }));
    }

    #[tokio::test]
    async fn test_save_tree_persists_and_derives_roots() {
        let store = FakeStore::with_trees(vec![]);
        let engine = engine_over(store.clone());
        let owner = UserId::new();

        let root = GoalNode::new(owner, LifeDomain::Fitness, "Run a marathon");
        let mut child = GoalNode::new(owner, LifeDomain::Fitness, "Buy trail shoes");
        child.parent_id = Some(root.id);
        let root_id = root.id;

        let saved = engine.save_tree(owner, vec![root, child]).await.unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved.root_ids, vec![root_id]);

        let stored = store.get(owner).await.unwrap().unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn test_save_tree_rejects_foreign_nodes() {
        let engine = engine_over(FakeStore::with_trees(vec![]));
        let owner = UserId::new();
        let stranger = GoalNode::new(UserId::new(), LifeDomain::Fitness, "Run a marathon");

        let err = engine.save_tree(owner, vec![stranger]).await.unwrap_err();
        assert!(matches!(err, KindredError::InvalidTree(_)));
    }

    #[tokio::test]
    async fn test_save_tree_rejects_bad_scalars() {
        let engine = engine_over(FakeStore::with_trees(vec![]));
        let owner = UserId::new();

        let mut negative_weight = GoalNode::new(owner, LifeDomain::Fitness, "Run");
        negative_weight.weight = -1.0;
        assert!(matches!(
            engine.save_tree(owner, vec![negative_weight]).await,
            Err(KindredError::InvalidTree(_))
        ));

        let mut nan_weight = GoalNode::new(owner, LifeDomain::Fitness, "Run");
        nan_weight.weight = f32::NAN;
        assert!(matches!(
            engine.save_tree(owner, vec![nan_weight]).await,
            Err(KindredError::InvalidTree(_))
        ));

        let mut overdone = GoalNode::new(owner, LifeDomain::Fitness, "Run");
        overdone.progress = 1.5;
        assert!(matches!(
            engine.save_tree(owner, vec![overdone]).await,
            Err(KindredError::InvalidTree(_))
        ));

        let blank = GoalNode::new(owner, LifeDomain::Fitness, "   ");
        assert!(matches!(
            engine.save_tree(owner, vec![blank]).await,
            Err(KindredError::InvalidTree(_))
        ));
    }

    #[tokio::test]
    async fn test_save_tree_rejects_broken_hierarchy() {
        let engine = engine_over(FakeStore::with_trees(vec![]));
        let owner = UserId::new();

        // Missing parent
        let mut orphan = GoalNode::new(owner, LifeDomain::Fitness, "Buy trail shoes");
        orphan.parent_id = Some(GoalNodeId::new());
        assert!(matches!(
            engine.save_tree(owner, vec![orphan]).await,
            Err(KindredError::InvalidTree(_))
        ));

        // Self-parent
        let mut selfie = GoalNode::new(owner, LifeDomain::Fitness, "Run");
        selfie.parent_id = Some(selfie.id);
        assert!(matches!(
            engine.save_tree(owner, vec![selfie]).await,
            Err(KindredError::InvalidTree(_))
        ));

        // Two-node cycle
        let mut a = GoalNode::new(owner, LifeDomain::Fitness, "A");
        let mut b = GoalNode::new(owner, LifeDomain::Fitness, "B");
        a.parent_id = Some(b.id);
        b.parent_id = Some(a.id);
        assert!(matches!(
            engine.save_tree(owner, vec![a, b]).await,
            Err(KindredError::InvalidTree(_))
        ));

        // Duplicate id
        let node = GoalNode::new(owner, LifeDomain::Fitness, "Run");
        let duplicate = node.clone();
        assert!(matches!(
            engine.save_tree(owner, vec![node, duplicate]).await,
            Err(KindredError::InvalidTree(_))
        ));
    }

    #[tokio::test]
    async fn test_save_tree_accepts_empty_node_set() {
        let store = FakeStore::with_trees(vec![]);
        let engine = engine_over(store.clone());
        let owner = UserId::new();

        // Clearing all goals is a valid save; matching then reports
        // NoGoalsConfigured for this user
        let saved = engine.save_tree(owner, vec![]).await.unwrap();
        assert!(saved.is_empty());

        let err = engine
            .get_matches(owner, &MatchFilter::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, KindredError::NoGoalsConfigured(_)));
    }

    #[tokio::test]
    async fn test_queue_depth_without_worker_is_zero() {
        let engine = engine_over(FakeStore::with_trees(vec![]));
        assert_eq!(engine.queue_depth(), 0);
        assert!(!engine.index_configured());
    }
}
