//! Candidate ranking across the user pool
//!
//! Two paths produce a ranked list. The index path asks the vector index for
//! nearest-neighbour goals and scores each candidate by their best hit; it
//! answers in roughly constant time but only sees users with indexed
//! embeddings. The exhaustive path loads every candidate tree and runs the
//! full pairwise scorer on worker threads. The index path is preferred and
//! every index-side failure falls back to exhaustive scoring, so ranking
//! keeps working when the index is cold, stale, or broken.

use crate::error::{KindredError, Result};
use crate::matching::scorer::score_trees;
use crate::storage::vectors::{IndexHit, IndexQueryOutcome, VectorIndex};
use crate::storage::GoalTreeStore;
use crate::types::{GoalTree, LifeDomain, MatchFilter, MatchResult, UserId};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Ranks candidate users by goal compatibility
pub struct MatchRanker {
    store: Arc<dyn GoalTreeStore>,
    index: Option<Arc<dyn VectorIndex>>,
    top_k: usize,
    parallelism: usize,
}

impl MatchRanker {
    pub fn new(
        store: Arc<dyn GoalTreeStore>,
        index: Option<Arc<dyn VectorIndex>>,
        top_k: usize,
        parallelism: usize,
    ) -> Self {
        Self {
            store,
            index,
            top_k,
            parallelism: parallelism.max(1),
        }
    }

    /// Rank all other users by compatibility with `user_id`
    ///
    /// Candidates with no positive-scoring overlap are omitted entirely.
    /// Results are ordered by score descending, ties broken by user id so
    /// repeated queries return a stable order. The caller applies
    /// `filter.limit`; this function returns the full ranked list.
    pub async fn rank(
        &self,
        user_id: UserId,
        filter: &MatchFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<MatchResult>> {
        let requester = match self.store.get(user_id).await? {
            Some(tree) if !tree.is_empty() => Arc::new(tree),
            _ => return Err(KindredError::NoGoalsConfigured(user_id)),
        };

        if let Some(index) = &self.index {
            if let Some(results) = self.try_index_path(index, user_id, filter).await {
                debug!(
                    "Ranked {} candidates via vector index for user {}",
                    results.len(),
                    user_id
                );
                return Ok(results);
            }
        }

        if cancel.is_cancelled() {
            return Err(KindredError::Cancelled);
        }

        let results = self.exhaustive_rank(requester, filter, cancel).await?;
        debug!(
            "Ranked {} candidates via exhaustive scoring for user {}",
            results.len(),
            user_id
        );
        Ok(results)
    }

    /// Attempt the index path; `None` means fall back to exhaustive scoring
    async fn try_index_path(
        &self,
        index: &Arc<dyn VectorIndex>,
        user_id: UserId,
        filter: &MatchFilter,
    ) -> Option<Vec<MatchResult>> {
        let vectors = match index.owner_vectors(user_id).await {
            Ok(vectors) => vectors,
            Err(e) => {
                warn!("Vector index read failed for user {}: {}", user_id, e);
                return None;
            }
        };

        // The requester's goals have not been indexed yet (worker backlog
        // or no embedding provider); there is nothing to query with
        if vectors.is_empty() {
            debug!("No indexed goals for user {}, scoring exhaustively", user_id);
            return None;
        }

        match index.query(&vectors, self.top_k, user_id).await {
            IndexQueryOutcome::Hits(hits) => Some(collect_index_results(hits, filter)),
            IndexQueryOutcome::Empty => {
                debug!("Vector index returned no candidates, scoring exhaustively");
                None
            }
            IndexQueryOutcome::Unavailable(reason) => {
                warn!("Vector index unavailable ({}), scoring exhaustively", reason);
                None
            }
        }
    }

    /// Score every candidate tree against the requester's
    async fn exhaustive_rank(
        &self,
        requester: Arc<GoalTree>,
        filter: &MatchFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<MatchResult>> {
        let candidates = self.store.get_many(requester.owner_id).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let chunk_size = candidates.len().div_ceil(self.parallelism).max(1);
        let mut tasks = JoinSet::new();
        let mut remaining = candidates;

        while !remaining.is_empty() {
            let rest = remaining.split_off(remaining.len().min(chunk_size));
            let chunk = std::mem::replace(&mut remaining, rest);
            let requester = requester.clone();
            let cancel = cancel.clone();
            tasks.spawn_blocking(move || score_chunk(&requester, &chunk, &cancel));
        }

        let mut scored: Vec<MatchResult> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let chunk_results = joined
                .map_err(|e| KindredError::Other(format!("Scoring task failed: {}", e)))??;
            scored.extend(chunk_results);
        }

        Ok(finalize(scored, filter))
    }
}

/// Score one chunk of candidates on a blocking thread
fn score_chunk(
    requester: &GoalTree,
    candidates: &[GoalTree],
    cancel: &CancellationToken,
) -> Result<Vec<MatchResult>> {
    let mut results = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if cancel.is_cancelled() {
            return Err(KindredError::Cancelled);
        }
        let pair = score_trees(requester, candidate);
        results.push(MatchResult {
            user_id: candidate.owner_id,
            score: pair.score,
            matched_domains: pair.matched_domains,
        });
    }
    Ok(results)
}

/// Fold index hits into per-candidate results
///
/// A candidate's score is the best clamped similarity across their hits, an
/// intentionally coarser signal than the exhaustive scorer: nearest-neighbour
/// search already pre-filtered the pool, so one strong goal overlap is enough
/// to surface a candidate.
fn collect_index_results(hits: Vec<IndexHit>, filter: &MatchFilter) -> Vec<MatchResult> {
    let mut by_owner: HashMap<UserId, (f32, BTreeSet<LifeDomain>)> = HashMap::new();

    for hit in hits {
        let similarity = hit.similarity.clamp(0.0, 1.0);
        let entry = by_owner
            .entry(hit.owner_id)
            .or_insert_with(|| (0.0, BTreeSet::new()));
        if similarity > entry.0 {
            entry.0 = similarity;
        }
        if similarity > 0.0 {
            entry.1.insert(hit.domain);
        }
    }

    let results = by_owner
        .into_iter()
        .map(|(user_id, (score, domains))| MatchResult {
            user_id,
            score,
            matched_domains: domains.into_iter().collect(),
        })
        .collect();

    finalize(results, filter)
}

/// Drop non-matches, apply the domain filter, and order the list
fn finalize(mut results: Vec<MatchResult>, filter: &MatchFilter) -> Vec<MatchResult> {
    results.retain(|r| r.score > 0.0);

    if !filter.domains.is_empty() {
        results.retain(|r| {
            r.matched_domains
                .iter()
                .any(|domain| filter.domains.contains(domain))
        });
    }

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FeedbackEvent, GoalNode, GoalNodeId};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeStore {
        trees: Mutex<HashMap<UserId, GoalTree>>,
    }

    impl FakeStore {
        fn with_trees(trees: Vec<GoalTree>) -> Arc<Self> {
            Arc::new(Self {
                trees: Mutex::new(trees.into_iter().map(|t| (t.owner_id, t)).collect()),
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

        async fn log_feedback(&self, _event: &FeedbackEvent) -> Result<()> {
            Ok(())
        }
    }

    struct ScriptedIndex {
        owner_vectors: Vec<Vec<f32>>,
        outcome: IndexQueryOutcome,
    }

    #[async_trait]
    impl VectorIndex for ScriptedIndex {
        async fn upsert(
            &self,
            _record: &crate::types::EmbeddingRecord,
            _text_digest: &str,
        ) -> Result<()> {
            Ok(())
        }

        async fn digests_for_owner(
            &self,
            _owner_id: UserId,
        ) -> Result<HashMap<GoalNodeId, String>> {
            Ok(HashMap::new())
        }

        async fn owner_vectors(&self, _owner_id: UserId) -> Result<Vec<Vec<f32>>> {
            Ok(self.owner_vectors.clone())
        }

        async fn query(
            &self,
            _vectors: &[Vec<f32>],
            _k: usize,
            _exclude: UserId,
        ) -> IndexQueryOutcome {
            self.outcome.clone()
        }

        async fn prune_owner(&self, _owner_id: UserId, _keep: &[GoalNodeId]) -> Result<usize> {
            Ok(0)
        }
    }

    fn tree_with_goals(goals: &[(LifeDomain, &str)]) -> GoalTree {
        let owner = UserId::new();
        let mut tree = GoalTree::new(owner);
        for (domain, name) in goals {
            tree.insert(GoalNode::new(owner, *domain, *name));
        }
        tree
    }

    fn ranker(store: Arc<FakeStore>, index: Option<Arc<dyn VectorIndex>>) -> MatchRanker {
        MatchRanker::new(store, index, 20, 4)
    }

    #[tokio::test]
    async fn test_unknown_user_has_no_goals() {
        let store = FakeStore::with_trees(vec![]);
        let result = ranker(store, None)
            .rank(UserId::new(), &MatchFilter::default(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(KindredError::NoGoalsConfigured(_))));
    }

    #[tokio::test]
    async fn test_empty_tree_counts_as_no_goals() {
        let empty = GoalTree::new(UserId::new());
        let owner = empty.owner_id;
        let store = FakeStore::with_trees(vec![empty]);
        let result = ranker(store, None)
            .rank(owner, &MatchFilter::default(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(KindredError::NoGoalsConfigured(_))));
    }

    #[tokio::test]
    async fn test_exhaustive_ranking_orders_by_score() {
        let requester = tree_with_goals(&[
            (LifeDomain::Fitness, "Run a marathon"),
            (LifeDomain::Career, "Ship the launch"),
        ]);
        // Two overlapping goals beats one
        let strong = tree_with_goals(&[
            (LifeDomain::Fitness, "Run a marathon"),
            (LifeDomain::Career, "Ship the launch"),
        ]);
        let weak = tree_with_goals(&[
            (LifeDomain::Fitness, "Run a marathon"),
            (LifeDomain::Career, "Different plan"),
        ]);
        let requester_id = requester.owner_id;
        let (strong_id, weak_id) = (strong.owner_id, weak.owner_id);

        let store = FakeStore::with_trees(vec![requester, strong, weak]);
        let results = ranker(store, None)
            .rank(requester_id, &MatchFilter::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].user_id, strong_id);
        assert_eq!(results[1].user_id, weak_id);
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn test_zero_score_candidates_dropped() {
        let requester = tree_with_goals(&[(LifeDomain::Fitness, "Run a marathon")]);
        let disjoint = tree_with_goals(&[(LifeDomain::Investing, "Max out the 401k")]);
        let requester_id = requester.owner_id;

        let store = FakeStore::with_trees(vec![requester, disjoint]);
        let results = ranker(store, None)
            .rank(requester_id, &MatchFilter::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_domain_filter_drops_other_domains() {
        let requester = tree_with_goals(&[
            (LifeDomain::Fitness, "Run a marathon"),
            (LifeDomain::Career, "Ship the launch"),
        ]);
        let fitness_peer = tree_with_goals(&[(LifeDomain::Fitness, "Run a marathon")]);
        let career_peer = tree_with_goals(&[(LifeDomain::Career, "Ship the launch")]);
        let requester_id = requester.owner_id;
        let fitness_id = fitness_peer.owner_id;

        let store = FakeStore::with_trees(vec![requester, fitness_peer, career_peer]);
        let filter = MatchFilter {
            domains: vec![LifeDomain::Fitness],
            limit: None,
        };
        let results = ranker(store, None)
            .rank(requester_id, &filter, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].user_id, fitness_id);
    }

    #[tokio::test]
    async fn test_equal_scores_tie_break_on_user_id() {
        let requester = tree_with_goals(&[(LifeDomain::Fitness, "Run a marathon")]);
        let twin_a = tree_with_goals(&[(LifeDomain::Fitness, "Run a marathon")]);
        let twin_b = tree_with_goals(&[(LifeDomain::Fitness, "Run a marathon")]);
        let requester_id = requester.owner_id;
        let mut expected = vec![twin_a.owner_id, twin_b.owner_id];
        expected.sort();

        let store = FakeStore::with_trees(vec![requester, twin_a, twin_b]);
        let results = ranker(store, None)
            .rank(requester_id, &MatchFilter::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results[0].score, results[1].score);
        assert_eq!(
            results.iter().map(|r| r.user_id).collect::<Vec<_>>(),
            expected
        );
    }

    #[tokio::test]
    async fn test_index_hits_rank_candidates() {
        let requester = tree_with_goals(&[(LifeDomain::Fitness, "Run a marathon")]);
        let requester_id = requester.owner_id;
        let near = UserId::new();
        let far = UserId::new();

        let index = Arc::new(ScriptedIndex {
            owner_vectors: vec![vec![1.0, 0.0, 0.0]],
            outcome: IndexQueryOutcome::Hits(vec![
                IndexHit {
                    owner_id: near,
                    goal_node_id: GoalNodeId::new(),
                    domain: LifeDomain::Fitness,
                    similarity: 0.92,
                },
                IndexHit {
                    owner_id: far,
                    goal_node_id: GoalNodeId::new(),
                    domain: LifeDomain::Fitness,
                    similarity: 0.41,
                },
            ]),
        });

        let store = FakeStore::with_trees(vec![requester]);
        let results = ranker(store, Some(index))
            .rank(requester_id, &MatchFilter::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].user_id, near);
        assert!((results[0].score - 0.92).abs() < 1e-6);
        assert_eq!(results[1].user_id, far);
        assert_eq!(results[0].matched_domains, vec![LifeDomain::Fitness]);
    }

    #[tokio::test]
    async fn test_index_hit_scores_clamped_to_unit_range() {
        let requester = tree_with_goals(&[(LifeDomain::Fitness, "Run a marathon")]);
        let requester_id = requester.owner_id;
        let peer = UserId::new();

        let index = Arc::new(ScriptedIndex {
            owner_vectors: vec![vec![1.0, 0.0, 0.0]],
            outcome: IndexQueryOutcome::Hits(vec![IndexHit {
                owner_id: peer,
                goal_node_id: GoalNodeId::new(),
                domain: LifeDomain::Fitness,
                similarity: 1.0000004,
            }]),
        });

        let store = FakeStore::with_trees(vec![requester]);
        let results = ranker(store, Some(index))
            .rank(requester_id, &MatchFilter::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results[0].score, 1.0);
    }

    #[tokio::test]
    async fn test_unavailable_index_falls_back_to_exhaustive() {
        let requester = tree_with_goals(&[(LifeDomain::Fitness, "Run a marathon")]);
        let peer = tree_with_goals(&[(LifeDomain::Fitness, "Run a marathon")]);
        let requester_id = requester.owner_id;
        let peer_id = peer.owner_id;

        let index = Arc::new(ScriptedIndex {
            owner_vectors: vec![vec![1.0, 0.0, 0.0]],
            outcome: IndexQueryOutcome::Unavailable("pool exhausted".to_string()),
        });

        let store = FakeStore::with_trees(vec![requester, peer]);
        let results = ranker(store, Some(index))
            .rank(requester_id, &MatchFilter::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].user_id, peer_id);
    }

    #[tokio::test]
    async fn test_empty_index_falls_back_to_exhaustive() {
        let requester = tree_with_goals(&[(LifeDomain::Fitness, "Run a marathon")]);
        let peer = tree_with_goals(&[(LifeDomain::Fitness, "Run a marathon")]);
        let requester_id = requester.owner_id;

        let index = Arc::new(ScriptedIndex {
            owner_vectors: vec![vec![1.0, 0.0, 0.0]],
            outcome: IndexQueryOutcome::Empty,
        });

        let store = FakeStore::with_trees(vec![requester, peer]);
        let results = ranker(store, Some(index))
            .rank(requester_id, &MatchFilter::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_unindexed_requester_falls_back_to_exhaustive() {
        let requester = tree_with_goals(&[(LifeDomain::Fitness, "Run a marathon")]);
        let peer = tree_with_goals(&[(LifeDomain::Fitness, "Run a marathon")]);
        let requester_id = requester.owner_id;

        let index = Arc::new(ScriptedIndex {
            owner_vectors: Vec::new(),
            outcome: IndexQueryOutcome::Hits(vec![]),
        });

        let store = FakeStore::with_trees(vec![requester, peer]);
        let results = ranker(store, Some(index))
            .rank(requester_id, &MatchFilter::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_request_aborts_exhaustive_scoring() {
        let requester = tree_with_goals(&[(LifeDomain::Fitness, "Run a marathon")]);
        let peer = tree_with_goals(&[(LifeDomain::Fitness, "Run a marathon")]);
        let requester_id = requester.owner_id;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let store = FakeStore::with_trees(vec![requester, peer]);
        let result = ranker(store, None)
            .rank(requester_id, &MatchFilter::default(), &cancel)
            .await;

        assert!(matches!(result, Err(KindredError::Cancelled)));
    }

    #[tokio::test]
    async fn test_many_candidates_split_across_chunks() {
        let requester = tree_with_goals(&[(LifeDomain::Fitness, "Run a marathon")]);
        let requester_id = requester.owner_id;

        let mut trees = vec![requester];
        for _ in 0..25 {
            trees.push(tree_with_goals(&[(LifeDomain::Fitness, "Run a marathon")]));
        }

        let store = FakeStore::with_trees(trees);
        let results = ranker(store, None)
            .rank(requester_id, &MatchFilter::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 25);
        // All identical candidates: verify the order is the id order
        let mut ids: Vec<UserId> = results.iter().map(|r| r.user_id).collect();
        let sorted = {
            let mut s = ids.clone();
            s.sort();
            s
        };
        assert_eq!(ids, sorted);
        ids.dedup();
        assert_eq!(ids.len(), 25);
    }
}
