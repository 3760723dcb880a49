//! Pairwise compatibility scoring
//!
//! The score between two goal trees is a weighted bipartite sum: every node
//! pair in the same domain contributes `similarity * weight_a * weight_b`,
//! and the total is normalized by the product of the trees' weight sums.
//! Both trees are treated as flat bags of nodes; sub-goals contribute
//! exactly like root goals and the parent hierarchy is never consulted.

use crate::matching::similarity::node_similarity;
use crate::types::{GoalTree, LifeDomain};
use std::collections::BTreeSet;

/// Outcome of scoring one pair of trees
#[derive(Debug, Clone, Default)]
pub struct PairScore {
    /// Normalized compatibility score
    pub score: f32,

    /// Domains where at least one same-domain node pair had positive
    /// similarity, in stable domain order
    pub matched_domains: Vec<LifeDomain>,
}

impl PairScore {
    fn zero() -> Self {
        Self::default()
    }
}

/// Score two goal trees for compatibility
///
/// Defined as
///
/// ```text
/// score = sum_i sum_j domain_match(i,j) * similarity(i,j) * w(i) * w(j)
///         ---------------------------------------------------------
///                       (sum_i w(i)) * (sum_j w(j))
/// ```
///
/// over all nodes of both trees. Empty trees and zero weight sums yield a
/// score of exactly 0 rather than a division by zero. The function is
/// symmetric: `score_trees(a, b)` and `score_trees(b, a)` agree within
/// floating-point tolerance.
pub fn score_trees(a: &GoalTree, b: &GoalTree) -> PairScore {
    if a.is_empty() || b.is_empty() {
        return PairScore::zero();
    }

    let denominator = f64::from(a.total_weight()) * f64::from(b.total_weight());
    if denominator == 0.0 {
        return PairScore::zero();
    }

    let mut numerator = 0.0f64;
    let mut matched = BTreeSet::new();

    for i in &a.nodes {
        for j in &b.nodes {
            if i.domain != j.domain {
                continue;
            }
            let similarity = node_similarity(i, j);
            if similarity > 0.0 {
                matched.insert(i.domain);
            }
            numerator += f64::from(similarity) * f64::from(i.weight) * f64::from(j.weight);
        }
    }

    PairScore {
        score: (numerator / denominator) as f32,
        matched_domains: matched.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GoalNode, UserId};
    use proptest::prelude::*;

    fn single_node_tree(domain: LifeDomain, name: &str, weight: f32) -> GoalTree {
        let owner = UserId::new();
        let mut tree = GoalTree::new(owner);
        let mut node = GoalNode::new(owner, domain, name);
        node.weight = weight;
        tree.insert(node);
        tree
    }

    #[test]
    fn test_identical_single_goal() {
        let a = single_node_tree(LifeDomain::Fitness, "Run a marathon", 1.0);
        let b = single_node_tree(LifeDomain::Fitness, "Run a marathon", 1.0);

        let pair = score_trees(&a, &b);
        assert!((pair.score - 1.0).abs() < 1e-6);
        assert_eq!(pair.matched_domains, vec![LifeDomain::Fitness]);
    }

    #[test]
    fn test_domain_mismatch_scores_zero() {
        let a = single_node_tree(LifeDomain::Fitness, "Run a marathon", 1.0);
        let b = single_node_tree(LifeDomain::Career, "Run a marathon", 1.0);

        let pair = score_trees(&a, &b);
        assert_eq!(pair.score, 0.0);
        assert!(pair.matched_domains.is_empty());
    }

    #[test]
    fn test_empty_tree_guard() {
        let empty = GoalTree::new(UserId::new());
        let full = single_node_tree(LifeDomain::Fitness, "Run a marathon", 1.0);

        assert_eq!(score_trees(&empty, &full).score, 0.0);
        assert_eq!(score_trees(&full, &empty).score, 0.0);
        assert_eq!(score_trees(&empty, &empty).score, 0.0);
    }

    #[test]
    fn test_zero_weight_guard() {
        let a = single_node_tree(LifeDomain::Fitness, "Run a marathon", 0.0);
        let b = single_node_tree(LifeDomain::Fitness, "Run a marathon", 1.0);

        let pair = score_trees(&a, &b);
        assert_eq!(pair.score, 0.0);
        assert!(!pair.score.is_nan());
    }

    #[test]
    fn test_sub_goals_contribute_like_roots() {
        let owner = UserId::new();
        let mut a = GoalTree::new(owner);
        let root = GoalNode::new(owner, LifeDomain::Fitness, "Run a marathon");
        let root_id = root.id;
        a.insert(root);
        let mut child = GoalNode::new(owner, LifeDomain::Fitness, "Buy trail shoes");
        child.parent_id = Some(root_id);
        a.insert(child);

        let b = single_node_tree(LifeDomain::Fitness, "Run a marathon", 1.0);

        // Only the root name matches: numerator 1, denominator 2 * 1
        let pair = score_trees(&a, &b);
        assert!((pair.score - 0.5).abs() < 1e-6);
        assert_eq!(pair.matched_domains, vec![LifeDomain::Fitness]);
    }

    #[test]
    fn test_weight_shifts_score() {
        let owner = UserId::new();
        let mut a = GoalTree::new(owner);
        let mut matching = GoalNode::new(owner, LifeDomain::Fitness, "Run a marathon");
        matching.weight = 2.0;
        a.insert(matching);
        a.insert(GoalNode::new(owner, LifeDomain::Career, "Get promoted"));

        let b = single_node_tree(LifeDomain::Fitness, "Run a marathon", 1.0);

        // numerator 2, denominator 3 * 1
        let pair = score_trees(&a, &b);
        assert!((pair.score - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_opposed_embeddings_go_negative() {
        let owner_a = UserId::new();
        let owner_b = UserId::new();
        let mut a = GoalTree::new(owner_a);
        let mut b = GoalTree::new(owner_b);

        let mut na = GoalNode::new(owner_a, LifeDomain::Fitness, "Lift heavy");
        na.embedding = Some(vec![1.0, 0.0]);
        a.insert(na);

        let mut nb = GoalNode::new(owner_b, LifeDomain::Fitness, "Rest more");
        nb.embedding = Some(vec![-1.0, 0.0]);
        b.insert(nb);

        let pair = score_trees(&a, &b);
        assert!(pair.score < 0.0);
        assert!(pair.matched_domains.is_empty());
    }

    #[test]
    fn test_extreme_weights_stay_finite() {
        let a = single_node_tree(LifeDomain::Fitness, "Run a marathon", 1e6);
        let b = single_node_tree(LifeDomain::Fitness, "Run a marathon", 1e6);

        let pair = score_trees(&a, &b);
        assert!(!pair.score.is_nan());
        assert!(pair.score.is_finite());
        // Similarity never exceeds 1, so normalization holds even here
        assert!(pair.score <= 1.0 + 1e-6);
    }

    const NAMES: [&str; 4] = ["alpha", "beta", "gamma", "delta"];

    fn arb_domain() -> impl Strategy<Value = LifeDomain> {
        prop_oneof![
            Just(LifeDomain::Career),
            Just(LifeDomain::Investing),
            Just(LifeDomain::Fitness),
        ]
    }

    fn arb_tree(weight: impl Strategy<Value = f32> + 'static) -> impl Strategy<Value = GoalTree> {
        proptest::collection::vec((arb_domain(), 0usize..NAMES.len(), weight), 0..8).prop_map(
            |specs| {
                let owner = UserId::new();
                let mut tree = GoalTree::new(owner);
                for (domain, name_idx, weight) in specs {
                    let mut node = GoalNode::new(owner, domain, NAMES[name_idx]);
                    node.weight = weight;
                    tree.insert(node);
                }
                tree
            },
        )
    }

    proptest! {
        #[test]
        fn prop_score_is_symmetric(
            a in arb_tree(0.0f32..5.0),
            b in arb_tree(0.0f32..5.0),
        ) {
            let forward = score_trees(&a, &b);
            let backward = score_trees(&b, &a);
            prop_assert!((forward.score - backward.score).abs() < 1e-5);
            prop_assert_eq!(forward.matched_domains, backward.matched_domains);
        }

        #[test]
        fn prop_unit_weights_bound_score(
            a in arb_tree(Just(1.0f32)),
            b in arb_tree(Just(1.0f32)),
        ) {
            // Fallback similarities are 0 or 1, so the normalized score
            // cannot leave [0, 1]
            let pair = score_trees(&a, &b);
            prop_assert!(pair.score >= 0.0);
            prop_assert!(pair.score <= 1.0 + 1e-6);
        }

        #[test]
        fn prop_score_never_nan(
            a in arb_tree(0.0f32..100.0),
            b in arb_tree(0.0f32..100.0),
        ) {
            prop_assert!(!score_trees(&a, &b).score.is_nan());
        }
    }
}
