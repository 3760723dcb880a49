//! Weight recalibration from peer feedback
//!
//! Recalibration is a pure, total function over the closed grade set: the
//! target node's weight is multiplied by a fixed per-grade factor. Grades
//! outside the closed set cannot reach this module; they are rejected during
//! deserialization at the API boundary.
//!
//! Weights grow and shrink without bound unless the caller opts into a
//! [`WeightBounds`] clamp. The unbounded behavior is the historical default
//! and remains so here; the clamp is a configuration knob for deployments
//! that want weights pinned to a known range.

use crate::error::{KindredError, Result};
use crate::types::{FeedbackGrade, GoalNode, GoalNodeId, GoalTree};
use serde::{Deserialize, Serialize};

/// Inclusive clamp applied to recalibrated weights
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightBounds {
    /// Lower bound, >= 0
    pub min: f32,

    /// Upper bound, >= `min`
    pub max: f32,
}

impl WeightBounds {
    /// Clamp a weight into the bounded range
    pub fn clamp(&self, weight: f32) -> f32 {
        weight.clamp(self.min, self.max)
    }
}

/// Apply a feedback grade to a goal node, returning the updated node
///
/// Pure and total: `not_applicable` is an identity operation, and no grade
/// in the closed set can fail. The returned node differs from the input only
/// in `weight`.
pub fn recalibrate(node: &GoalNode, grade: FeedbackGrade, bounds: Option<WeightBounds>) -> GoalNode {
    let mut updated = node.clone();
    updated.weight = node.weight * grade.weight_factor();
    if let Some(bounds) = bounds {
        updated.weight = bounds.clamp(updated.weight);
    }
    updated
}

/// Apply a feedback grade to one node of a tree in place, returning the
/// node's new weight
///
/// The caller persists the full replacement tree afterwards. When the node
/// id is absent the tree is left untouched and a named not-found condition
/// is returned rather than a silent no-op.
pub fn recalibrate_tree(
    tree: &mut GoalTree,
    node_id: GoalNodeId,
    grade: FeedbackGrade,
    bounds: Option<WeightBounds>,
) -> Result<f32> {
    let receiver_id = tree.owner_id;
    match tree.node_mut(node_id) {
        Some(node) => {
            *node = recalibrate(node, grade, bounds);
            Ok(node.weight)
        }
        None => Err(KindredError::FeedbackTargetNotFound {
            receiver_id,
            node_id,
        }),
    }
}
