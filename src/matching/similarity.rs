//! Similarity resolution between goal nodes
//!
//! Two strategies, tried in order: cosine similarity over cached embeddings
//! when both nodes carry one, else an exact case-sensitive name comparison.
//! Domain gating is the scorer's job; this module is domain-agnostic.

use crate::types::GoalNode;

/// Compute cosine similarity between two vectors
///
/// Returns 0.0 when the lengths differ or either magnitude is zero. The
/// result is clamped to [-1, 1] so rounding never pushes it outside the
/// cosine range.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    (dot_product / (magnitude_a * magnitude_b)).clamp(-1.0, 1.0)
}

/// Resolve similarity between two goal nodes
///
/// Embedding-based when both nodes have a cached vector; otherwise falls
/// back to exact name equality (1.0 or 0.0). A node missing its embedding
/// is expected, not an error: embedding generation is best-effort.
pub fn node_similarity(a: &GoalNode, b: &GoalNode) -> f32 {
    match (a.embedding.as_deref(), b.embedding.as_deref()) {
        (Some(va), Some(vb)) => cosine_similarity(va, vb),
        _ => {
            if a.name == b.name {
                1.0
            } else {
                0.0
            }
        }
    }
}
