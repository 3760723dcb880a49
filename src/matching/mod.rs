//! Compatibility matching between users
//!
//! Scoring is layered: [`similarity`] resolves how alike two individual
//! goals are, [`scorer`] folds node-pair similarities into a weighted score
//! for a tree pair, [`ranker`] runs the scorer (or the vector index) across
//! the candidate pool, and [`recalibrate`] adjusts goal weights from peer
//! feedback so future scores track observed behavior.

pub mod ranker;
pub mod recalibrate;
pub mod scorer;
pub mod similarity;

pub use ranker::MatchRanker;
pub use recalibrate::{recalibrate, recalibrate_tree, WeightBounds};
pub use scorer::{score_trees, PairScore};
pub use similarity::{cosine_similarity, node_similarity};
