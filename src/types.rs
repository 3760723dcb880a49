//! Core data types for the Kindred matching engine
//!
//! This module defines the fundamental data structures used throughout kindred:
//! goal nodes, goal trees, feedback events, and match results. Every scoring,
//! recalibration, and ranking operation works over the types defined here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for users
///
/// Wraps a UUID to provide type safety and prevent mixing user IDs with
/// other UUID-based identifiers in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    /// Create a new random user ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a user ID from a string
    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for goal nodes
///
/// Unique within the owner's tree; the same value never identifies nodes
/// belonging to two different users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GoalNodeId(pub Uuid);

impl GoalNodeId {
    /// Create a new random goal node ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a goal node ID from a string
    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for GoalNodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GoalNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Life domain classification for goals
///
/// The set is closed and known at compile time. Domains gate similarity:
/// only node pairs in the same domain contribute to a compatibility score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifeDomain {
    /// Professional growth and career moves
    Career,

    /// Wealth building and financial positions
    Investing,

    /// Physical training and health targets
    Fitness,

    /// Formal study and credentials
    Academics,

    /// Emotional wellbeing and mental health practice
    MentalHealth,

    /// Worldview, ethics, and meaning
    PhilosophicalDevelopment,

    /// Art, writing, music, and making things
    CreativePursuits,

    /// Dating and partnership goals
    RomanticExploration,

    /// Friendships, community, and networking
    SocialEngagement,
}

impl LifeDomain {
    /// All domains in declaration order
    pub const ALL: [LifeDomain; 9] = [
        LifeDomain::Career,
        LifeDomain::Investing,
        LifeDomain::Fitness,
        LifeDomain::Academics,
        LifeDomain::MentalHealth,
        LifeDomain::PhilosophicalDevelopment,
        LifeDomain::CreativePursuits,
        LifeDomain::RomanticExploration,
        LifeDomain::SocialEngagement,
    ];

    /// Stable string form, matching the serde representation
    pub fn as_str(&self) -> &'static str {
        match self {
            LifeDomain::Career => "career",
            LifeDomain::Investing => "investing",
            LifeDomain::Fitness => "fitness",
            LifeDomain::Academics => "academics",
            LifeDomain::MentalHealth => "mental_health",
            LifeDomain::PhilosophicalDevelopment => "philosophical_development",
            LifeDomain::CreativePursuits => "creative_pursuits",
            LifeDomain::RomanticExploration => "romantic_exploration",
            LifeDomain::SocialEngagement => "social_engagement",
        }
    }

    /// Parse the string form produced by [`LifeDomain::as_str`]
    pub fn parse(s: &str) -> Option<Self> {
        LifeDomain::ALL.iter().copied().find(|d| d.as_str() == s)
    }
}

impl std::fmt::Display for LifeDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Peer feedback grade on a goal node
///
/// Closed set; unrecognized grades are rejected at the API boundary during
/// deserialization and never reach recalibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackGrade {
    /// Goal was achieved; it needs less attention now
    Succeeded,

    /// Owner drifted off this goal; it needs more attention
    Distracted,

    /// Owner learned something pursuing the goal
    Learned,

    /// Goal was reshaped to fit changed circumstances
    Adapted,

    /// Feedback does not apply to this goal
    NotApplicable,
}

impl FeedbackGrade {
    /// All grades in declaration order
    pub const ALL: [FeedbackGrade; 5] = [
        FeedbackGrade::Succeeded,
        FeedbackGrade::Distracted,
        FeedbackGrade::Learned,
        FeedbackGrade::Adapted,
        FeedbackGrade::NotApplicable,
    ];

    /// Get the multiplicative weight factor for recalibration
    /// A succeeded goal shrinks in weight, a distracted one grows
    pub fn weight_factor(&self) -> f32 {
        match self {
            FeedbackGrade::Succeeded => 0.8,
            FeedbackGrade::Distracted => 1.2,
            FeedbackGrade::Learned => 0.9,
            FeedbackGrade::Adapted => 1.05,
            FeedbackGrade::NotApplicable => 1.0,
        }
    }

    /// Stable string form, matching the serde representation
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackGrade::Succeeded => "succeeded",
            FeedbackGrade::Distracted => "distracted",
            FeedbackGrade::Learned => "learned",
            FeedbackGrade::Adapted => "adapted",
            FeedbackGrade::NotApplicable => "not_applicable",
        }
    }

    /// Parse the string form produced by [`FeedbackGrade::as_str`]
    pub fn parse(s: &str) -> Option<Self> {
        FeedbackGrade::ALL.iter().copied().find(|g| g.as_str() == s)
    }
}

/// One declared or derived life-goal belonging to a user
///
/// Nodes are created and replaced wholesale when a user saves their tree;
/// only the weight recalibrator mutates `weight` in place afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalNode {
    // === Identity ===
    /// Unique identifier within the owner's tree
    pub id: GoalNodeId,

    /// Owning user; every node belongs to exactly one owner
    pub owner_id: UserId,

    // === Content ===
    /// Life domain this goal falls under
    pub domain: LifeDomain,

    /// Short human label; used as fallback similarity key
    pub name: String,

    /// Optional free text, concatenated with `name` as the embedding basis
    pub custom_details: Option<String>,

    // === Scoring inputs ===
    /// Importance factor, >= 0, initialized to 1.0 at creation and mutated
    /// only by feedback recalibration
    pub weight: f32,

    /// Completion progress in [0, 1]
    pub progress: f32,

    // === Hierarchy ===
    /// Parent node within the same tree; `None` marks a root goal
    pub parent_id: Option<GoalNodeId>,

    // === Computational ===
    /// Embedding vector (not serialized to JSON, stored separately)
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

impl GoalNode {
    /// Create a new root goal with the default weight of 1.0
    pub fn new(owner_id: UserId, domain: LifeDomain, name: impl Into<String>) -> Self {
        Self {
            id: GoalNodeId::new(),
            owner_id,
            domain,
            name: name.into(),
            custom_details: None,
            weight: 1.0,
            progress: 0.0,
            parent_id: None,
            embedding: None,
        }
    }

    /// Text basis for embedding generation: the name, plus custom details
    /// when present
    pub fn embedding_text(&self) -> String {
        match self.custom_details.as_deref() {
            Some(details) if !details.trim().is_empty() => {
                format!("{} {}", self.name, details)
            }
            _ => self.name.clone(),
        }
    }

    /// Check whether this node is a root goal
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// The full goal forest for one user
///
/// A user has at most one tree. `root_ids` is a distinguished subset of the
/// node set. The compatibility scorer treats the tree as a flat weighted bag
/// of nodes; the parent hierarchy is informational only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalTree {
    /// Owning user
    pub owner_id: UserId,

    /// Every node in the forest, roots and sub-goals alike
    pub nodes: Vec<GoalNode>,

    /// IDs of nodes with no parent
    pub root_ids: Vec<GoalNodeId>,

    /// Last save timestamp
    pub updated_at: DateTime<Utc>,
}

impl GoalTree {
    /// Create an empty tree for a user
    pub fn new(owner_id: UserId) -> Self {
        Self {
            owner_id,
            nodes: Vec::new(),
            root_ids: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Add a node, registering it as a root when it has no parent
    pub fn insert(&mut self, node: GoalNode) {
        if node.is_root() {
            self.root_ids.push(node.id);
        }
        self.nodes.push(node);
    }

    /// Look up a node by ID
    pub fn node(&self, id: GoalNodeId) -> Option<&GoalNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Look up a node mutably by ID
    pub fn node_mut(&mut self, id: GoalNodeId) -> Option<&mut GoalNode> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    /// Number of nodes in the forest
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check whether the tree has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Sum of all node weights
    pub fn total_weight(&self) -> f32 {
        self.nodes.iter().map(|n| n.weight).sum()
    }
}

/// Peer feedback on a single goal node
///
/// Immutable once created. A feedback event never updates a goal node
/// directly; it is consumed exactly once by weight recalibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackEvent {
    /// User giving the feedback
    pub giver_id: UserId,

    /// User whose goal is being graded
    pub receiver_id: UserId,

    /// Target node; must belong to `receiver_id`
    pub target_goal_node_id: GoalNodeId,

    /// Feedback grade
    pub grade: FeedbackGrade,

    /// Optional free-text comment
    #[serde(default)]
    pub comment: Option<String>,

    /// When the feedback was given; stamped server-side when omitted
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// One ranked match candidate
///
/// Serialized in camelCase to match the wire shape consumed by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    /// Candidate user
    pub user_id: UserId,

    /// Compatibility score, nominally in [0, 1] (unbounded weights can
    /// push it outside that range)
    pub score: f32,

    /// Domains present in both trees that contributed non-zero similarity
    pub matched_domains: Vec<LifeDomain>,
}

/// Weight change produced by applying one feedback event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightUpdate {
    /// User whose tree was recalibrated
    pub receiver_id: UserId,

    /// Node whose weight changed
    pub goal_node_id: GoalNodeId,

    /// Weight after recalibration
    pub weight: f32,
}

/// Filters applied to a match query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchFilter {
    /// Keep only candidates whose matched domains intersect this set;
    /// empty means no domain filtering
    pub domains: Vec<LifeDomain>,

    /// Truncate the ranked list to this many results
    pub limit: Option<usize>,
}

/// Cached embedding for one goal node
///
/// At most one live record exists per (owner, node); superseded records
/// are overwritten, not versioned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Owning user
    pub owner_id: UserId,

    /// Goal node the vector was computed from
    pub goal_node_id: GoalNodeId,

    /// Domain of the goal node, denormalized for index-side filtering
    pub domain: LifeDomain,

    /// Dense embedding vector
    pub vector: Vec<f32>,

    /// When the vector was last computed
    pub updated_at: DateTime<Utc>,
}
