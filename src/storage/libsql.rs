//! LibSQL goal-tree store
//!
//! Persists goal trees using Turso/libSQL. Saves are whole-tree replacements:
//! a put deletes every node the owner had and inserts the new set in one
//! transaction. Feedback events go to an append-only log table.

use crate::error::{KindredError, Result};
use crate::storage::GoalTreeStore;
use crate::types::{
    FeedbackEvent, FeedbackGrade, GoalNode, GoalNodeId, GoalTree, LifeDomain, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{params, Builder, Connection, Database, Row};
use std::collections::HashMap;
use tracing::{debug, info};

/// Tracked schema migrations, applied in order and recorded in
/// `_migrations_applied` so reruns are no-ops
const MIGRATIONS: &[(&str, &[&str])] = &[
    (
        "001_goal_schema",
        &[
            "CREATE TABLE IF NOT EXISTS goal_trees (
                owner_id TEXT PRIMARY KEY,
                updated_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS goal_nodes (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                domain TEXT NOT NULL,
                name TEXT NOT NULL,
                custom_details TEXT,
                weight REAL NOT NULL DEFAULT 1.0,
                progress REAL NOT NULL DEFAULT 0.0,
                parent_id TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_goal_nodes_owner ON goal_nodes(owner_id)",
        ],
    ),
    (
        "002_feedback_log",
        &[
            "CREATE TABLE IF NOT EXISTS feedback_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                giver_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                goal_node_id TEXT NOT NULL,
                grade TEXT NOT NULL,
                comment TEXT,
                created_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_feedback_receiver ON feedback_log(receiver_id)",
        ],
    ),
];

/// LibSQL-backed goal-tree store
pub struct LibsqlGoalStore {
    db: Database,
}

/// Database connection mode
#[derive(Debug, Clone)]
pub enum ConnectionMode {
    /// Local file-based database
    Local(String),
    /// In-memory database (for testing)
    InMemory,
}

impl LibsqlGoalStore {
    /// Validate database file before opening
    ///
    /// SQLite files start with "SQLite format 3\0"; anything else at an
    /// existing path is treated as corruption rather than silently replaced.
    ///
    /// Returns `Ok(true)` when the file exists and is valid, `Ok(false)` when
    /// it does not exist and `must_exist` is false.
    fn validate_database_file(db_path: &str, must_exist: bool) -> Result<bool> {
        let path = std::path::Path::new(db_path);

        if !path.exists() {
            if must_exist {
                return Err(KindredError::Database(format!(
                    "Database file not found at '{}'. Run 'kindred init' first or check KINDRED_DB_PATH.",
                    db_path
                )));
            }
            return Ok(false);
        }

        let bytes = std::fs::read(path).map_err(|e| {
            KindredError::Database(format!(
                "Cannot read database file at '{}': {}",
                db_path, e
            ))
        })?;

        if bytes.len() < 16 || &bytes[0..16] != b"SQLite format 3\0" {
            return Err(KindredError::Database(format!(
                "Database file at '{}' is not a valid SQLite database. Delete it and run 'kindred init' to reinitialize.",
                db_path
            )));
        }

        debug!("Database file validation passed: {}", db_path);
        Ok(true)
    }

    /// Create a new goal store with validation
    ///
    /// With `create_if_missing` set, a missing local file is created along
    /// with its parent directory; otherwise a missing file is an error.
    pub async fn new_with_validation(mode: ConnectionMode, create_if_missing: bool) -> Result<Self> {
        info!(
            "Connecting to LibSQL database: {:?} (create_if_missing: {})",
            mode, create_if_missing
        );

        let db = match &mode {
            ConnectionMode::Local(path) => {
                Self::validate_database_file(path, !create_if_missing)?;

                if create_if_missing {
                    if let Some(parent) = std::path::Path::new(path).parent() {
                        if !parent.as_os_str().is_empty() {
                            std::fs::create_dir_all(parent).map_err(|e| {
                                KindredError::Database(format!(
                                    "Failed to create database directory {}: {}",
                                    parent.display(),
                                    e
                                ))
                            })?;
                        }
                    }
                }

                Builder::new_local(path).build().await.map_err(|e| {
                    KindredError::Database(format!("Failed to open local database: {}", e))
                })?
            }
            ConnectionMode::InMemory => Builder::new_local(":memory:")
                .build()
                .await
                .map_err(|e| {
                    KindredError::Database(format!("Failed to create in-memory database: {}", e))
                })?,
        };

        let store = Self { db };
        store.run_migrations().await?;

        info!("LibSQL goal store ready");
        Ok(store)
    }

    /// Create a new goal store; the database must already exist
    pub async fn new(mode: ConnectionMode) -> Result<Self> {
        Self::new_with_validation(mode, false).await
    }

    /// Run tracked schema migrations
    pub async fn run_migrations(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations_applied (
                migration_name TEXT PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )",
            params![],
        )
        .await
        .map_err(|e| {
            KindredError::Database(format!("Failed to create migrations table: {}", e))
        })?;

        for (name, statements) in MIGRATIONS {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM _migrations_applied WHERE migration_name = ?",
                    params![*name],
                )
                .await
                .map_err(|e| {
                    KindredError::Database(format!("Failed to check migration state: {}", e))
                })?;

            let already_applied = match rows.next().await.map_err(|e| {
                KindredError::Database(format!("Failed to check migration state: {}", e))
            })? {
                Some(row) => row.get::<i64>(0).unwrap_or(0) > 0,
                None => false,
            };

            if already_applied {
                debug!("Skipping already applied migration: {}", name);
                continue;
            }

            for statement in *statements {
                conn.execute(statement, params![]).await.map_err(|e| {
                    KindredError::Database(format!("Migration {} failed: {}", name, e))
                })?;
            }

            conn.execute(
                "INSERT INTO _migrations_applied (migration_name, applied_at) VALUES (?, ?)",
                params![*name, Utc::now().timestamp()],
            )
            .await
            .map_err(|e| {
                KindredError::Database(format!("Failed to record migration {}: {}", name, e))
            })?;

            info!("Applied migration: {}", name);
        }

        Ok(())
    }

    /// Get a connection from the database
    fn get_conn(&self) -> Result<Connection> {
        self.db
            .connect()
            .map_err(|e| KindredError::Database(format!("Failed to get connection: {}", e)))
    }

    /// Basic liveness probe: connection plus a trivial query
    pub async fn health_check(&self) -> Result<()> {
        let conn = self.get_conn()?;
        conn.query("SELECT 1", params![]).await.map_err(|e| {
            KindredError::Database(format!("Database health check failed: {}", e))
        })?;
        Ok(())
    }

    /// Number of users with a saved tree
    pub async fn tree_count(&self) -> Result<usize> {
        let conn = self.get_conn()?;
        let mut rows = conn
            .query("SELECT COUNT(*) FROM goal_trees", params![])
            .await
            .map_err(|e| KindredError::Database(format!("Failed to count trees: {}", e)))?;

        match rows.next().await.map_err(|e| {
            KindredError::Database(format!("Failed to count trees: {}", e))
        })? {
            Some(row) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| KindredError::Database(format!("Failed to count trees: {}", e)))?;
                Ok(count as usize)
            }
            None => Ok(0),
        }
    }

    /// Most recent feedback received by a user, newest first
    pub async fn recent_feedback(
        &self,
        receiver_id: UserId,
        limit: usize,
    ) -> Result<Vec<FeedbackEvent>> {
        let conn = self.get_conn()?;
        let mut rows = conn
            .query(
                "SELECT giver_id, receiver_id, goal_node_id, grade, comment, created_at
                 FROM feedback_log WHERE receiver_id = ? ORDER BY id DESC LIMIT ?",
                params![receiver_id.to_string(), limit as i64],
            )
            .await
            .map_err(|e| KindredError::Database(format!("Failed to read feedback log: {}", e)))?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| {
            KindredError::Database(format!("Failed to read feedback log: {}", e))
        })? {
            events.push(row_to_feedback(&row)?);
        }
        Ok(events)
    }

    /// Load every node belonging to one owner
    async fn nodes_for_owner(&self, conn: &Connection, owner_id: UserId) -> Result<Vec<GoalNode>> {
        let mut rows = conn
            .query(
                "SELECT id, owner_id, domain, name, custom_details, weight, progress, parent_id
                 FROM goal_nodes WHERE owner_id = ?",
                params![owner_id.to_string()],
            )
            .await
            .map_err(|e| KindredError::Database(format!("Failed to read goal nodes: {}", e)))?;

        let mut nodes = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| {
            KindredError::Database(format!("Failed to read goal nodes: {}", e))
        })? {
            nodes.push(row_to_node(&row)?);
        }
        Ok(nodes)
    }
}

#[async_trait]
impl GoalTreeStore for LibsqlGoalStore {
    async fn get(&self, user_id: UserId) -> Result<Option<GoalTree>> {
        debug!("Fetching goal tree for user: {}", user_id);

        let conn = self.get_conn()?;
        let mut rows = conn
            .query(
                "SELECT updated_at FROM goal_trees WHERE owner_id = ?",
                params![user_id.to_string()],
            )
            .await
            .map_err(|e| KindredError::Database(format!("Failed to read goal tree: {}", e)))?;

        let row = match rows.next().await.map_err(|e| {
            KindredError::Database(format!("Failed to read goal tree: {}", e))
        })? {
            Some(row) => row,
            None => return Ok(None),
        };

        let updated_raw: String = row
            .get(0)
            .map_err(|e| KindredError::Database(format!("Failed to read goal tree: {}", e)))?;
        let updated_at = parse_timestamp(&updated_raw)?;

        let nodes = self.nodes_for_owner(&conn, user_id).await?;
        Ok(Some(assemble_tree(user_id, nodes, updated_at)))
    }

    async fn get_many(&self, exclude: UserId) -> Result<Vec<GoalTree>> {
        let conn = self.get_conn()?;

        let mut rows = conn
            .query(
                "SELECT owner_id, updated_at FROM goal_trees WHERE owner_id != ?",
                params![exclude.to_string()],
            )
            .await
            .map_err(|e| KindredError::Database(format!("Failed to list goal trees: {}", e)))?;

        let mut stamps: Vec<(UserId, DateTime<Utc>)> = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| {
            KindredError::Database(format!("Failed to list goal trees: {}", e))
        })? {
            let owner_raw: String = row.get(0).map_err(|e| {
                KindredError::Database(format!("Failed to list goal trees: {}", e))
            })?;
            let updated_raw: String = row.get(1).map_err(|e| {
                KindredError::Database(format!("Failed to list goal trees: {}", e))
            })?;
            stamps.push((UserId::from_string(&owner_raw)?, parse_timestamp(&updated_raw)?));
        }

        let mut rows = conn
            .query(
                "SELECT id, owner_id, domain, name, custom_details, weight, progress, parent_id
                 FROM goal_nodes WHERE owner_id != ?",
                params![exclude.to_string()],
            )
            .await
            .map_err(|e| KindredError::Database(format!("Failed to read goal nodes: {}", e)))?;

        let mut by_owner: HashMap<UserId, Vec<GoalNode>> = HashMap::new();
        while let Some(row) = rows.next().await.map_err(|e| {
            KindredError::Database(format!("Failed to read goal nodes: {}", e))
        })? {
            let node = row_to_node(&row)?;
            by_owner.entry(node.owner_id).or_default().push(node);
        }

        let trees = stamps
            .into_iter()
            .map(|(owner, updated_at)| {
                assemble_tree(owner, by_owner.remove(&owner).unwrap_or_default(), updated_at)
            })
            .collect();

        Ok(trees)
    }

    async fn put(&self, tree: &GoalTree) -> Result<()> {
        debug!(
            "Saving goal tree for user: {} ({} nodes)",
            tree.owner_id,
            tree.len()
        );

        let conn = self.get_conn()?;
        let tx = conn.transaction().await.map_err(|e| {
            KindredError::Database(format!("Failed to open transaction: {}", e))
        })?;

        tx.execute(
            "INSERT INTO goal_trees (owner_id, updated_at) VALUES (?, ?)
             ON CONFLICT(owner_id) DO UPDATE SET updated_at = excluded.updated_at",
            params![tree.owner_id.to_string(), tree.updated_at.to_rfc3339()],
        )
        .await
        .map_err(|e| KindredError::Database(format!("Failed to upsert goal tree: {}", e)))?;

        tx.execute(
            "DELETE FROM goal_nodes WHERE owner_id = ?",
            params![tree.owner_id.to_string()],
        )
        .await
        .map_err(|e| KindredError::Database(format!("Failed to clear previous nodes: {}", e)))?;

        for node in &tree.nodes {
            tx.execute(
                "INSERT INTO goal_nodes (id, owner_id, domain, name, custom_details, weight, progress, parent_id)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    node.id.to_string(),
                    node.owner_id.to_string(),
                    node.domain.as_str(),
                    node.name.clone(),
                    node.custom_details.clone(),
                    node.weight as f64,
                    node.progress as f64,
                    node.parent_id.map(|id| id.to_string()),
                ],
            )
            .await
            .map_err(|e| KindredError::Database(format!("Failed to insert goal node: {}", e)))?;
        }

        tx.commit().await.map_err(|e| {
            let msg = e.to_string();
            if msg.contains("locked") || msg.contains("busy") {
                KindredError::Database(
                    "Tree save failed: database is locked. Another process may be writing."
                        .to_string(),
                )
            } else {
                KindredError::Database(format!("Tree save commit failed: {}", msg))
            }
        })?;

        debug!("Goal tree saved for user: {}", tree.owner_id);
        Ok(())
    }

    async fn log_feedback(&self, event: &FeedbackEvent) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO feedback_log (giver_id, receiver_id, goal_node_id, grade, comment, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                event.giver_id.to_string(),
                event.receiver_id.to_string(),
                event.target_goal_node_id.to_string(),
                event.grade.as_str(),
                event.comment.clone(),
                event.created_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| KindredError::Database(format!("Failed to log feedback: {}", e)))?;
        Ok(())
    }
}

/// Rebuild a tree from its stored parts; `root_ids` is derived, not stored
fn assemble_tree(owner_id: UserId, nodes: Vec<GoalNode>, updated_at: DateTime<Utc>) -> GoalTree {
    let root_ids = nodes.iter().filter(|n| n.is_root()).map(|n| n.id).collect();
    GoalTree {
        owner_id,
        nodes,
        root_ids,
        updated_at,
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| KindredError::Database(format!("Invalid timestamp in store: {}", e)))
}

fn row_to_node(row: &Row) -> Result<GoalNode> {
    let id_raw: String = row.get(0).map_err(decode_err)?;
    let owner_raw: String = row.get(1).map_err(decode_err)?;
    let domain_raw: String = row.get(2).map_err(decode_err)?;
    let name: String = row.get(3).map_err(decode_err)?;
    let custom_details: Option<String> = row.get(4).map_err(decode_err)?;
    let weight: f64 = row.get(5).map_err(decode_err)?;
    let progress: f64 = row.get(6).map_err(decode_err)?;
    let parent_raw: Option<String> = row.get(7).map_err(decode_err)?;

    let domain = LifeDomain::parse(&domain_raw).ok_or_else(|| {
        KindredError::Database(format!("Unknown life domain in goal_nodes: {}", domain_raw))
    })?;

    let parent_id = parent_raw
        .as_deref()
        .map(GoalNodeId::from_string)
        .transpose()?;

    Ok(GoalNode {
        id: GoalNodeId::from_string(&id_raw)?,
        owner_id: UserId::from_string(&owner_raw)?,
        domain,
        name,
        custom_details,
        weight: weight as f32,
        progress: progress as f32,
        parent_id,
        embedding: None,
    })
}

fn row_to_feedback(row: &Row) -> Result<FeedbackEvent> {
    let giver_raw: String = row.get(0).map_err(decode_err)?;
    let receiver_raw: String = row.get(1).map_err(decode_err)?;
    let node_raw: String = row.get(2).map_err(decode_err)?;
    let grade_raw: String = row.get(3).map_err(decode_err)?;
    let comment: Option<String> = row.get(4).map_err(decode_err)?;
    let created_raw: String = row.get(5).map_err(decode_err)?;

    let grade = FeedbackGrade::parse(&grade_raw).ok_or_else(|| {
        KindredError::Database(format!("Unknown feedback grade in log: {}", grade_raw))
    })?;

    Ok(FeedbackEvent {
        giver_id: UserId::from_string(&giver_raw)?,
        receiver_id: UserId::from_string(&receiver_raw)?,
        target_goal_node_id: GoalNodeId::from_string(&node_raw)?,
        grade,
        comment,
        created_at: parse_timestamp(&created_raw)?,
    })
}

fn decode_err(e: libsql::Error) -> KindredError {
    KindredError::Database(format!("Failed to decode stored row: {}", e))
}
