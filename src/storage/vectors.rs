//! Goal vector index using sqlite-vec
//!
//! Fast-path candidate retrieval runs over this index instead of scoring
//! every tree pair. Dual storage approach:
//! - rusqlite with the sqlite-vec extension for vector KNN
//! - separate vec0 virtual table plus a plain metadata side table
//! - connection pooling for concurrent access (deadpool-sqlite)
//!
//! Index failures never abort a match request. Reads fold errors into
//! [`IndexQueryOutcome::Unavailable`] and the ranker degrades to the
//! exhaustive path.

use crate::error::{KindredError, Result};
use crate::types::{EmbeddingRecord, GoalNodeId, LifeDomain, UserId};
use async_trait::async_trait;
use deadpool_sqlite::{Config, Pool, Runtime};
use rusqlite::Result as SqliteResult;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

/// Default connection pool size
const DEFAULT_POOL_SIZE: usize = 20;

/// One nearest-neighbour hit from the index
#[derive(Debug, Clone)]
pub struct IndexHit {
    /// User whose goal produced the hit
    pub owner_id: UserId,

    /// The matching goal node
    pub goal_node_id: GoalNodeId,

    /// Domain of the matching goal, denormalized at write time
    pub domain: LifeDomain,

    /// Cosine similarity to the closest query vector, in [-1, 1]
    pub similarity: f32,
}

/// Result of an index query
///
/// Unavailability is an ordinary value here, not an error: the caller decides
/// how to degrade instead of unwinding through the request path.
#[derive(Debug, Clone)]
pub enum IndexQueryOutcome {
    /// Nearest neighbours from other users' goals, best first
    Hits(Vec<IndexHit>),

    /// The index answered but holds no vectors for anyone else
    Empty,

    /// The index could not answer (extension missing, pool exhausted, bad
    /// dimensions); the reason is for logging only
    Unavailable(String),
}

/// Vector index operations: the embedding worker writes, the ranker reads
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace one goal's vector and its metadata
    async fn upsert(&self, record: &EmbeddingRecord, text_digest: &str) -> Result<()>;

    /// Text digests of every indexed node for one owner, for change detection
    async fn digests_for_owner(&self, owner_id: UserId) -> Result<HashMap<GoalNodeId, String>>;

    /// All indexed vectors belonging to one owner
    async fn owner_vectors(&self, owner_id: UserId) -> Result<Vec<Vec<f32>>>;

    /// K-nearest-neighbour search over other users' goals
    async fn query(&self, vectors: &[Vec<f32>], k: usize, exclude: UserId) -> IndexQueryOutcome;

    /// Drop indexed vectors for nodes the owner no longer has; returns the
    /// number of pruned entries
    async fn prune_owner(&self, owner_id: UserId, keep: &[GoalNodeId]) -> Result<usize>;
}

/// sqlite-vec backed index with connection pooling
pub struct SqliteVectorIndex {
    pool: Pool,
    dimensions: usize,
}

impl SqliteVectorIndex {
    /// Create a new vector index with the default pool size
    ///
    /// # Arguments
    /// * `db_path` - Path to the SQLite index file (separate from the tree store)
    /// * `dimensions` - Vector dimension size (768 for the default embedding model)
    pub fn new<P: AsRef<Path>>(db_path: P, dimensions: usize) -> Result<Self> {
        Self::with_pool_size(db_path, dimensions, DEFAULT_POOL_SIZE)
    }

    /// Create a new vector index with a custom pool size
    pub fn with_pool_size<P: AsRef<Path>>(
        db_path: P,
        dimensions: usize,
        pool_size: usize,
    ) -> Result<Self> {
        let path_str = db_path.as_ref().to_string_lossy().to_string();
        info!(
            "Creating vector index pool at: {} (dimensions: {}, pool_size: {})",
            path_str, dimensions, pool_size
        );

        // Load sqlite-vec as an auto-extension so every pooled connection
        // sees the vec0 module
        unsafe {
            use rusqlite::ffi::sqlite3_auto_extension;

            #[allow(clippy::missing_transmute_annotations)]
            sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite_vec::sqlite3_vec_init as *const (),
            )));
        }

        let config = Config::new(path_str);
        let pool = config.create_pool(Runtime::Tokio1).map_err(|e| {
            KindredError::VectorIndex(format!("Failed to create connection pool: {}", e))
        })?;

        Ok(Self { pool, dimensions })
    }

    /// Create the vec0 virtual table and its metadata side table
    ///
    /// Safe to call repeatedly (IF NOT EXISTS). The vec0 column is declared
    /// with cosine distance so `similarity = 1 - distance` holds exactly.
    pub async fn create_tables(&self) -> Result<()> {
        info!(
            "Creating goal vector tables (dimensions: {})",
            self.dimensions
        );

        let vec_sql = format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS goal_vectors USING vec0(
                node_id TEXT PRIMARY KEY,
                embedding FLOAT[{}] distance_metric=cosine
            )",
            self.dimensions
        );

        let conn = self.pool.get().await.map_err(|e| {
            KindredError::VectorIndex(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.interact(move |conn| -> Result<()> {
            conn.execute(&vec_sql, []).map_err(|e| {
                KindredError::VectorIndex(format!("Failed to create vec0 table: {}", e))
            })?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS goal_vector_meta (
                    node_id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    domain TEXT NOT NULL,
                    text_digest TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                [],
            )
            .map_err(|e| {
                KindredError::VectorIndex(format!("Failed to create meta table: {}", e))
            })?;

            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_goal_vector_meta_owner
                 ON goal_vector_meta(owner_id)",
                [],
            )
            .map_err(|e| {
                KindredError::VectorIndex(format!("Failed to create meta index: {}", e))
            })?;

            Ok(())
        })
        .await
        .map_err(|e| KindredError::VectorIndex(format!("Pool interaction failed: {}", e)))??;

        info!("Goal vector tables ready");
        Ok(())
    }

    /// Count indexed vectors across all owners
    pub async fn count_vectors(&self) -> Result<usize> {
        let conn = self.pool.get().await.map_err(|e| {
            KindredError::VectorIndex(format!("Failed to get connection from pool: {}", e))
        })?;

        let count = conn
            .interact(|conn| -> Result<usize> {
                let count: i64 = conn
                    .query_row("SELECT COUNT(*) FROM goal_vector_meta", [], |row| row.get(0))
                    .map_err(|e| {
                        KindredError::VectorIndex(format!("Failed to count vectors: {}", e))
                    })?;
                Ok(count as usize)
            })
            .await
            .map_err(|e| KindredError::VectorIndex(format!("Pool interaction failed: {}", e)))??;

        Ok(count)
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, record: &EmbeddingRecord, text_digest: &str) -> Result<()> {
        if record.vector.len() != self.dimensions {
            return Err(KindredError::VectorIndex(format!(
                "Embedding dimension mismatch for node {}: expected {}, got {}",
                record.goal_node_id,
                self.dimensions,
                record.vector.len()
            )));
        }

        debug!("Indexing vector for goal node: {}", record.goal_node_id);

        let node_id = record.goal_node_id.to_string();
        let owner_id = record.owner_id.to_string();
        let domain = record.domain.as_str().to_string();
        let digest = text_digest.to_string();
        let updated_at = record.updated_at.to_rfc3339();
        let embedding_json = serde_json::to_string(&record.vector)?;

        let conn = self.pool.get().await.map_err(|e| {
            KindredError::VectorIndex(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.interact(move |conn| -> Result<()> {
            let tx = conn.transaction().map_err(|e| {
                KindredError::VectorIndex(format!("Failed to begin transaction: {}", e))
            })?;

            // vec0 tables reject INSERT OR REPLACE, so delete first
            tx.execute(
                "DELETE FROM goal_vectors WHERE node_id = ?",
                rusqlite::params![&node_id],
            )
            .map_err(|e| {
                KindredError::VectorIndex(format!("Failed to delete existing vector: {}", e))
            })?;

            tx.execute(
                "INSERT INTO goal_vectors (node_id, embedding) VALUES (?, vec_f32(?))",
                rusqlite::params![&node_id, &embedding_json],
            )
            .map_err(|e| KindredError::VectorIndex(format!("Failed to store vector: {}", e)))?;

            tx.execute(
                "INSERT OR REPLACE INTO goal_vector_meta
                 (node_id, owner_id, domain, text_digest, updated_at)
                 VALUES (?, ?, ?, ?, ?)",
                rusqlite::params![&node_id, &owner_id, &domain, &digest, &updated_at],
            )
            .map_err(|e| KindredError::VectorIndex(format!("Failed to store metadata: {}", e)))?;

            tx.commit().map_err(|e| {
                KindredError::VectorIndex(format!("Failed to commit vector upsert: {}", e))
            })
        })
        .await
        .map_err(|e| KindredError::VectorIndex(format!("Pool interaction failed: {}", e)))??;

        Ok(())
    }

    async fn digests_for_owner(&self, owner_id: UserId) -> Result<HashMap<GoalNodeId, String>> {
        let owner = owner_id.to_string();

        let conn = self.pool.get().await.map_err(|e| {
            KindredError::VectorIndex(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.interact(move |conn| -> Result<HashMap<GoalNodeId, String>> {
            let mut stmt = conn
                .prepare("SELECT node_id, text_digest FROM goal_vector_meta WHERE owner_id = ?")
                .map_err(|e| {
                    KindredError::VectorIndex(format!("Failed to prepare digest query: {}", e))
                })?;

            let rows = stmt
                .query_map(rusqlite::params![&owner], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .and_then(|mapped| mapped.collect::<SqliteResult<Vec<_>>>())
                .map_err(|e| {
                    KindredError::VectorIndex(format!("Failed to read digests: {}", e))
                })?;

            let mut digests = HashMap::with_capacity(rows.len());
            for (id_raw, digest) in rows {
                digests.insert(GoalNodeId::from_string(&id_raw)?, digest);
            }
            Ok(digests)
        })
        .await
        .map_err(|e| KindredError::VectorIndex(format!("Pool interaction failed: {}", e)))?
    }

    async fn owner_vectors(&self, owner_id: UserId) -> Result<Vec<Vec<f32>>> {
        let owner = owner_id.to_string();

        let conn = self.pool.get().await.map_err(|e| {
            KindredError::VectorIndex(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.interact(move |conn| -> Result<Vec<Vec<f32>>> {
            let mut stmt = conn
                .prepare(
                    "SELECT v.embedding
                     FROM goal_vectors v
                     JOIN goal_vector_meta m ON m.node_id = v.node_id
                     WHERE m.owner_id = ?",
                )
                .map_err(|e| {
                    KindredError::VectorIndex(format!("Failed to prepare vector query: {}", e))
                })?;

            let blobs = stmt
                .query_map(rusqlite::params![&owner], |row| row.get::<_, Vec<u8>>(0))
                .and_then(|mapped| mapped.collect::<SqliteResult<Vec<_>>>())
                .map_err(|e| {
                    KindredError::VectorIndex(format!("Failed to read vectors: {}", e))
                })?;

            Ok(blobs.iter().map(|blob| decode_blob(blob)).collect())
        })
        .await
        .map_err(|e| KindredError::VectorIndex(format!("Pool interaction failed: {}", e)))?
    }

    async fn query(&self, vectors: &[Vec<f32>], k: usize, exclude: UserId) -> IndexQueryOutcome {
        if vectors.is_empty() {
            return IndexQueryOutcome::Empty;
        }
        for vector in vectors {
            if vector.len() != self.dimensions {
                return IndexQueryOutcome::Unavailable(format!(
                    "query vector dimension mismatch: expected {}, got {}",
                    self.dimensions,
                    vector.len()
                ));
            }
        }

        let conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                return IndexQueryOutcome::Unavailable(format!(
                    "Failed to get connection from pool: {}",
                    e
                ))
            }
        };

        let vectors = vectors.to_vec();
        let exclude_raw = exclude.to_string();

        let result = conn
            .interact(move |conn| -> Result<Vec<IndexHit>> {
                // Own vectors come back from KNN too; widen the fetch so the
                // caller still sees k foreign hits after filtering
                let own_count: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM goal_vector_meta WHERE owner_id = ?",
                        rusqlite::params![&exclude_raw],
                        |row| row.get(0),
                    )
                    .map_err(|e| {
                        KindredError::VectorIndex(format!("Failed to size query: {}", e))
                    })?;
                let fetch = (k + own_count as usize).max(1);

                let mut stmt = conn
                    .prepare(
                        "SELECT knn.node_id, knn.distance, meta.owner_id, meta.domain
                         FROM (
                             SELECT node_id, distance
                             FROM goal_vectors
                             WHERE embedding MATCH vec_f32(?)
                             ORDER BY distance
                             LIMIT ?
                         ) AS knn
                         JOIN goal_vector_meta meta ON meta.node_id = knn.node_id",
                    )
                    .map_err(|e| {
                        KindredError::VectorIndex(format!("Failed to prepare search: {}", e))
                    })?;

                let mut best: HashMap<GoalNodeId, IndexHit> = HashMap::new();

                for vector in &vectors {
                    let query_json = serde_json::to_string(vector)?;

                    let rows = stmt
                        .query_map(rusqlite::params![&query_json, fetch as i64], |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, f32>(1)?,
                                row.get::<_, String>(2)?,
                                row.get::<_, String>(3)?,
                            ))
                        })
                        .and_then(|mapped| mapped.collect::<SqliteResult<Vec<_>>>())
                        .map_err(|e| {
                            KindredError::VectorIndex(format!(
                                "Failed to execute vector search: {}",
                                e
                            ))
                        })?;

                    for (node_raw, distance, owner_raw, domain_raw) in rows {
                        if owner_raw == exclude_raw {
                            continue;
                        }
                        let domain = match LifeDomain::parse(&domain_raw) {
                            Some(domain) => domain,
                            None => continue,
                        };
                        let node_id = GoalNodeId::from_string(&node_raw)?;

                        // Cosine distance, so this recovers the similarity
                        let similarity = 1.0 - distance;

                        let hit = IndexHit {
                            owner_id: UserId::from_string(&owner_raw)?,
                            goal_node_id: node_id,
                            domain,
                            similarity,
                        };

                        match best.get(&node_id) {
                            Some(existing) if existing.similarity >= similarity => {}
                            _ => {
                                best.insert(node_id, hit);
                            }
                        }
                    }
                }

                let mut hits: Vec<IndexHit> = best.into_values().collect();
                hits.sort_by(|a, b| {
                    b.similarity
                        .partial_cmp(&a.similarity)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.goal_node_id.0.cmp(&b.goal_node_id.0))
                });
                Ok(hits)
            })
            .await;

        match result {
            Ok(Ok(hits)) if hits.is_empty() => IndexQueryOutcome::Empty,
            Ok(Ok(hits)) => {
                debug!("Vector query returned {} hits", hits.len());
                IndexQueryOutcome::Hits(hits)
            }
            Ok(Err(e)) => IndexQueryOutcome::Unavailable(e.to_string()),
            Err(e) => IndexQueryOutcome::Unavailable(format!("Pool interaction failed: {}", e)),
        }
    }

    async fn prune_owner(&self, owner_id: UserId, keep: &[GoalNodeId]) -> Result<usize> {
        let owner = owner_id.to_string();
        let keep: HashSet<String> = keep.iter().map(|id| id.to_string()).collect();

        let conn = self.pool.get().await.map_err(|e| {
            KindredError::VectorIndex(format!("Failed to get connection from pool: {}", e))
        })?;

        let pruned = conn
            .interact(move |conn| -> Result<usize> {
                let existing = {
                    let mut stmt = conn
                        .prepare("SELECT node_id FROM goal_vector_meta WHERE owner_id = ?")
                        .map_err(|e| {
                            KindredError::VectorIndex(format!(
                                "Failed to prepare prune query: {}",
                                e
                            ))
                        })?;

                    stmt.query_map(rusqlite::params![&owner], |row| row.get::<_, String>(0))
                        .and_then(|mapped| mapped.collect::<SqliteResult<Vec<_>>>())
                        .map_err(|e| {
                            KindredError::VectorIndex(format!(
                                "Failed to list indexed nodes: {}",
                                e
                            ))
                        })?
                };

                let stale: Vec<String> = existing
                    .into_iter()
                    .filter(|id| !keep.contains(id))
                    .collect();

                if stale.is_empty() {
                    return Ok(0);
                }

                let tx = conn.transaction().map_err(|e| {
                    KindredError::VectorIndex(format!("Failed to begin transaction: {}", e))
                })?;

                for node_id in &stale {
                    tx.execute(
                        "DELETE FROM goal_vectors WHERE node_id = ?",
                        rusqlite::params![node_id],
                    )
                    .map_err(|e| {
                        KindredError::VectorIndex(format!("Failed to prune vector: {}", e))
                    })?;
                    tx.execute(
                        "DELETE FROM goal_vector_meta WHERE node_id = ?",
                        rusqlite::params![node_id],
                    )
                    .map_err(|e| {
                        KindredError::VectorIndex(format!("Failed to prune metadata: {}", e))
                    })?;
                }

                tx.commit().map_err(|e| {
                    KindredError::VectorIndex(format!("Failed to commit prune: {}", e))
                })?;

                Ok(stale.len())
            })
            .await
            .map_err(|e| KindredError::VectorIndex(format!("Pool interaction failed: {}", e)))??;

        if pruned > 0 {
            debug!("Pruned {} stale vectors for owner {}", pruned, owner_id);
        }
        Ok(pruned)
    }
}

/// vec0 stores embeddings as packed little-endian f32
fn decode_blob(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
