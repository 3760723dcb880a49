//! Kindred - Goal-Compatibility Matching Engine
//!
//! This is the main entry point for the kindred server, which ranks users by
//! the compatibility of their weighted life-goal trees and recalibrates goal
//! weights from peer feedback.

use clap::{Parser, Subcommand};
use kindred_core::{
    api::{ApiServer, ApiServerConfig},
    embeddings::{EmbeddingWorker, RemoteEmbeddingService},
    CachedTreeStore, ConnectionMode, EngineConfig, GoalTreeStore, LibsqlGoalStore, MatchEngine,
    SqliteVectorIndex, VectorIndex,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{self, EnvFilter};

/// Get the database path from the CLI arg or the environment-derived default
fn resolve_db_path(cli_path: Option<String>, config: &EngineConfig) -> String {
    cli_path.unwrap_or_else(|| config.database.path.clone())
}

/// Assemble the engine from configuration
///
/// The vector index and embedding worker are both optional at runtime: a
/// missing or broken index only costs the fast path, and without a provider
/// saved trees simply stay unindexed. Storage failures are the only thing
/// that aborts startup.
async fn build_engine(
    config: &EngineConfig,
    db_path: String,
    create_if_missing: bool,
) -> kindred_core::Result<(Arc<MatchEngine>, Option<JoinHandle<()>>)> {
    // Ensure parent directory exists
    if let Some(parent) = PathBuf::from(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let store =
        LibsqlGoalStore::new_with_validation(ConnectionMode::Local(db_path), create_if_missing)
            .await?;
    let store: Arc<dyn GoalTreeStore> = Arc::new(CachedTreeStore::new(
        Arc::new(store),
        config.database.tree_cache_size,
    ));

    let index: Option<Arc<dyn VectorIndex>> = if config.index.enabled {
        match SqliteVectorIndex::new(&config.index.path, config.index.dimensions) {
            Ok(index) => Some(Arc::new(index)),
            Err(e) => {
                warn!(
                    "Vector index unavailable, matching falls back to exhaustive scoring: {}",
                    e
                );
                None
            }
        }
    } else {
        debug!("Vector index disabled by configuration");
        None
    };

    let mut worker_join = None;
    let worker_handle = match &index {
        Some(index) if config.embeddings.is_configured() => {
            let embedder =
                RemoteEmbeddingService::from_config(&config.embeddings, config.index.dimensions)?;
            let (handle, join) = EmbeddingWorker::new(Arc::new(embedder), index.clone()).spawn();
            info!("Embedding worker started (model: {})", config.embeddings.model);
            worker_join = Some(join);
            Some(handle)
        }
        Some(_) => {
            info!("No embedding provider configured; saved goals will not be indexed");
            None
        }
        None => None,
    };

    let engine = MatchEngine::new(store, index, worker_handle, config);
    Ok((Arc::new(engine), worker_join))
}

#[derive(Parser)]
#[command(name = "kindred")]
#[command(about = "Goal-compatibility matching engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Goal database path (overrides KINDRED_DB_PATH env var and default)
    #[arg(long)]
    db_path: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP matching server
    Serve {
        /// Server address
        #[arg(long, default_value = "127.0.0.1:7070")]
        addr: String,
    },

    /// Initialize the goal database and vector index
    Init {
        /// Database path
        #[arg(short, long)]
        database: Option<String>,
    },

    /// Show engine status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Scope the filter to our crates; HTTP request traces follow the same level
    let filter = EnvFilter::new(format!(
        "kindred={0},kindred_core={0},tower_http={0}",
        level.as_str().to_lowercase()
    ));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr) // Write logs to stderr, not stdout
        .init();

    debug!("Kindred v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::from_env()?;

    match cli.command {
        Commands::Serve { addr } => {
            let socket_addr: SocketAddr = addr
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", addr, e))?;

            let db_path = resolve_db_path(cli.db_path, &config);
            debug!("Using database: {}", db_path);

            // Serve creates the database if missing (first-time setup)
            let (engine, worker_join) = build_engine(&config, db_path, true).await?;

            info!("Kindred listening on http://{}", socket_addr);
            let server = ApiServer::new(ApiServerConfig { addr: socket_addr }, engine.clone());
            server.serve().await?;

            // Dropping the engine closes the job queue; the worker drains
            // whatever is still enqueued before its task ends.
            drop(engine);
            if let Some(join) = worker_join {
                debug!("Waiting for embedding worker to drain...");
                let _ = join.await;
            }

            info!("Shutdown complete");
            Ok(())
        }
        Commands::Init { database } => {
            debug!("Initializing database...");

            let db_path = database
                .or(cli.db_path)
                .unwrap_or_else(|| config.database.path.clone());
            debug!("Database path: {}", db_path);

            if let Some(parent) = PathBuf::from(&db_path).parent() {
                std::fs::create_dir_all(parent)?;
            }

            // Init explicitly creates the database and runs migrations
            let _store =
                LibsqlGoalStore::new_with_validation(ConnectionMode::Local(db_path.clone()), true)
                    .await?;
            println!("✓ Goal database initialized: {}", db_path);

            if config.index.enabled {
                let _index = SqliteVectorIndex::new(&config.index.path, config.index.dimensions)?;
                println!("✓ Vector index initialized: {}", config.index.path);
            }

            Ok(())
        }
        Commands::Status => {
            println!("Kindred v{}", env!("CARGO_PKG_VERSION"));
            println!();

            let db_path = resolve_db_path(cli.db_path, &config);
            let db_exists = PathBuf::from(&db_path).exists();

            println!("📊 Goal database");
            println!("   Path:   {}", db_path);
            println!(
                "   Status: {}",
                if db_exists {
                    "✓ exists"
                } else {
                    "✗ not initialized"
                }
            );
            if db_exists {
                match LibsqlGoalStore::new_with_validation(
                    ConnectionMode::Local(db_path.clone()),
                    false,
                )
                .await
                {
                    Ok(store) => match store.tree_count().await {
                        Ok(count) => println!("   Trees:  {}", count),
                        Err(_) => println!("   Trees:  unable to query"),
                    },
                    Err(e) => println!("   Health: ✗ {}", e),
                }
            }
            println!();

            println!("🧭 Vector index");
            if config.index.enabled {
                let index_exists = PathBuf::from(&config.index.path).exists();
                println!("   Path:       {}", config.index.path);
                println!(
                    "   Status:     {}",
                    if index_exists {
                        "✓ exists"
                    } else {
                        "✗ not initialized"
                    }
                );
                println!("   Dimensions: {}", config.index.dimensions);
                println!("   Top-k:      {}", config.index.top_k);
            } else {
                println!("   Disabled (KINDRED_INDEX_ENABLED=false)");
            }
            println!();

            println!("🔑 Embedding provider");
            if config.embeddings.is_configured() {
                println!("   URL:   {}", config.embeddings.api_url);
                println!("   Model: {}", config.embeddings.model);
            } else {
                println!("   Not configured (set KINDRED_EMBEDDING_API_URL)");
            }
            println!();

            if !db_exists {
                println!("💡 Next steps:");
                println!("   Initialize database: kindred init");
                println!();
            }

            Ok(())
        }
    }
}
