//! HTTP server exposing the matching engine

use crate::engine::MatchEngine;
use crate::error::{KindredError, Result};
use crate::types::{
    FeedbackEvent, GoalNode, GoalNodeId, LifeDomain, MatchFilter, MatchResult, UserId,
    WeightUpdate,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Server address
    pub addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            addr: ([127, 0, 0, 1], 7070).into(),
        }
    }
}

/// Shared handler state
#[derive(Clone)]
struct AppState {
    engine: Arc<MatchEngine>,
}

/// API server
pub struct ApiServer {
    config: ApiServerConfig,
    engine: Arc<MatchEngine>,
}

impl ApiServer {
    /// Create a new API server over an assembled engine
    pub fn new(config: ApiServerConfig, engine: Arc<MatchEngine>) -> Self {
        Self { config, engine }
    }

    /// Build router
    fn build_router(state: AppState) -> Router {
        Router::new()
            // Matching
            .route("/matches/:user_id", get(get_matches_handler))
            // Feedback and recalibration
            .route("/feedback", post(post_feedback_handler))
            // Tree replacement
            .route("/trees/:user_id", put(put_tree_handler))
            // Health check
            .route("/health", get(health_handler))
            // State
            .with_state(state)
            // Middleware
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until a shutdown signal arrives
    pub async fn serve(self) -> anyhow::Result<()> {
        let state = AppState {
            engine: self.engine.clone(),
        };
        let router = Self::build_router(state);

        let listener = tokio::net::TcpListener::bind(self.config.addr).await?;
        info!("Matching API listening on http://{}", self.config.addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received, draining connections");
}

/// Match query string: `?domains=fitness,career&limit=20`
#[derive(Debug, Default, Deserialize)]
struct MatchQuery {
    domains: Option<String>,
    limit: Option<usize>,
}

impl MatchQuery {
    fn into_filter(self) -> Result<MatchFilter> {
        let domains = match self.domains.as_deref() {
            None | Some("") => Vec::new(),
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    LifeDomain::parse(s).ok_or_else(|| {
                        KindredError::InvalidRequest(format!("unknown domain: {}", s))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        };

        Ok(MatchFilter {
            domains,
            limit: self.limit,
        })
    }
}

/// One goal node in a tree replacement request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveNodeRequest {
    /// Client-assigned id; omitted ids are generated server-side
    #[serde(default)]
    id: Option<GoalNodeId>,
    domain: LifeDomain,
    name: String,
    #[serde(default)]
    custom_details: Option<String>,
    #[serde(default = "default_weight")]
    weight: f32,
    #[serde(default)]
    progress: f32,
    #[serde(default)]
    parent_id: Option<GoalNodeId>,
}

fn default_weight() -> f32 {
    1.0
}

impl SaveNodeRequest {
    fn into_node(self, owner_id: UserId) -> GoalNode {
        GoalNode {
            id: self.id.unwrap_or_else(GoalNodeId::new),
            owner_id,
            domain: self.domain,
            name: self.name,
            custom_details: self.custom_details,
            weight: self.weight,
            progress: self.progress,
            parent_id: self.parent_id,
            embedding: None,
        }
    }
}

/// GET /matches/:user_id
///
/// The cancellation token is tied to the request future: when the client
/// disconnects, the drop guard cancels it and in-flight scoring threads
/// abandon the scan.
async fn get_matches_handler(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<MatchQuery>,
) -> std::result::Result<Json<Vec<MatchResult>>, ApiError> {
    let user_id = UserId::from_string(&user_id).map_err(KindredError::from)?;
    let filter = query.into_filter()?;

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let results = state.engine.get_matches(user_id, &filter, &cancel).await?;
    Ok(Json(results))
}

/// POST /feedback
async fn post_feedback_handler(
    State(state): State<AppState>,
    Json(event): Json<FeedbackEvent>,
) -> std::result::Result<Json<WeightUpdate>, ApiError> {
    let update = state.engine.apply_feedback(event).await?;
    Ok(Json(update))
}

/// PUT /trees/:user_id
async fn put_tree_handler(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(nodes): Json<Vec<SaveNodeRequest>>,
) -> std::result::Result<StatusCode, ApiError> {
    let owner_id = UserId::from_string(&user_id).map_err(KindredError::from)?;
    let nodes: Vec<GoalNode> = nodes.into_iter().map(|n| n.into_node(owner_id)).collect();
    state.engine.save_tree(owner_id, nodes).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /health
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    version: String,
    queue_depth: usize,
    index_configured: bool,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        queue_depth: state.engine.queue_depth(),
        index_configured: state.engine.index_configured(),
    })
}

/// Error wrapper mapping engine errors onto HTTP responses
#[derive(Debug)]
struct ApiError(KindredError);

impl<E: Into<KindredError>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            KindredError::NoGoalsConfigured(_) => (StatusCode::NOT_FOUND, "no_goals_configured"),
            KindredError::FeedbackTargetNotFound { .. } => {
                (StatusCode::NOT_FOUND, "feedback_target_not_found")
            }
            KindredError::InvalidId(_) => (StatusCode::BAD_REQUEST, "invalid_id"),
            KindredError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            KindredError::InvalidTree(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_tree"),
            KindredError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "cancelled"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
            "internal error".to_string()
        } else {
            self.0.to_string()
        };

        let body = ErrorBody {
            code: code.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
