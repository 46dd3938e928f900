//! Axum JSON surface for the reconciliation engine.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use recon_core::{ScopeFilter, SyncRequest, SyncResponse, SyncResult, SyncStage};
use recon_storage::{ContentStore, PgContentStore, PostCache};
use recon_sync::{validate_scope, SyncConfig, SyncEngine};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "recon-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub cache: Arc<PostCache>,
}

impl AppState {
    /// The engine drops cached listings for a scope whenever a sync changes it.
    pub fn new(store: Arc<dyn ContentStore>, config: &SyncConfig) -> anyhow::Result<Self> {
        let cache = Arc::new(PostCache::new(config.cache_ttl()));
        let engine = SyncEngine::from_config(store, config)?.with_cache(Arc::clone(&cache));
        Ok(Self {
            engine: Arc::new(engine),
            cache,
        })
    }
}

#[derive(Debug, Deserialize, Default)]
struct PostsQuery {
    scope: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/sync", post(sync_handler))
        .route("/api/posts", get(posts_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let store = PgContentStore::connect(&config.database_url)
        .await
        .context("connecting to post store")?;
    let state = AppState::new(Arc::new(store), &config)?;
    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, "serving reconciliation api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn sync_handler(State(state): State<AppState>, Json(request): Json<SyncRequest>) -> Response {
    let result = state.engine.run(request).await;
    (status_for(&result), Json(SyncResponse::from(&result))).into_response()
}

async fn posts_handler(State(state): State<AppState>, Query(query): Query<PostsQuery>) -> Response {
    let scope = match validate_scope(query.scope.as_deref()) {
        Ok(scope) => scope,
        Err(err) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() }))).into_response(),
    };
    let filter = ScopeFilter::from_scope(scope);
    match state.cache.get_or_load(state.engine.store().as_ref(), &filter).await {
        Ok(posts) => Json(posts.as_slice()).into_response(),
        Err(err) => {
            error!(error = %err, scope = %filter, "listing posts failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

fn status_for(result: &SyncResult) -> StatusCode {
    match result.failed_stage {
        None => StatusCode::OK,
        Some(SyncStage::Received) => StatusCode::BAD_REQUEST,
        Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
