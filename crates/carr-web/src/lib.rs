//! Axum JSON API for the actor registry: the sync contract plus record
//! lookup and health endpoints.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use carr_store::AuthoritativeStore;
use carr_sync::SyncResponse;
use tokio::net::TcpListener;
use tracing::warn;

pub const CRATE_NAME: &str = "carr-web";

#[derive(Clone)]
pub struct AppState {
    pub store: AuthoritativeStore,
}

impl AppState {
    pub fn new(store_path: impl Into<PathBuf>) -> Self {
        Self {
            store: AuthoritativeStore::new(store_path.into()),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/actors/sync", get(sync_handler))
        .route("/api/actors/{id}", get(actor_detail_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("CARR_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let store_path = std::env::var("CARR_STORE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/actors.json"));
    let state = AppState::new(store_path);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Full authoritative set for the client to reconcile against. Store read
/// failures surface as `success: false` with a message; the consumer's
/// cache stays untouched and the session can retry later.
async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.load().await {
        Ok(records) => {
            let actors = records.into_values().collect();
            Json(SyncResponse::ok(actors)).into_response()
        }
        Err(err) => {
            warn!(error = %err, "sync endpoint could not read the store");
            Json(SyncResponse::failure(format!("store unavailable: {err}"))).into_response()
        }
    }
}

async fn actor_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.store.load().await {
        Ok(records) => match records.get(&id) {
            Some(actor) => Json(actor.clone()).into_response(),
            None => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "actor not found", "id": id })),
            )
                .into_response(),
        },
        Err(err) => {
            warn!(error = %err, "detail endpoint could not read the store");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}
