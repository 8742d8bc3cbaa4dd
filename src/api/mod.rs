//! Thin HTTP routing glue around the pricing core: root info, health,
//! metrics, and a read-only model listing. None of this touches the
//! settlement pipeline itself.

use axum::extract::State;
use axum::Json;
use serde_json::json;

use crate::state::AppState;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

/// Read-only listing of the current catalogue snapshot (not priced; the
/// pricing core never runs for this route).
pub async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let models = state.catalogue.snapshot();
    Json(json!({ "models": models.as_slice() }))
}
