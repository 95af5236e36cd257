//! Model listing and lifecycle endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use modelgate_common::usecase::Usecase;

use crate::error::{Error, Result};
use crate::loader::LoadSpec;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(list_models))
        .route("/loaded", get(list_loaded))
        .route("/:name/load", post(load_model))
        .route("/:name/stop", post(stop_model))
        .with_state(state)
}

async fn list_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let models: Vec<serde_json::Value> = state
        .config_loader
        .all()
        .await
        .into_iter()
        .map(|c| {
            json!({
                "id": c.name,
                "object": "model",
                "backend": c.backend,
                "usecases": c.known_usecases,
            })
        })
        .collect();
    Json(json!({"object": "list", "data": models}))
}

async fn list_loaded(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let loaded: Vec<serde_json::Value> = state
        .model_loader
        .list()
        .await
        .into_iter()
        .map(|s| {
            json!({
                "model": s.model_name,
                "backend": s.backend_name,
                "address": s.address,
                "busy": s.busy_count,
            })
        })
        .collect();
    Json(json!({"loaded": loaded}))
}

async fn load_model(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let config = state
        .config_loader
        .get(&name)
        .await
        .ok_or_else(|| Error::NotFound(format!("model not found: {}", name)))?;

    let spec = LoadSpec::from_config(&config, &state.system, Usecase::ANY);
    let backend = state.model_loader.load(spec).await?;
    Ok(Json(json!({
        "model": backend.model_name,
        "backend": backend.backend_name,
        "address": backend.address,
    })))
}

async fn stop_model(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.model_loader.stop(&name).await?;
    Ok(Json(json!({"stopped": name})))
}
