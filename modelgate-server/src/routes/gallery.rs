//! Gallery job endpoints: enqueue installs/deletes and poll job status.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::error::Result;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/models/apply", post(install_model))
        .route("/models/delete/:name", post(delete_model))
        .route("/backends/apply", post(install_backend))
        .route("/backends/delete/:name", post(delete_backend))
        .route("/jobs", get(all_jobs))
        .route("/jobs/:id", get(job_status))
        .route("/jobs/:id/cancel", post(cancel_job))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct InstallModelRequest {
    /// `gallery@name`, bare element name, or manifest URL.
    id: String,
    #[serde(default)]
    overrides: HashMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct InstallBackendRequest {
    id: String,
    #[serde(default)]
    uri: String,
}

async fn install_model(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InstallModelRequest>,
) -> Result<Json<serde_json::Value>> {
    let job_id = state.gallery.install_model(&req.id, req.overrides)?;
    Ok(Json(json!({"uuid": job_id})))
}

async fn delete_model(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let job_id = state.gallery.delete_model(&name)?;
    Ok(Json(json!({"uuid": job_id})))
}

async fn install_backend(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InstallBackendRequest>,
) -> Result<Json<serde_json::Value>> {
    let job_id = state.gallery.install_backend(&req.id, &req.uri)?;
    Ok(Json(json!({"uuid": job_id})))
}

async fn delete_backend(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let job_id = state.gallery.delete_backend(&name)?;
    Ok(Json(json!({"uuid": job_id})))
}

async fn all_jobs(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!(state.gallery.all_statuses()))
}

async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    match state.gallery.get_status(&id) {
        Some(status) => Ok(Json(serde_json::to_value(status)?)),
        None => Err(crate::error::Error::NotFound(format!(
            "no gallery job {}",
            id
        ))),
    }
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.gallery.cancel(&id)?;
    Ok(Json(json!({"cancelled": id})))
}
