//! Agent task and job endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use modelgate_common::agent::{JobStatus, Task};

use crate::error::{Error, Result};
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tasks", get(list_tasks).post(create_task))
        .route(
            "/tasks/:id",
            get(get_task).put(update_task).delete(delete_task),
        )
        .route("/tasks/:id/run", post(run_task))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job).delete(delete_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .with_state(state)
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<Task>> {
    Json(state.agent.list_tasks())
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(task): Json<Task>,
) -> Result<Json<serde_json::Value>> {
    let id = state.agent.create_task(task)?;
    Ok(Json(json!({"id": id})))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Task>> {
    state
        .agent
        .get_task(&id)
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("task not found: {}", id)))
}

async fn update_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(task): Json<Task>,
) -> Result<Json<serde_json::Value>> {
    state.agent.update_task(&id, task)?;
    Ok(Json(json!({"updated": id})))
}

async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.agent.delete_task(&id)?;
    Ok(Json(json!({"deleted": id})))
}

#[derive(Debug, Deserialize)]
struct RunTaskRequest {
    #[serde(default)]
    parameters: HashMap<String, String>,
}

async fn run_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RunTaskRequest>,
) -> Result<Json<serde_json::Value>> {
    let job_id = state.agent.execute_job(&id, req.parameters, "api").await?;
    Ok(Json(json!({"job_id": job_id})))
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    status: Option<JobStatus>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListJobsQuery>,
) -> Json<serde_json::Value> {
    let jobs = state.agent.list_jobs(
        query.task_id.as_deref(),
        query.status,
        query.limit.unwrap_or(0),
    );
    Json(json!({"jobs": jobs}))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state
        .agent
        .get_job(&id)
        .map(|j| Json(json!(j)))
        .ok_or_else(|| Error::NotFound(format!("job not found: {}", id)))
}

async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.agent.delete_job(&id)?;
    Ok(Json(json!({"deleted": id})))
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.agent.cancel_job(&id)?;
    Ok(Json(json!({"cancelled": id})))
}
