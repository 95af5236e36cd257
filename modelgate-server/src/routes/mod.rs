//! Thin HTTP surface over the core services.
//!
//! Handlers only decode requests and call into the registry, loader,
//! gallery and agent services; no policy lives here.

pub mod agent;
pub mod gallery;
pub mod health;
pub mod models;
pub mod settings;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/healthz", health::router(state.clone()))
        .nest("/v1/models", models::router(state.clone()))
        .nest("/api/gallery", gallery::router(state.clone()))
        .nest("/api/agent", agent::router(state.clone()))
        .nest("/api/settings", settings::router(state))
}
