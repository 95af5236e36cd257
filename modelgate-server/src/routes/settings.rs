//! Runtime settings endpoints: read the current values, apply a delta,
//! persist it, and restart the watchdog when the delta requires it.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::config::RuntimeSettings;
use crate::error::Result;
use crate::state::AppState;
use crate::watchdog::Watchdog;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(get_settings).post(update_settings))
        .with_state(state)
}

async fn get_settings(State(state): State<Arc<AppState>>) -> Json<RuntimeSettings> {
    let settings = state.config.read().unwrap().to_runtime_settings();
    Json(settings)
}

async fn update_settings(
    State(state): State<Arc<AppState>>,
    Json(settings): Json<RuntimeSettings>,
) -> Result<Json<serde_json::Value>> {
    let (watchdog_changed, loader_settings, watchdog_settings, watchdog_needed, configs_dir) = {
        let mut config = state.config.write().unwrap();
        let changed = config.apply_runtime_settings(&settings);
        (
            changed,
            config.loader_settings(),
            config.watchdog_settings(),
            config.watchdog_needed(),
            config.paths.configs.clone(),
        )
    };

    state.model_loader.update_settings(loader_settings);
    if let Err(e) = {
        let config = state.config.read().unwrap();
        config.save_runtime_settings_file(&configs_dir)
    } {
        tracing::warn!(error = %e, "could not persist runtime settings");
    }

    if watchdog_changed {
        let mut handle = state.watchdog.lock().await;
        if let Some(old) = handle.take() {
            old.stop(std::time::Duration::from_secs(5)).await;
        }
        if watchdog_needed {
            let wd = Arc::new(Watchdog::new(
                state.model_loader.clone(),
                watchdog_settings,
            ));
            *handle = Some(wd.spawn(state.shutdown_rx.clone()));
        }
    }

    if let Some(days) = settings.agent_job_retention_days {
        state.agent.update_retention_days(days);
    }

    Ok(Json(json!({
        "success": true,
        "watchdog_restarted": watchdog_changed,
    })))
}
