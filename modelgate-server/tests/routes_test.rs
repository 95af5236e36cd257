//! Router smoke tests: every surface mounts and the handlers answer with
//! the right shapes and status codes.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tempfile::TempDir;
use tokio::sync::{watch, Mutex};
use tower::ServiceExt;

use modelgate_server::agent::AgentJobService;
use modelgate_server::backends::BackendRegistry;
use modelgate_server::config::Config;
use modelgate_server::gallery::{GalleryContext, GalleryService};
use modelgate_server::loader::ModelLoader;
use modelgate_server::model_config::{LoadDefaults, ModelConfigLoader};
use modelgate_server::routes;
use modelgate_server::state::AppState;
use modelgate_server::system::SystemState;

async fn test_state() -> (TempDir, watch::Sender<bool>, Arc<AppState>) {
    let tmp = TempDir::new().unwrap();
    let system = Arc::new(
        SystemState::new(
            tmp.path().join("models"),
            tmp.path().join("backends"),
            tmp.path().join("system-backends"),
            tmp.path().join("generated"),
        )
        .unwrap(),
    );
    let registry = Arc::new(BackendRegistry::new(system.clone()));
    let config_loader = Arc::new(ModelConfigLoader::new(system.clone()));
    let configs_dir = tmp.path().join("configuration");
    std::fs::create_dir_all(&configs_dir).unwrap();
    let mut config = Config::default();
    config.paths.configs = configs_dir.clone();
    let model_loader = Arc::new(ModelLoader::new(
        registry.clone(),
        config.loader_settings(),
    ));
    let gallery = GalleryService::new(GalleryContext {
        system: system.clone(),
        config_loader: config_loader.clone(),
        model_loader: model_loader.clone(),
        registry: registry.clone(),
        galleries: vec![],
        backend_galleries: vec![],
        autoload_backend_galleries: false,
        load_defaults: LoadDefaults::default(),
        http: reqwest::Client::new(),
    });
    let agent = AgentJobService::new(config_loader.clone(), &configs_dir, "127.0.0.1:0", "", 30);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = Arc::new(AppState {
        config: std::sync::RwLock::new(config),
        system,
        registry,
        config_loader,
        model_loader,
        gallery,
        agent,
        watchdog: Mutex::new(None),
        shutdown_rx,
    });
    (tmp, shutdown_tx, state)
}

async fn get(app: &axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_health() {
    let (_tmp, _shutdown, state) = test_state().await;
    let app = routes::router(state);

    let (status, body) = get(&app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["loaded_backends"], 0);
}

#[tokio::test]
async fn test_models_list_empty() {
    let (_tmp, _shutdown, state) = test_state().await;
    let app = routes::router(state);

    let (status, body) = get(&app, "/v1/models").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["object"], "list");
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_load_unknown_model_is_404() {
    let (_tmp, _shutdown, state) = test_state().await;
    let app = routes::router(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/models/nope/load")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_gallery_job_status_unknown_is_404() {
    let (_tmp, _shutdown, state) = test_state().await;
    let app = routes::router(state);

    let (status, body) = get(&app, "/api/gallery/jobs/no-such-uuid").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "not_found");
}

#[tokio::test]
async fn test_agent_task_crud_over_http() {
    let (_tmp, _shutdown, state) = test_state().await;
    let app = routes::router(state);

    let create = Request::builder()
        .method("POST")
        .uri("/api/agent/tasks")
        .header("Content-Type", "application/json")
        .body(Body::from(
            serde_json::json!({
                "name": "t",
                "model": "m",
                "prompt": "hello"
            })
            .to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(create).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let id = body["id"].as_str().unwrap().to_string();

    let (status, task) = get(&app, &format!("/api/agent/tasks/{}", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["name"], "t");
    assert_eq!(task["enabled"], true);

    let (status, tasks) = get(&app, "/api/agent/tasks").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tasks.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_settings_round_trip_over_http() {
    let (_tmp, _shutdown, state) = test_state().await;
    let app = routes::router(state.clone());

    let (status, body) = get(&app, "/api/settings").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["max_active_backends"], 0);

    let update = Request::builder()
        .method("POST")
        .uri("/api/settings")
        .header("Content-Type", "application/json")
        .body(Body::from(
            serde_json::json!({"max_active_backends": 2}).to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(update).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (_, body) = get(&app, "/api/settings").await;
    assert_eq!(body["max_active_backends"], 2);
    assert_eq!(
        state.config.read().unwrap().backends.max_active_backends,
        2
    );
}
