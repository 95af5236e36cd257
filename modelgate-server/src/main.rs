//! ModelGate - self-hosted inference gateway.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use modelgate_server::agent::AgentJobService;
use modelgate_server::backends::BackendRegistry;
use modelgate_server::config::Config;
use modelgate_server::gallery::{GalleryContext, GalleryService};
use modelgate_server::loader::ModelLoader;
use modelgate_server::model_config::ModelConfigLoader;
use modelgate_server::routes;
use modelgate_server::state::AppState;
use modelgate_server::system::SystemState;
use modelgate_server::watchdog::Watchdog;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load().map_err(|e| format!("failed to load configuration: {}", e))?;

    let configs_dir = config.paths.configs.clone();
    std::fs::create_dir_all(&configs_dir)?;
    config.apply_runtime_settings_file(&configs_dir);

    let system = Arc::new(SystemState::new(
        &config.paths.models,
        &config.paths.backends,
        &config.paths.system_backends,
        &config.paths.generated_content,
    )?);

    let registry = Arc::new(BackendRegistry::new(system.clone()));
    registry.rescan().await?;
    registry
        .load_external_backends_file(&config.paths.configs.join("external_backends.json"))
        .await?;

    let config_loader = Arc::new(ModelConfigLoader::new(system.clone()));
    let defaults = config.load_defaults();
    config_loader
        .load_from_directory(&system.models_path, &defaults)
        .await?;
    if let Err(e) = config_loader.preload().await {
        tracing::warn!(error = %e, "model preload failed");
    }

    let model_loader = Arc::new(ModelLoader::new(
        registry.clone(),
        config.loader_settings(),
    ));

    // Application-wide shutdown signal; every long-lived task observes it.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watchdog_handle = if config.watchdog_needed() {
        let wd = Arc::new(Watchdog::new(
            model_loader.clone(),
            config.watchdog_settings(),
        ));
        Some(wd.spawn(shutdown_rx.clone()))
    } else {
        tracing::info!("watchdog disabled");
        None
    };

    let gallery = GalleryService::new(GalleryContext {
        system: system.clone(),
        config_loader: config_loader.clone(),
        model_loader: model_loader.clone(),
        registry: registry.clone(),
        galleries: config.galleries.sources.clone(),
        backend_galleries: config.galleries.backend_sources.clone(),
        autoload_backend_galleries: config.galleries.autoload_backend_galleries,
        load_defaults: defaults,
        http: reqwest::Client::new(),
    });
    gallery.start(shutdown_rx.clone()).await;

    let agent = AgentJobService::new(
        config_loader.clone(),
        &config.paths.configs,
        &config.api.local_address(),
        config.api_keys.first().map(String::as_str).unwrap_or(""),
        config.agent.job_retention_days,
    );
    agent.start(shutdown_rx.clone()).await;

    let addr = format!("{}:{}", config.api.host, config.api.port);
    let state = Arc::new(AppState {
        config: std::sync::RwLock::new(config),
        system,
        registry,
        config_loader,
        model_loader: model_loader.clone(),
        gallery,
        agent,
        watchdog: Mutex::new(watchdog_handle),
        shutdown_rx: shutdown_rx.clone(),
    });

    modelgate_server::config_watcher::ConfigWatcher::new(state.clone())
        .spawn(shutdown_rx.clone());

    let app = routes::router(state.clone()).layer(CorsLayer::permissive());

    tracing::info!(addr = %addr, "listening");
    let listener = TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    // Teardown order: cron and agent workers, gallery workers and the
    // watchdog all observe the shutdown signal; backends go down last.
    let _ = shutdown_tx.send(true);
    if let Some(handle) = state.watchdog.lock().await.take() {
        handle.stop(std::time::Duration::from_secs(5)).await;
    }
    model_loader.stop_all().await?;
    tracing::info!("shutdown complete");

    Ok(())
}
