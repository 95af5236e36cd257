//! Dynamic config file watcher.
//!
//! Polls the configs directory for changes to `runtime_settings.json`,
//! `external_backends.json` and `api_keys.json` and applies them without a
//! restart. Polling keeps the watcher portable; the files are tiny and the
//! interval coarse.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::RuntimeSettings;
use crate::state::AppState;
use crate::watchdog::Watchdog;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

const WATCHED_FILES: [&str; 3] = [
    "runtime_settings.json",
    "external_backends.json",
    "api_keys.json",
];

pub struct ConfigWatcher {
    state: Arc<AppState>,
    configs_dir: PathBuf,
    mtimes: HashMap<String, SystemTime>,
}

impl ConfigWatcher {
    pub fn new(state: Arc<AppState>) -> Self {
        let configs_dir = state.config.read().unwrap().paths.configs.clone();
        Self {
            state,
            configs_dir,
            mtimes: HashMap::new(),
        }
    }

    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            // Prime mtimes so startup-applied files are not re-applied.
            for file in WATCHED_FILES {
                if let Some(mtime) = self.mtime(file) {
                    self.mtimes.insert(file.to_string(), mtime);
                }
            }
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {
                        self.poll_once().await;
                    }
                    _ = shutdown.changed() => return,
                }
            }
        })
    }

    fn mtime(&self, file: &str) -> Option<SystemTime> {
        std::fs::metadata(self.configs_dir.join(file))
            .and_then(|m| m.modified())
            .ok()
    }

    async fn poll_once(&mut self) {
        for file in WATCHED_FILES {
            let Some(mtime) = self.mtime(file) else { continue };
            if self.mtimes.get(file) == Some(&mtime) {
                continue;
            }
            self.mtimes.insert(file.to_string(), mtime);
            tracing::info!(file, "dynamic config file changed");
            match file {
                "runtime_settings.json" => self.apply_runtime_settings().await,
                "external_backends.json" => self.apply_external_backends().await,
                "api_keys.json" => self.apply_api_keys(),
                _ => {}
            }
        }
    }

    async fn apply_runtime_settings(&self) {
        let path = self.configs_dir.join("runtime_settings.json");
        let Ok(content) = std::fs::read_to_string(&path) else { return };
        let settings: RuntimeSettings = match serde_json::from_str(&content) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed runtime_settings.json");
                return;
            }
        };

        let (changed, loader_settings, watchdog_settings, watchdog_needed) = {
            let mut config = self.state.config.write().unwrap();
            let changed = config.apply_runtime_settings(&settings);
            (
                changed,
                config.loader_settings(),
                config.watchdog_settings(),
                config.watchdog_needed(),
            )
        };
        self.state.model_loader.update_settings(loader_settings);

        if changed {
            let mut handle = self.state.watchdog.lock().await;
            if let Some(old) = handle.take() {
                old.stop(Duration::from_secs(5)).await;
            }
            if watchdog_needed {
                let wd = Arc::new(Watchdog::new(
                    self.state.model_loader.clone(),
                    watchdog_settings,
                ));
                *handle = Some(wd.spawn(self.state.shutdown_rx.clone()));
            }
            tracing::info!("watchdog restarted from runtime settings file");
        }
    }

    async fn apply_external_backends(&self) {
        let path = self.configs_dir.join("external_backends.json");
        if let Err(e) = self.state.registry.load_external_backends_file(&path).await {
            tracing::warn!(error = %e, "ignoring malformed external_backends.json");
        }
    }

    fn apply_api_keys(&self) {
        let path = self.configs_dir.join("api_keys.json");
        let Ok(content) = std::fs::read_to_string(&path) else { return };
        match serde_json::from_str::<Vec<String>>(&content) {
            Ok(keys) => {
                let mut config = self.state.config.write().unwrap();
                config.api_keys = keys;
                tracing::info!(count = config.api_keys.len(), "api keys reloaded");
            }
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed api_keys.json");
            }
        }
    }
}
