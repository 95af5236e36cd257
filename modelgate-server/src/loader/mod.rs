//! Backend process manager.
//!
//! The single authority over per-model backend subprocesses: spawning,
//! handshake, call bracketing, teardown. At most one live backend exists
//! per model name; everything else in the gateway goes through this map.

mod client;
mod process;

pub use client::BackendClient;
pub use process::BackendProcess;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};

use modelgate_common::{ModelOptions, Usecase};

use crate::backends::{BackendLocation, BackendRegistry};
use crate::error::{Error, Result};
use crate::model_config::ModelConfig;
use crate::system::SystemState;

/// How long a stopping entry is polled before re-checking the map.
const STOPPING_POLL: Duration = Duration::from_millis(100);

/// Runtime-tunable loader policy.
#[derive(Debug, Clone)]
pub struct LoaderSettings {
    /// Cap on simultaneously live backends; 0 means unlimited.
    pub max_active_backends: usize,
    /// Allow evicting a backend with in-flight calls.
    pub force_eviction_when_busy: bool,
    /// Retries while waiting for a busy backend to become idle.
    pub lru_eviction_max_retries: u32,
    pub lru_eviction_retry_interval: Duration,
    /// Grace period between Shutdown RPC and SIGKILL.
    pub shutdown_grace: Duration,
    pub log_backend_output: bool,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            max_active_backends: 0,
            force_eviction_when_busy: false,
            lru_eviction_max_retries: 30,
            lru_eviction_retry_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
            log_backend_output: false,
        }
    }
}

/// What to bring up: resolved from a `ModelConfig` at request time.
#[derive(Debug, Clone)]
pub struct LoadSpec {
    pub model_name: String,
    /// Backend identifier; empty triggers capability auto-pick.
    pub backend_name: String,
    /// Wanted capability, used for auto-pick.
    pub usecase: Usecase,
    pub options: ModelOptions,
    pub probe_attempts: u32,
    pub probe_sleep: Duration,
}

impl LoadSpec {
    pub fn from_config(cfg: &ModelConfig, system: &SystemState, usecase: Usecase) -> Self {
        Self {
            model_name: cfg.name.clone(),
            backend_name: cfg.backend.clone(),
            usecase,
            options: cfg.to_model_options(&system.models_path),
            probe_attempts: cfg.startup.attempts,
            probe_sleep: Duration::from_millis(cfg.startup.sleep_ms),
        }
    }
}

/// Runtime record for one live backend.
pub struct LoadedBackend {
    pub model_name: String,
    pub backend_name: String,
    pub address: String,
    pub options: ModelOptions,
    pub loaded_at: Instant,
    client: BackendClient,
    process: Option<BackendProcess>,
    last_used: StdMutex<Instant>,
    busy_count: AtomicU32,
    stopping: AtomicBool,
}

impl std::fmt::Debug for LoadedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedBackend")
            .field("model_name", &self.model_name)
            .field("backend_name", &self.backend_name)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl LoadedBackend {
    pub fn client(&self) -> &BackendClient {
        &self.client
    }

    pub fn busy_count(&self) -> u32 {
        self.busy_count.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.busy_count() == 0
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap()
    }

    pub fn touch(&self) {
        *self.last_used.lock().unwrap() = Instant::now();
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Claim the right to stop this backend. False when already claimed.
    fn begin_stop(&self) -> bool {
        !self.stopping.swap(true, Ordering::SeqCst)
    }

    async fn process_alive(&self) -> bool {
        match &self.process {
            Some(p) => p.is_alive().await,
            // External backends have no process to observe.
            None => true,
        }
    }

    async fn shutdown(&self, grace: Duration) {
        if let Err(e) = self.client.shutdown().await {
            tracing::debug!(model = %self.model_name, error = %e, "shutdown RPC failed");
        }
        if let Some(process) = &self.process {
            process.terminate(grace).await;
        }
    }
}

/// Point-in-time view of one loaded backend, consumed by the watchdog and
/// the HTTP surface.
#[derive(Debug, Clone)]
pub struct LoadedSnapshot {
    pub model_name: String,
    pub backend_name: String,
    pub address: String,
    pub busy_count: u32,
    pub last_used: Instant,
    pub loaded_at: Instant,
}

/// RAII bracket around one inference call: increments the busy count and
/// refreshes the LRU stamp on both edges.
pub struct CallGuard {
    backend: Arc<LoadedBackend>,
}

impl CallGuard {
    fn new(backend: Arc<LoadedBackend>) -> Self {
        backend.busy_count.fetch_add(1, Ordering::SeqCst);
        backend.touch();
        Self { backend }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.backend.busy_count.fetch_sub(1, Ordering::SeqCst);
        self.backend.touch();
    }
}

/// Singleton authority over every per-model subprocess.
pub struct ModelLoader {
    registry: Arc<BackendRegistry>,
    loaded: RwLock<HashMap<String, Arc<LoadedBackend>>>,
    /// Serializes the reserve-port → spawn → handshake critical section;
    /// concurrent loads for the same name resolve on the double-check.
    startup_lock: Mutex<()>,
    settings: StdMutex<LoaderSettings>,
}

impl ModelLoader {
    pub fn new(registry: Arc<BackendRegistry>, settings: LoaderSettings) -> Self {
        Self {
            registry,
            loaded: RwLock::new(HashMap::new()),
            startup_lock: Mutex::new(()),
            settings: StdMutex::new(settings),
        }
    }

    pub fn settings(&self) -> LoaderSettings {
        self.settings.lock().unwrap().clone()
    }

    pub fn update_settings(&self, settings: LoaderSettings) {
        *self.settings.lock().unwrap() = settings;
    }

    /// Live record for a model, if present and not shutting down.
    pub async fn get(&self, name: &str) -> Option<Arc<LoadedBackend>> {
        let loaded = self.loaded.read().await;
        loaded
            .get(name)
            .filter(|b| !b.is_stopping())
            .cloned()
    }

    pub async fn count(&self) -> usize {
        let loaded = self.loaded.read().await;
        loaded.values().filter(|b| !b.is_stopping()).count()
    }

    pub async fn list(&self) -> Vec<LoadedSnapshot> {
        let loaded = self.loaded.read().await;
        let mut snapshots: Vec<LoadedSnapshot> = loaded
            .values()
            .filter(|b| !b.is_stopping())
            .map(|b| LoadedSnapshot {
                model_name: b.model_name.clone(),
                backend_name: b.backend_name.clone(),
                address: b.address.clone(),
                busy_count: b.busy_count(),
                last_used: b.last_used(),
                loaded_at: b.loaded_at,
            })
            .collect();
        snapshots.sort_by(|a, b| a.model_name.cmp(&b.model_name));
        snapshots
    }

    /// Get-or-spawn. Exactly one spawn happens per model name no matter how
    /// many callers race here.
    pub async fn load(&self, spec: LoadSpec) -> Result<Arc<LoadedBackend>> {
        loop {
            match self.check_loaded(&spec.model_name).await {
                CheckResult::Ready(backend) => return Ok(backend),
                CheckResult::Wait => {
                    tokio::time::sleep(STOPPING_POLL).await;
                    continue;
                }
                CheckResult::Absent => break,
            }
        }

        let _permit = self.startup_lock.lock().await;

        // Double-check: a racing caller may have finished the bring-up
        // while we waited for the lock.
        if let CheckResult::Ready(backend) = self.check_loaded(&spec.model_name).await {
            return Ok(backend);
        }

        self.ensure_capacity(&spec.model_name).await?;

        let resolved = if spec.backend_name.is_empty() {
            self.registry.auto_pick(spec.usecase).await.ok_or_else(|| {
                Error::BackendNotFound(format!(
                    "no installed backend serves the requested usecase for {}",
                    spec.model_name
                ))
            })?
        } else {
            self.registry.resolve(&spec.backend_name).await?
        };
        let backend_name = resolved.name.clone();

        let settings = self.settings();
        let (address, process) = match resolved.location {
            BackendLocation::External(address) => (address, None),
            BackendLocation::Executable(exe) => {
                let port = reserve_port().await?;
                let address = format!("127.0.0.1:{}", port);
                let process = BackendProcess::spawn(
                    &exe,
                    &address,
                    &spec.options.environment,
                    settings.log_backend_output,
                )?;
                (address, Some(process))
            }
        };

        let client = BackendClient::new(&address);

        // Handshake: bounded retries with a fixed sleep. The process dying
        // mid-handshake fails fast.
        let mut ready = false;
        for _ in 0..spec.probe_attempts.max(1) {
            if let Some(p) = &process {
                if !p.is_alive().await {
                    return Err(Error::BackendStartupTimeout(format!(
                        "backend process for {} exited during startup",
                        spec.model_name
                    )));
                }
            }
            if client.health().await {
                ready = true;
                break;
            }
            tokio::time::sleep(spec.probe_sleep).await;
        }
        if !ready {
            if let Some(p) = &process {
                p.terminate(settings.shutdown_grace).await;
            }
            return Err(Error::BackendStartupTimeout(format!(
                "backend for {} did not answer on {} in time",
                spec.model_name, address
            )));
        }

        if let Err(e) = client.load_model(&spec.options).await {
            tracing::warn!(model = %spec.model_name, error = %e, "LoadModel failed, terminating backend");
            if let Some(p) = &process {
                p.terminate(settings.shutdown_grace).await;
            }
            return Err(e);
        }

        let record = Arc::new(LoadedBackend {
            model_name: spec.model_name.clone(),
            backend_name,
            address,
            options: spec.options,
            loaded_at: Instant::now(),
            client,
            process,
            last_used: StdMutex::new(Instant::now()),
            busy_count: AtomicU32::new(0),
            stopping: AtomicBool::new(false),
        });

        tracing::info!(
            model = %record.model_name,
            backend = %record.backend_name,
            address = %record.address,
            "backend ready"
        );

        let mut loaded = self.loaded.write().await;
        loaded.insert(spec.model_name, record.clone());
        Ok(record)
    }

    /// Stop one backend: Shutdown RPC, then signal escalation, and only
    /// then drop the record. Idempotent under races.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let record = {
            let loaded = self.loaded.read().await;
            loaded.get(name).cloned()
        };
        let record = match record {
            Some(r) => r,
            None => return Ok(()),
        };
        if !record.begin_stop() {
            // Another caller is already tearing this one down.
            return Ok(());
        }

        tracing::info!(model = %name, "stopping backend");
        let grace = self.settings().shutdown_grace;
        record.shutdown(grace).await;

        let mut loaded = self.loaded.write().await;
        if let Some(current) = loaded.get(name) {
            if Arc::ptr_eq(current, &record) {
                loaded.remove(name);
            }
        }
        Ok(())
    }

    /// Best-effort teardown of every backend.
    pub async fn stop_all(&self) -> Result<()> {
        let names: Vec<String> = {
            let loaded = self.loaded.read().await;
            loaded.keys().cloned().collect()
        };
        for name in names {
            if let Err(e) = self.stop(&name).await {
                tracing::warn!(model = %name, error = %e, "error stopping backend");
            }
        }
        Ok(())
    }

    /// Pick the least-recently-used evictable backend. Busy backends are
    /// skipped unless `force`; `exclude` protects the model being loaded.
    pub async fn lru_candidate(&self, force: bool, exclude: &str) -> Option<String> {
        let loaded = self.loaded.read().await;
        loaded
            .values()
            .filter(|b| !b.is_stopping() && b.model_name != exclude)
            .filter(|b| force || b.is_idle())
            .min_by_key(|b| b.last_used())
            .map(|b| b.model_name.clone())
    }

    /// Bracket an inference call: the backend counts as busy for the whole
    /// closure and its LRU stamp is refreshed on both edges.
    pub async fn with_call_busy<F, Fut, T>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce(Arc<LoadedBackend>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let backend = self
            .get(name)
            .await
            .ok_or_else(|| Error::NotFound(format!("model not loaded: {}", name)))?;
        let _guard = CallGuard::new(backend.clone());
        f(backend).await
    }

    /// Public form of the call bracket for callers that manage the RPC
    /// themselves.
    pub async fn begin_call(&self, name: &str) -> Result<CallGuard> {
        let backend = self
            .get(name)
            .await
            .ok_or_else(|| Error::NotFound(format!("model not loaded: {}", name)))?;
        Ok(CallGuard::new(backend))
    }

    async fn check_loaded(&self, name: &str) -> CheckResult {
        let record = {
            let loaded = self.loaded.read().await;
            loaded.get(name).cloned()
        };
        let record = match record {
            Some(r) => r,
            None => return CheckResult::Absent,
        };
        if record.is_stopping() {
            return CheckResult::Wait;
        }
        if !record.process_alive().await {
            tracing::warn!(model = %name, "backend process exited, dropping record");
            let mut loaded = self.loaded.write().await;
            if let Some(current) = loaded.get(name) {
                if Arc::ptr_eq(current, &record) {
                    loaded.remove(name);
                }
            }
            return CheckResult::Absent;
        }
        record.touch();
        CheckResult::Ready(record)
    }

    /// Make room for one more backend when a cap is configured. Waits up to
    /// `lru_eviction_max_retries × lru_eviction_retry_interval` for a busy
    /// backend to go idle when nothing is evictable.
    async fn ensure_capacity(&self, incoming: &str) -> Result<()> {
        let settings = self.settings();
        if settings.max_active_backends == 0 {
            return Ok(());
        }

        let mut waits = 0u32;
        loop {
            if self.count().await < settings.max_active_backends {
                return Ok(());
            }

            match self
                .lru_candidate(settings.force_eviction_when_busy, incoming)
                .await
            {
                Some(victim) => {
                    tracing::info!(
                        victim = %victim,
                        incoming = %incoming,
                        "evicting least-recently-used backend"
                    );
                    self.stop(&victim).await?;
                }
                None => {
                    waits += 1;
                    if waits > settings.lru_eviction_max_retries {
                        return Err(Error::Internal(format!(
                            "cannot load {}: all backends busy and eviction timed out",
                            incoming
                        )));
                    }
                    tracing::debug!(
                        incoming = %incoming,
                        "all backends busy, waiting for one to go idle"
                    );
                    tokio::time::sleep(settings.lru_eviction_retry_interval).await;
                }
            }
        }
    }
}

enum CheckResult {
    Ready(Arc<LoadedBackend>),
    Wait,
    Absent,
}

async fn reserve_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| Error::Internal(format!("failed to reserve port: {}", e)))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::Internal(format!("failed to read local addr: {}", e)))?
        .port();
    drop(listener);
    Ok(port)
}
