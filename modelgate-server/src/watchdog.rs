//! Watchdog: periodic policy enforcement over loaded backends.
//!
//! One tick loop drives three policies: busy timeout (hung generation),
//! idle timeout (reclaim RAM/VRAM of unused backends) and memory-pressure
//! reclaim. The fourth policy, the active-backend LRU cap, runs on the
//! loader's load path, not here. The watchdog never touches the loader's
//! map directly; everything goes through `ModelLoader::stop`.

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::loader::ModelLoader;

#[derive(Debug, Clone)]
pub struct WatchdogSettings {
    pub busy_check: bool,
    pub idle_check: bool,
    pub busy_timeout: Duration,
    pub idle_timeout: Duration,
    pub interval: Duration,
    pub memory_reclaimer_enabled: bool,
    /// Utilization ratio in (0, 1] that triggers reclaim.
    pub memory_reclaimer_threshold: f64,
    pub force_eviction_when_busy: bool,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            busy_check: false,
            idle_check: false,
            busy_timeout: Duration::from_secs(5 * 60),
            idle_timeout: Duration::from_secs(15 * 60),
            interval: Duration::from_secs(2),
            memory_reclaimer_enabled: false,
            memory_reclaimer_threshold: 0.95,
            force_eviction_when_busy: false,
        }
    }
}

/// Returns current memory utilization in [0, 1], or `None` when no
/// measurement is available.
pub type MemoryProbe = Arc<dyn Fn() -> Option<f64> + Send + Sync>;

pub struct Watchdog {
    loader: Arc<ModelLoader>,
    settings: WatchdogSettings,
    memory_probe: MemoryProbe,
}

/// Controls one running watchdog task. Dropping the handle leaves the task
/// running; `stop` shuts it down and waits a bounded grace period for the
/// tick in flight.
pub struct WatchdogHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WatchdogHandle {
    pub async fn stop(self, grace: Duration) {
        let _ = self.stop_tx.send(true);
        if tokio::time::timeout(grace, self.join).await.is_err() {
            tracing::warn!("watchdog did not stop within grace period");
        }
    }
}

impl Watchdog {
    pub fn new(loader: Arc<ModelLoader>, settings: WatchdogSettings) -> Self {
        Self {
            loader,
            settings,
            memory_probe: Arc::new(system_memory_utilization),
        }
    }

    /// Replace the memory measurement source.
    pub fn with_memory_probe(mut self, probe: MemoryProbe) -> Self {
        self.memory_probe = probe;
        self
    }

    pub fn settings(&self) -> &WatchdogSettings {
        &self.settings
    }

    /// Start the tick loop. It exits when either the returned handle's stop
    /// channel fires or the application-wide shutdown signal flips.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> WatchdogHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            tracing::info!(
                interval_ms = self.settings.interval.as_millis() as u64,
                busy_check = self.settings.busy_check,
                idle_check = self.settings.idle_check,
                memory_reclaimer = self.settings.memory_reclaimer_enabled,
                "watchdog started"
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.interval) => {
                        self.tick().await;
                    }
                    _ = stop_rx.changed() => {
                        tracing::info!("watchdog stop signal received");
                        return;
                    }
                    _ = shutdown.changed() => {
                        tracing::info!("application shutdown, stopping watchdog");
                        return;
                    }
                }
            }
        });
        WatchdogHandle { stop_tx, join }
    }

    async fn tick(&self) {
        if self.settings.busy_check {
            self.check_busy().await;
        }
        if self.settings.idle_check {
            self.check_idle().await;
        }
        if self.settings.memory_reclaimer_enabled {
            self.check_memory().await;
        }
    }

    /// Kill backends that have been busy past the timeout: a generation
    /// that never returns would otherwise pin the process forever.
    async fn check_busy(&self) {
        let now = std::time::Instant::now();
        for backend in self.loader.list().await {
            if backend.busy_count > 0
                && now.duration_since(backend.last_used) >= self.settings.busy_timeout
            {
                tracing::warn!(
                    model = %backend.model_name,
                    busy_for_ms = now.duration_since(backend.last_used).as_millis() as u64,
                    "backend busy for too long, killing it"
                );
                if let Err(e) = self.loader.stop(&backend.model_name).await {
                    tracing::error!(model = %backend.model_name, error = %e, "busy eviction failed");
                }
            }
        }
    }

    async fn check_idle(&self) {
        let now = std::time::Instant::now();
        for backend in self.loader.list().await {
            if backend.busy_count == 0
                && now.duration_since(backend.last_used) >= self.settings.idle_timeout
            {
                tracing::info!(
                    model = %backend.model_name,
                    idle_for_ms = now.duration_since(backend.last_used).as_millis() as u64,
                    "backend idle for too long, shutting it down"
                );
                if let Err(e) = self.loader.stop(&backend.model_name).await {
                    tracing::error!(model = %backend.model_name, error = %e, "idle eviction failed");
                }
            }
        }
    }

    /// Evict the LRU idle backend while measured utilization sits above the
    /// threshold. One eviction per tick; the next tick re-measures.
    async fn check_memory(&self) {
        let threshold = self.settings.memory_reclaimer_threshold;
        if threshold <= 0.0 || self.loader.count().await == 0 {
            return;
        }

        let utilization = match (self.memory_probe)() {
            Some(u) => u,
            None => {
                tracing::debug!("no memory information available for reclaimer");
                return;
            }
        };

        tracing::debug!(
            utilization = format!("{:.2}", utilization),
            threshold = format!("{:.2}", threshold),
            "memory check"
        );

        if utilization < threshold {
            return;
        }

        match self
            .loader
            .lru_candidate(self.settings.force_eviction_when_busy, "")
            .await
        {
            Some(victim) => {
                tracing::warn!(
                    model = %victim,
                    utilization = format!("{:.2}", utilization),
                    "memory usage above threshold, evicting LRU backend"
                );
                if let Err(e) = self.loader.stop(&victim).await {
                    tracing::error!(model = %victim, error = %e, "memory reclaim eviction failed");
                }
            }
            None => {
                tracing::warn!("memory reclaimer cannot evict: all backends busy");
            }
        }
    }
}

/// GPU utilization via nvidia-smi when present, system RAM otherwise.
fn system_memory_utilization() -> Option<f64> {
    if let Some(gpu) = nvidia_memory_utilization() {
        return Some(gpu);
    }
    proc_meminfo_utilization()
}

fn nvidia_memory_utilization() -> Option<f64> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=memory.used,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let (mut used, mut total) = (0u64, 0u64);
    for line in text.lines() {
        let mut parts = line.split(',').map(|p| p.trim().parse::<u64>());
        if let (Some(Ok(u)), Some(Ok(t))) = (parts.next(), parts.next()) {
            used += u;
            total += t;
        }
    }
    if total == 0 {
        return None;
    }
    Some(used as f64 / total as f64)
}

fn proc_meminfo_utilization() -> Option<f64> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total = None;
    let mut available = None;
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        match parts.next()? {
            "MemTotal:" => total = parts.next()?.parse::<u64>().ok(),
            "MemAvailable:" => available = parts.next()?.parse::<u64>().ok(),
            _ => {}
        }
    }
    let (total, available) = (total?, available?);
    if total == 0 {
        return None;
    }
    Some((total - available) as f64 / total as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BackendRegistry;
    use crate::loader::{LoadSpec, LoaderSettings};
    use crate::test_util::{mock_backend, test_system, MockBackend};
    use modelgate_common::{ModelOptions, Usecase};

    fn spec_for(name: &str) -> LoadSpec {
        LoadSpec {
            model_name: name.to_string(),
            backend_name: "mock".to_string(),
            usecase: Usecase::CHAT,
            options: ModelOptions::default(),
            probe_attempts: 5,
            probe_sleep: Duration::from_millis(20),
        }
    }

    async fn loader_with_mock(
        settings: LoaderSettings,
    ) -> (tempfile::TempDir, MockBackend, Arc<ModelLoader>) {
        let (tmp, system) = test_system();
        let registry = Arc::new(BackendRegistry::new(system.clone()));
        let backend = mock_backend().await;
        registry.register_external("mock", backend.address()).await;
        let loader = Arc::new(ModelLoader::new(registry, settings));
        (tmp, backend, loader)
    }

    fn start_watchdog(
        loader: Arc<ModelLoader>,
        settings: WatchdogSettings,
    ) -> (watch::Sender<bool>, WatchdogHandle) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let wd = Arc::new(Watchdog::new(loader, settings));
        let handle = wd.spawn(shutdown_rx);
        (shutdown_tx, handle)
    }

    #[tokio::test]
    async fn test_idle_backend_is_evicted() {
        let (_tmp, backend, loader) = loader_with_mock(LoaderSettings::default()).await;
        loader.load(spec_for("m")).await.unwrap();

        let (_shutdown, handle) = start_watchdog(
            loader.clone(),
            WatchdogSettings {
                idle_check: true,
                idle_timeout: Duration::from_millis(100),
                interval: Duration::from_millis(20),
                ..Default::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(loader.count().await, 0);
        assert_eq!(backend.shutdown_calls().await, 1);

        handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_busy_call_preempts_idle_timeout() {
        let (_tmp, _backend, loader) = loader_with_mock(LoaderSettings::default()).await;
        loader.load(spec_for("m")).await.unwrap();

        let (_shutdown, handle) = start_watchdog(
            loader.clone(),
            WatchdogSettings {
                idle_check: true,
                idle_timeout: Duration::from_millis(100),
                interval: Duration::from_millis(20),
                ..Default::default()
            },
        );

        // Hold a call open well past the idle timeout.
        let loader2 = loader.clone();
        let call = tokio::spawn(async move {
            loader2
                .with_call_busy("m", |_b| async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok::<_, crate::error::Error>(())
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(loader.count().await, 1, "busy backend must not be evicted");

        call.await.unwrap().unwrap();
        // After the call returns the idle clock restarts.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(loader.count().await, 0);

        handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_busy_timeout_kills_hung_backend() {
        let (_tmp, _backend, loader) = loader_with_mock(LoaderSettings::default()).await;
        loader.load(spec_for("m")).await.unwrap();

        let (_shutdown, handle) = start_watchdog(
            loader.clone(),
            WatchdogSettings {
                busy_check: true,
                busy_timeout: Duration::from_millis(100),
                interval: Duration::from_millis(20),
                ..Default::default()
            },
        );

        // Simulate a hung generation: the guard keeps busy_count at 1 and
        // nothing refreshes last_used.
        let guard = loader.begin_call("m").await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(loader.count().await, 0, "hung backend must be killed");

        drop(guard);
        handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_lru_cap_evicts_oldest() {
        let (_tmp, _backend, loader) = loader_with_mock(LoaderSettings {
            max_active_backends: 2,
            ..Default::default()
        })
        .await;

        loader.load(spec_for("m1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        loader.load(spec_for("m2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        loader.load(spec_for("m3")).await.unwrap();

        let names: Vec<String> = loader
            .list()
            .await
            .into_iter()
            .map(|s| s.model_name)
            .collect();
        assert_eq!(names, vec!["m2", "m3"]);
    }

    #[tokio::test]
    async fn test_memory_reclaimer_evicts_lru_idle() {
        let (_tmp, _backend, loader) = loader_with_mock(LoaderSettings::default()).await;
        loader.load(spec_for("m1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        loader.load(spec_for("m2")).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let wd = Arc::new(
            Watchdog::new(
                loader.clone(),
                WatchdogSettings {
                    memory_reclaimer_enabled: true,
                    memory_reclaimer_threshold: 0.9,
                    interval: Duration::from_millis(20),
                    ..Default::default()
                },
            )
            .with_memory_probe(Arc::new(|| Some(0.97))),
        );
        let handle = wd.spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(200)).await;
        // Pressure never drops in this test, so both end up evicted,
        // oldest first.
        assert_eq!(loader.count().await, 0);

        handle.stop(Duration::from_secs(1)).await;
        drop(shutdown_tx);
    }

    #[tokio::test]
    async fn test_memory_reclaimer_skips_when_below_threshold() {
        let (_tmp, _backend, loader) = loader_with_mock(LoaderSettings::default()).await;
        loader.load(spec_for("m1")).await.unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let wd = Arc::new(
            Watchdog::new(
                loader.clone(),
                WatchdogSettings {
                    memory_reclaimer_enabled: true,
                    memory_reclaimer_threshold: 0.9,
                    interval: Duration::from_millis(20),
                    ..Default::default()
                },
            )
            .with_memory_probe(Arc::new(|| Some(0.5))),
        );
        let handle = wd.spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(loader.count().await, 1);

        handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_app_shutdown_stops_watchdog() {
        let (_tmp, _backend, loader) = loader_with_mock(LoaderSettings::default()).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let wd = Arc::new(Watchdog::new(
            loader,
            WatchdogSettings {
                idle_check: true,
                interval: Duration::from_millis(20),
                ..Default::default()
            },
        ));
        let handle = wd.spawn(shutdown_rx);

        shutdown_tx.send(true).unwrap();
        // The loop must exit promptly on its own.
        tokio::time::timeout(Duration::from_secs(1), handle.join)
            .await
            .expect("watchdog did not exit on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn test_restart_applies_new_settings_to_loaded_backends() {
        let (_tmp, _backend, loader) = loader_with_mock(LoaderSettings::default()).await;
        loader.load(spec_for("m")).await.unwrap();

        // First watchdog: generous timeout, nothing evicted.
        let (_s1, h1) = start_watchdog(
            loader.clone(),
            WatchdogSettings {
                idle_check: true,
                idle_timeout: Duration::from_secs(3600),
                interval: Duration::from_millis(20),
                ..Default::default()
            },
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(loader.count().await, 1);
        h1.stop(Duration::from_secs(1)).await;

        // Restarted with a tight timeout: the still-loaded backend is
        // evicted under the new policy.
        let (_s2, h2) = start_watchdog(
            loader.clone(),
            WatchdogSettings {
                idle_check: true,
                idle_timeout: Duration::from_millis(50),
                interval: Duration::from_millis(20),
                ..Default::default()
            },
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(loader.count().await, 0);
        h2.stop(Duration::from_secs(1)).await;
    }
}
