//! Gateway configuration.
//!
//! Layered sources (environment over file over defaults) deserialize into
//! one typed `Config`. The runtime-tunable subset round-trips through
//! `RuntimeSettings`, the JSON shape served by the settings surface and
//! persisted as `runtime_settings.json` in the configs directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use modelgate_common::gallery::GallerySource;

use crate::loader::LoaderSettings;
use crate::model_config::LoadDefaults;
use crate::watchdog::WatchdogSettings;

/// Serde adapter for humantime duration strings ("15m", "2s", "500ms").
mod duration_str {
    use super::*;
    use serde::de::Error as _;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(d)?;
        humantime::parse_duration(&text).map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ApiConfig {
    /// Loopback address embedded LLM clients (the agent executor) talk to.
    pub fn local_address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_models_path")]
    pub models: PathBuf,
    #[serde(default = "default_backends_path")]
    pub backends: PathBuf,
    #[serde(default = "default_system_backends_path")]
    pub system_backends: PathBuf,
    #[serde(default = "default_generated_content_path")]
    pub generated_content: PathBuf,
    /// Directory for dynamic state files (agent store, runtime settings,
    /// external backend registrations).
    #[serde(default = "default_configs_path")]
    pub configs: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models: default_models_path(),
            backends: default_backends_path(),
            system_backends: default_system_backends_path(),
            generated_content: default_generated_content_path(),
            configs: default_configs_path(),
        }
    }
}

/// Gateway-level model defaults, inherited by configs that leave the
/// matching field unset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default)]
    pub threads: i32,
    #[serde(default)]
    pub context_size: i32,
    #[serde(default)]
    pub f16: bool,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub idle_enabled: bool,
    #[serde(default)]
    pub busy_enabled: bool,
    #[serde(with = "duration_str", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_str", default = "default_busy_timeout")]
    pub busy_timeout: Duration,
    #[serde(with = "duration_str", default = "default_watchdog_interval")]
    pub interval: Duration,
}

impl Default for WatchdogPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            idle_enabled: false,
            busy_enabled: false,
            idle_timeout: default_idle_timeout(),
            busy_timeout: default_busy_timeout(),
            interval: default_watchdog_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendPolicy {
    /// Deprecated alias for `max_active_backends = 1`; the two are kept in
    /// sync in both directions.
    #[serde(default)]
    pub single_backend: bool,
    /// 0 = unlimited.
    #[serde(default)]
    pub max_active_backends: usize,
    #[serde(default)]
    pub parallel_requests: bool,
    #[serde(default)]
    pub force_eviction_when_busy: bool,
    #[serde(default = "default_lru_retries")]
    pub lru_eviction_max_retries: u32,
    #[serde(with = "duration_str", default = "default_lru_retry_interval")]
    pub lru_eviction_retry_interval: Duration,
    #[serde(default)]
    pub memory_reclaimer_enabled: bool,
    #[serde(default = "default_memory_threshold")]
    pub memory_reclaimer_threshold: f64,
}

impl Default for BackendPolicy {
    fn default() -> Self {
        Self {
            single_backend: false,
            max_active_backends: 0,
            parallel_requests: false,
            force_eviction_when_busy: false,
            lru_eviction_max_retries: default_lru_retries(),
            lru_eviction_retry_interval: default_lru_retry_interval(),
            memory_reclaimer_enabled: false,
            memory_reclaimer_threshold: default_memory_threshold(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GalleriesConfig {
    #[serde(default)]
    pub sources: Vec<GallerySource>,
    #[serde(default)]
    pub backend_sources: Vec<GallerySource>,
    #[serde(default)]
    pub autoload_backend_galleries: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentPolicy {
    #[serde(default = "default_retention_days")]
    pub job_retention_days: u32,
}

impl Default for AgentPolicy {
    fn default() -> Self {
        Self {
            job_retention_days: default_retention_days(),
        }
    }
}

/// Main gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub watchdog: WatchdogPolicy,
    #[serde(default)]
    pub backends: BackendPolicy,
    #[serde(default)]
    pub galleries: GalleriesConfig,
    #[serde(default)]
    pub agent: AgentPolicy,
    #[serde(default)]
    pub api_keys: Vec<String>,
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_models_path() -> PathBuf {
    PathBuf::from("models")
}
fn default_backends_path() -> PathBuf {
    PathBuf::from("backends")
}
fn default_system_backends_path() -> PathBuf {
    PathBuf::from("/usr/share/modelgate/backends")
}
fn default_generated_content_path() -> PathBuf {
    PathBuf::from("generated")
}
fn default_configs_path() -> PathBuf {
    PathBuf::from("configuration")
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}
fn default_busy_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_watchdog_interval() -> Duration {
    Duration::from_secs(2)
}
fn default_lru_retries() -> u32 {
    30
}
fn default_lru_retry_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_memory_threshold() -> f64 {
    0.95
}
fn default_retention_days() -> u32 {
    30
}

impl Config {
    /// Load configuration from `modelgate.toml` (optional) overridden by
    /// `MODELGATE__SECTION__KEY` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("api.host", default_host())?
            .set_default("api.port", default_port() as i64)?
            .add_source(File::with_name("modelgate").required(false))
            .add_source(
                Environment::with_prefix("MODELGATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        config.try_deserialize()
    }

    /// Max-active-backends with the deprecated single-backend flag folded
    /// in.
    pub fn effective_max_active_backends(&self) -> usize {
        if self.backends.single_backend {
            1
        } else {
            self.backends.max_active_backends
        }
    }

    /// Whether any watchdog policy needs the tick loop running.
    pub fn watchdog_needed(&self) -> bool {
        self.watchdog.enabled
            || self.watchdog.idle_enabled
            || self.watchdog.busy_enabled
            || self.backends.memory_reclaimer_enabled
    }

    pub fn load_defaults(&self) -> LoadDefaults {
        LoadDefaults {
            context_size: self.defaults.context_size,
            threads: self.defaults.threads,
            f16: self.defaults.f16,
            debug: self.defaults.debug,
        }
    }

    pub fn loader_settings(&self) -> LoaderSettings {
        LoaderSettings {
            max_active_backends: self.effective_max_active_backends(),
            force_eviction_when_busy: self.backends.force_eviction_when_busy,
            lru_eviction_max_retries: self.backends.lru_eviction_max_retries,
            lru_eviction_retry_interval: self.backends.lru_eviction_retry_interval,
            shutdown_grace: Duration::from_secs(5),
            log_backend_output: self.defaults.debug,
        }
    }

    pub fn watchdog_settings(&self) -> WatchdogSettings {
        WatchdogSettings {
            busy_check: self.watchdog.busy_enabled,
            idle_check: self.watchdog.idle_enabled,
            busy_timeout: self.watchdog.busy_timeout,
            idle_timeout: self.watchdog.idle_timeout,
            interval: self.watchdog.interval,
            memory_reclaimer_enabled: self.backends.memory_reclaimer_enabled,
            memory_reclaimer_threshold: self.backends.memory_reclaimer_threshold,
            force_eviction_when_busy: self.backends.force_eviction_when_busy,
        }
    }

    /// Snapshot of the runtime-tunable subset.
    pub fn to_runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            watchdog_enabled: Some(self.watchdog.enabled),
            watchdog_idle_enabled: Some(self.watchdog.idle_enabled),
            watchdog_busy_enabled: Some(self.watchdog.busy_enabled),
            watchdog_idle_timeout: Some(format_duration(self.watchdog.idle_timeout)),
            watchdog_busy_timeout: Some(format_duration(self.watchdog.busy_timeout)),
            watchdog_interval: Some(format_duration(self.watchdog.interval)),
            single_backend: Some(self.backends.single_backend),
            max_active_backends: Some(self.backends.max_active_backends),
            parallel_backend_requests: Some(self.backends.parallel_requests),
            memory_reclaimer_enabled: Some(self.backends.memory_reclaimer_enabled),
            memory_reclaimer_threshold: Some(self.backends.memory_reclaimer_threshold),
            force_eviction_when_busy: Some(self.backends.force_eviction_when_busy),
            lru_eviction_max_retries: Some(self.backends.lru_eviction_max_retries),
            lru_eviction_retry_interval: Some(format_duration(
                self.backends.lru_eviction_retry_interval,
            )),
            threads: Some(self.defaults.threads),
            context_size: Some(self.defaults.context_size),
            f16: Some(self.defaults.f16),
            debug: Some(self.defaults.debug),
            galleries: Some(self.galleries.sources.clone()),
            backend_galleries: Some(self.galleries.backend_sources.clone()),
            autoload_backend_galleries: Some(self.galleries.autoload_backend_galleries),
            api_keys: Some(self.api_keys.clone()),
            agent_job_retention_days: Some(self.agent.job_retention_days),
        }
    }

    /// Apply a runtime-settings delta. Absent fields are left untouched;
    /// invalid durations and out-of-range thresholds are logged and
    /// ignored. Returns true when a watchdog-affecting field changed and a
    /// restart is required.
    pub fn apply_runtime_settings(&mut self, settings: &RuntimeSettings) -> bool {
        let mut watchdog_changed = false;

        if let Some(v) = settings.watchdog_enabled {
            watchdog_changed |= self.watchdog.enabled != v;
            self.watchdog.enabled = v;
        }
        if let Some(v) = settings.watchdog_idle_enabled {
            watchdog_changed |= self.watchdog.idle_enabled != v;
            self.watchdog.idle_enabled = v;
            if v {
                self.watchdog.enabled = true;
            }
        }
        if let Some(v) = settings.watchdog_busy_enabled {
            watchdog_changed |= self.watchdog.busy_enabled != v;
            self.watchdog.busy_enabled = v;
            if v {
                self.watchdog.enabled = true;
            }
        }
        if let Some(text) = &settings.watchdog_idle_timeout {
            match humantime::parse_duration(text) {
                Ok(d) => {
                    watchdog_changed |= self.watchdog.idle_timeout != d;
                    self.watchdog.idle_timeout = d;
                }
                Err(e) => {
                    tracing::warn!(value = %text, error = %e, "invalid watchdog idle timeout, keeping current");
                }
            }
        }
        if let Some(text) = &settings.watchdog_busy_timeout {
            match humantime::parse_duration(text) {
                Ok(d) => {
                    watchdog_changed |= self.watchdog.busy_timeout != d;
                    self.watchdog.busy_timeout = d;
                }
                Err(e) => {
                    tracing::warn!(value = %text, error = %e, "invalid watchdog busy timeout, keeping current");
                }
            }
        }
        if let Some(text) = &settings.watchdog_interval {
            match humantime::parse_duration(text) {
                Ok(d) => {
                    watchdog_changed |= self.watchdog.interval != d;
                    self.watchdog.interval = d;
                }
                Err(e) => {
                    tracing::warn!(value = %text, error = %e, "invalid watchdog interval, keeping current");
                }
            }
        }

        // max_active_backends wins over the deprecated flag when both are
        // present; either one keeps the other in sync.
        if let Some(n) = settings.max_active_backends {
            watchdog_changed |= self.backends.max_active_backends != n;
            self.backends.max_active_backends = n;
            self.backends.single_backend = n == 1;
        } else if let Some(single) = settings.single_backend {
            watchdog_changed |= self.backends.single_backend != single;
            self.backends.single_backend = single;
            self.backends.max_active_backends = if single { 1 } else { 0 };
        }

        if let Some(v) = settings.parallel_backend_requests {
            self.backends.parallel_requests = v;
        }
        if let Some(v) = settings.memory_reclaimer_enabled {
            watchdog_changed |= self.backends.memory_reclaimer_enabled != v;
            self.backends.memory_reclaimer_enabled = v;
            if v {
                self.watchdog.enabled = true;
            }
        }
        if let Some(threshold) = settings.memory_reclaimer_threshold {
            if threshold > 0.0 && threshold <= 1.0 {
                watchdog_changed |=
                    (self.backends.memory_reclaimer_threshold - threshold).abs() > f64::EPSILON;
                self.backends.memory_reclaimer_threshold = threshold;
            } else {
                tracing::warn!(
                    threshold,
                    "memory reclaimer threshold outside (0, 1], keeping current"
                );
            }
        }
        if let Some(v) = settings.force_eviction_when_busy {
            watchdog_changed |= self.backends.force_eviction_when_busy != v;
            self.backends.force_eviction_when_busy = v;
        }
        if let Some(v) = settings.lru_eviction_max_retries {
            self.backends.lru_eviction_max_retries = v;
        }
        if let Some(text) = &settings.lru_eviction_retry_interval {
            match humantime::parse_duration(text) {
                Ok(d) => self.backends.lru_eviction_retry_interval = d,
                Err(e) => {
                    tracing::warn!(value = %text, error = %e, "invalid LRU retry interval, keeping current");
                }
            }
        }

        if let Some(v) = settings.threads {
            self.defaults.threads = v;
        }
        if let Some(v) = settings.context_size {
            self.defaults.context_size = v;
        }
        if let Some(v) = settings.f16 {
            self.defaults.f16 = v;
        }
        if let Some(v) = settings.debug {
            self.defaults.debug = v;
        }
        if let Some(v) = &settings.galleries {
            self.galleries.sources = v.clone();
        }
        if let Some(v) = &settings.backend_galleries {
            self.galleries.backend_sources = v.clone();
        }
        if let Some(v) = settings.autoload_backend_galleries {
            self.galleries.autoload_backend_galleries = v;
        }
        if let Some(v) = &settings.api_keys {
            self.api_keys = v.clone();
        }
        if let Some(v) = settings.agent_job_retention_days {
            self.agent.job_retention_days = v;
        }

        watchdog_changed
    }

    /// Load `runtime_settings.json` from the configs dir, if present, and
    /// fold it into this config.
    pub fn apply_runtime_settings_file(&mut self, configs_dir: &Path) {
        let path = configs_dir.join("runtime_settings.json");
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return,
        };
        match serde_json::from_str::<RuntimeSettings>(&content) {
            Ok(settings) => {
                self.apply_runtime_settings(&settings);
                tracing::info!(path = %path.display(), "applied runtime settings file");
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring malformed runtime settings file");
            }
        }
    }

    pub fn save_runtime_settings_file(&self, configs_dir: &Path) -> std::io::Result<()> {
        let path = configs_dir.join("runtime_settings.json");
        let content = serde_json::to_string_pretty(&self.to_runtime_settings())
            .expect("runtime settings always serialize");
        std::fs::write(path, content)
    }
}

fn format_duration(d: Duration) -> String {
    humantime::format_duration(d).to_string()
}

/// Runtime-tunable settings, every field tri-state so a partial update
/// touches only what it names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watchdog_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watchdog_idle_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watchdog_busy_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watchdog_idle_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watchdog_busy_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watchdog_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub single_backend: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_active_backends: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_backend_requests: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_reclaimer_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_reclaimer_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_eviction_when_busy: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lru_eviction_max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lru_eviction_retry_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_size: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub f16: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub galleries: Option<Vec<GallerySource>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_galleries: Option<Vec<GallerySource>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autoload_backend_galleries: Option<bool>,
    /// No skip: an explicit empty array clears configured keys.
    pub api_keys: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_job_retention_days: Option<u32>,
}
