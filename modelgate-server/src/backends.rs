//! Installed-backend registry.
//!
//! Enumerates backends on disk (system directory first, then the user
//! directory, which wins on name clashes) and keeps the table of external
//! backends registered at runtime. A backend directory is any directory
//! containing a `metadata.yaml` manifest and its executable entry point.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;

use modelgate_common::gallery::BackendManifest;
use modelgate_common::usecase::Usecase;

use crate::error::{Error, Result};
use crate::system::SystemState;

/// Where a backend lives: a spawnable executable or an already-running
/// process at a loopback/remote address.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendLocation {
    Executable(PathBuf),
    External(String),
}

/// One resolvable backend.
#[derive(Debug, Clone)]
pub struct InstalledBackend {
    pub name: String,
    pub location: BackendLocation,
    pub capabilities: Usecase,
}

/// Registry over the backend directories plus runtime registrations.
pub struct BackendRegistry {
    system: Arc<SystemState>,
    /// Backends discovered on disk, rebuilt by `rescan`.
    installed: RwLock<HashMap<String, InstalledBackend>>,
    /// name -> address registrations that bypass process spawning.
    external: RwLock<HashMap<String, String>>,
}

impl BackendRegistry {
    pub fn new(system: Arc<SystemState>) -> Self {
        Self {
            system,
            installed: RwLock::new(HashMap::new()),
            external: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the on-disk table. System backends are scanned first so a
    /// user-installed backend of the same name shadows them.
    pub async fn rescan(&self) -> Result<()> {
        let mut found = HashMap::new();
        scan_dir(&self.system.system_backends_path, &mut found);
        scan_dir(&self.system.backends_path, &mut found);

        tracing::debug!(count = found.len(), "backend registry rescanned");
        *self.installed.write().await = found;
        Ok(())
    }

    /// Register an already-running backend by address.
    pub async fn register_external(&self, name: &str, address: &str) {
        tracing::info!(backend = %name, address = %address, "registering external backend");
        self.external
            .write()
            .await
            .insert(name.to_string(), address.to_string());
    }

    pub async fn remove_external(&self, name: &str) -> bool {
        self.external.write().await.remove(name).is_some()
    }

    /// Merge registrations from an `external_backends.json` map.
    pub async fn load_external_backends_file(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(path)?;
        let map: HashMap<String, String> =
            serde_json::from_str(&content).map_err(|e| Error::Parse(e.to_string()))?;
        let mut external = self.external.write().await;
        for (name, address) in map {
            external.insert(name, address);
        }
        Ok(())
    }

    /// Resolve a backend name. External registrations win over installed
    /// backends, matching how runtime overrides are expected to behave.
    pub async fn resolve(&self, name: &str) -> Result<InstalledBackend> {
        if let Some(address) = self.external.read().await.get(name) {
            return Ok(InstalledBackend {
                name: name.to_string(),
                location: BackendLocation::External(address.clone()),
                capabilities: Usecase::ANY,
            });
        }
        self.installed
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::BackendNotFound(name.to_string()))
    }

    /// First installed backend advertising the wanted capability, by
    /// ascending name for determinism. Used when a config leaves `backend`
    /// blank.
    pub async fn auto_pick(&self, wanted: Usecase) -> Option<InstalledBackend> {
        let installed = self.installed.read().await;
        let mut names: Vec<&String> = installed.keys().collect();
        names.sort();
        for name in names {
            let backend = &installed[name];
            if backend.capabilities.covers(wanted) {
                return Some(backend.clone());
            }
        }
        None
    }

    pub async fn list(&self) -> Vec<InstalledBackend> {
        let mut backends: Vec<InstalledBackend> =
            self.installed.read().await.values().cloned().collect();
        backends.sort_by(|a, b| a.name.cmp(&b.name));
        backends
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.resolve(name).await.is_ok()
    }
}

fn scan_dir(dir: &Path, found: &mut HashMap<String, InstalledBackend>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let manifest_path = path.join("metadata.yaml");
        let manifest: BackendManifest = match std::fs::read_to_string(&manifest_path)
            .ok()
            .and_then(|c| serde_yaml::from_str(&c).ok())
        {
            Some(m) => m,
            None => {
                tracing::debug!(dir = %path.display(), "no readable metadata.yaml, skipping");
                continue;
            }
        };

        let exe = path.join(&manifest.entrypoint);
        if !exe.exists() {
            tracing::warn!(
                backend = %manifest.name,
                entrypoint = %exe.display(),
                "backend manifest points at missing entry point"
            );
            continue;
        }

        let capabilities =
            Usecase::from_names(&manifest.capabilities).unwrap_or(Usecase::ANY);

        let dir_name = entry.file_name().to_string_lossy().into_owned();
        let name = if manifest.name.is_empty() {
            dir_name
        } else {
            manifest.name.clone()
        };

        let backend = InstalledBackend {
            name: name.clone(),
            location: BackendLocation::Executable(exe),
            capabilities,
        };
        if !manifest.alias.is_empty() && manifest.alias != name {
            found.insert(manifest.alias.clone(), backend.clone());
        }
        found.insert(name, backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_system(tmp: &TempDir) -> Arc<SystemState> {
        Arc::new(
            SystemState::new(
                tmp.path().join("models"),
                tmp.path().join("backends"),
                tmp.path().join("system-backends"),
                tmp.path().join("generated"),
            )
            .unwrap(),
        )
    }

    fn install_backend(base: &Path, name: &str, capabilities: &[&str]) {
        let dir = base.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let caps = capabilities
            .iter()
            .map(|c| format!("  - {}", c))
            .collect::<Vec<_>>()
            .join("\n");
        std::fs::write(
            dir.join("metadata.yaml"),
            format!("name: {}\nentrypoint: run\ncapabilities:\n{}\n", name, caps),
        )
        .unwrap();
        std::fs::write(dir.join("run"), "#!/bin/sh\n").unwrap();
    }

    #[tokio::test]
    async fn test_rescan_and_resolve() {
        let tmp = TempDir::new().unwrap();
        let system = test_system(&tmp);
        install_backend(&system.backends_path, "llama-cpp", &["chat", "completion"]);

        let registry = BackendRegistry::new(system.clone());
        registry.rescan().await.unwrap();

        let backend = registry.resolve("llama-cpp").await.unwrap();
        assert!(matches!(backend.location, BackendLocation::Executable(_)));
        assert!(backend.capabilities.covers(Usecase::CHAT));

        let err = registry.resolve("nonexistent").await.unwrap_err();
        assert!(matches!(err, Error::BackendNotFound(_)));
    }

    #[tokio::test]
    async fn test_user_backend_shadows_system() {
        let tmp = TempDir::new().unwrap();
        let system = test_system(&tmp);
        std::fs::create_dir_all(&system.system_backends_path).unwrap();
        install_backend(&system.system_backends_path, "whisper", &["transcript"]);
        install_backend(&system.backends_path, "whisper", &["transcript", "vad"]);

        let registry = BackendRegistry::new(system.clone());
        registry.rescan().await.unwrap();

        let backend = registry.resolve("whisper").await.unwrap();
        assert!(backend.capabilities.covers(Usecase::VAD));
    }

    #[tokio::test]
    async fn test_missing_entrypoint_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let system = test_system(&tmp);
        let dir = system.backends_path.join("broken");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("metadata.yaml"), "name: broken\n").unwrap();

        let registry = BackendRegistry::new(system.clone());
        registry.rescan().await.unwrap();
        assert!(!registry.exists("broken").await);
    }

    #[tokio::test]
    async fn test_external_registration_wins() {
        let tmp = TempDir::new().unwrap();
        let system = test_system(&tmp);
        install_backend(&system.backends_path, "llama-cpp", &["chat"]);

        let registry = BackendRegistry::new(system.clone());
        registry.rescan().await.unwrap();
        registry
            .register_external("llama-cpp", "127.0.0.1:9999")
            .await;

        let backend = registry.resolve("llama-cpp").await.unwrap();
        assert_eq!(
            backend.location,
            BackendLocation::External("127.0.0.1:9999".to_string())
        );

        assert!(registry.remove_external("llama-cpp").await);
        let backend = registry.resolve("llama-cpp").await.unwrap();
        assert!(matches!(backend.location, BackendLocation::Executable(_)));
    }

    #[tokio::test]
    async fn test_auto_pick_by_capability() {
        let tmp = TempDir::new().unwrap();
        let system = test_system(&tmp);
        install_backend(&system.backends_path, "piper", &["tts"]);
        install_backend(&system.backends_path, "llama-cpp", &["chat", "completion"]);

        let registry = BackendRegistry::new(system.clone());
        registry.rescan().await.unwrap();

        let tts = registry.auto_pick(Usecase::TTS).await.unwrap();
        assert_eq!(tts.name, "piper");

        let chat = registry.auto_pick(Usecase::CHAT).await.unwrap();
        assert_eq!(chat.name, "llama-cpp");

        assert!(registry.auto_pick(Usecase::IMAGE).await.is_none());
    }

    #[tokio::test]
    async fn test_load_external_backends_file() {
        let tmp = TempDir::new().unwrap();
        let system = test_system(&tmp);
        let registry = BackendRegistry::new(system.clone());

        let file = tmp.path().join("external_backends.json");
        std::fs::write(&file, r#"{"custom": "127.0.0.1:5005"}"#).unwrap();
        registry.load_external_backends_file(&file).await.unwrap();

        let backend = registry.resolve("custom").await.unwrap();
        assert_eq!(
            backend.location,
            BackendLocation::External("127.0.0.1:5005".to_string())
        );
    }
}
