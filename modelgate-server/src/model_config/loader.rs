//! Model configuration registry.
//!
//! Parses, validates, caches and reloads `ModelConfig` entries from the
//! models directory. All readers get value copies; the map itself is only
//! touched under the lock and never across I/O.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::gguf::guess_defaults_from_file;
use super::ModelConfig;
use crate::downloader;
use crate::error::{Error, Result};
use crate::system::SystemState;

/// Gateway-level defaults applied to every config that leaves the
/// corresponding field unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadDefaults {
    pub context_size: i32,
    pub threads: i32,
    pub f16: bool,
    pub debug: bool,
}

pub type ModelConfigFilterFn = fn(&ModelConfig) -> bool;

/// In-memory registry of model configurations keyed by name.
pub struct ModelConfigLoader {
    system: Arc<SystemState>,
    configs: RwLock<HashMap<String, ModelConfig>>,
    /// name -> file the entry was read from, for reload-time pruning.
    sources: RwLock<HashMap<String, std::path::PathBuf>>,
    http_client: reqwest::Client,
}

impl ModelConfigLoader {
    pub fn new(system: Arc<SystemState>) -> Self {
        Self {
            system,
            configs: RwLock::new(HashMap::new()),
            sources: RwLock::new(HashMap::new()),
            http_client: reqwest::Client::new(),
        }
    }

    /// Run the full pipeline on a parsed config: defaults, guesser,
    /// validation, usecase normalization.
    fn complete(&self, cfg: &mut ModelConfig, defaults: &LoadDefaults) -> Result<()> {
        cfg.set_defaults(defaults);

        let model_file = cfg.model_file_name();
        if !model_file.is_empty() && !cfg.is_model_url() {
            let model_path = self.system.models_path.join(&model_file);
            guess_defaults_from_file(
                cfg,
                &model_path,
                self.system.has_gpu(),
                self.system.total_vram_bytes,
            );
        }

        cfg.validate()?;
        if cfg.name.is_empty() {
            return Err(Error::InvalidConfig(
                "model config has no name".to_string(),
            ));
        }
        cfg.sync_known_usecases();
        Ok(())
    }

    /// Parse a single-config file and insert or replace the entry.
    pub async fn read_one(&self, path: &Path, defaults: &LoadDefaults) -> Result<ModelConfig> {
        let content = std::fs::read_to_string(path)?;
        let mut cfg: ModelConfig =
            serde_yaml::from_str(&content).map_err(|e| Error::Parse(e.to_string()))?;
        self.complete(&mut cfg, defaults)?;

        {
            let mut configs = self.configs.write().await;
            configs.insert(cfg.name.clone(), cfg.clone());
        }
        self.sources
            .write()
            .await
            .insert(cfg.name.clone(), path.to_path_buf());
        Ok(cfg)
    }

    /// Parse a file holding a sequence of configs, applying the same
    /// pipeline to each.
    pub async fn read_multi(&self, path: &Path, defaults: &LoadDefaults) -> Result<Vec<ModelConfig>> {
        let content = std::fs::read_to_string(path)?;
        let mut parsed: Vec<ModelConfig> =
            serde_yaml::from_str(&content).map_err(|e| Error::Parse(e.to_string()))?;

        for cfg in &mut parsed {
            self.complete(cfg, defaults)?;
        }

        {
            let mut configs = self.configs.write().await;
            for cfg in &parsed {
                configs.insert(cfg.name.clone(), cfg.clone());
            }
        }
        let mut sources = self.sources.write().await;
        for cfg in &parsed {
            sources.insert(cfg.name.clone(), path.to_path_buf());
        }
        Ok(parsed)
    }

    /// Non-recursive directory scan. Files ending in `.yaml`/`.yml` whose
    /// names do not start with a dot are read; per-file failures are logged
    /// and skipped so one bad file never aborts the scan.
    pub async fn load_from_directory(&self, dir: &Path, defaults: &LoadDefaults) -> Result<()> {
        let entries = std::fs::read_dir(dir)?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if name.starts_with('.') {
                continue;
            }
            if !name.ends_with(".yaml") && !name.ends_with(".yml") {
                continue;
            }
            if let Err(e) = self.read_one(&path, defaults).await {
                tracing::warn!(file = %path.display(), error = %e, "skipping model config");
            }
        }

        // Entries whose backing file under this directory is gone get
        // dropped; parse failures above keep their previous entry.
        let stale: Vec<String> = {
            let sources = self.sources.read().await;
            sources
                .iter()
                .filter(|(_, src)| src.parent() == Some(dir) && !src.exists())
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in stale {
            tracing::info!(model = %name, "config file removed, dropping entry");
            self.remove(&name).await;
        }
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<ModelConfig> {
        self.configs.read().await.get(name).cloned()
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.configs.read().await.contains_key(name)
    }

    /// All configs, sorted ascending by name. The copy happens under the
    /// lock, the sort outside of it.
    pub async fn all(&self) -> Vec<ModelConfig> {
        let mut configs: Vec<ModelConfig> =
            self.configs.read().await.values().cloned().collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    pub async fn filter(&self, f: ModelConfigFilterFn) -> Vec<ModelConfig> {
        let mut configs: Vec<ModelConfig> = self
            .configs
            .read()
            .await
            .values()
            .filter(|c| f(c))
            .cloned()
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    pub async fn remove(&self, name: &str) -> Option<ModelConfig> {
        self.sources.write().await.remove(name);
        self.configs.write().await.remove(name)
    }

    /// Walk a config's pipeline references through the registry, failing on
    /// unknown names and reference cycles.
    pub async fn resolve_pipeline(&self, name: &str) -> Result<Vec<ModelConfig>> {
        let configs = self.configs.read().await;
        let mut resolved = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![name.to_string()];

        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                return Err(Error::InvalidConfig(format!(
                    "pipeline reference cycle involving {}",
                    current
                )));
            }
            let cfg = configs.get(&current).ok_or_else(|| {
                Error::InvalidConfig(format!("pipeline references unknown model: {}", current))
            })?;
            for reference in cfg.pipeline.references() {
                stack.push(reference.to_string());
            }
            resolved.push(cfg.clone());
        }

        Ok(resolved)
    }

    /// Download URL-valued models, mmproj files and declared download
    /// files, verify checksums, and rewrite configs to point at the
    /// resolved on-disk filenames.
    pub async fn preload(&self) -> Result<()> {
        let models_path = self.system.models_path.clone();
        tracing::info!(path = %models_path.display(), "preloading models");

        // Snapshot under the lock; downloads happen without it.
        let snapshot = self.all().await;

        let progress = |file: &str, _cur: u64, _total: u64, pct: f64| {
            tracing::debug!(file = %file, percent = format!("{:.1}", pct), "downloading");
        };

        for cfg in snapshot {
            for file in &cfg.download_files {
                let target = downloader::verify_path(&file.filename, &models_path)?;
                downloader::download_file(
                    &self.http_client,
                    &file.uri,
                    &target,
                    &file.sha256,
                    &progress,
                )
                .await?;
            }

            let mut rewritten = cfg.clone();
            let mut dirty = false;

            if cfg.is_model_url() {
                let file_name = cfg.model_file_name();
                let target = downloader::verify_path(&file_name, &models_path)?;
                if !target.exists() {
                    downloader::download_file(
                        &self.http_client,
                        &cfg.parameters.model,
                        &target,
                        "",
                        &progress,
                    )
                    .await?;
                }
                rewritten.parameters.model = file_name;
                dirty = true;
            }

            if cfg.is_mmproj_url() {
                let file_name = cfg.mmproj_file_name();
                let target = downloader::verify_path(&file_name, &models_path)?;
                if !target.exists() {
                    downloader::download_file(
                        &self.http_client,
                        &cfg.mmproj,
                        &target,
                        "",
                        &progress,
                    )
                    .await?;
                }
                rewritten.mmproj = file_name;
                dirty = true;
            }

            if dirty {
                let mut configs = self.configs.write().await;
                configs.insert(rewritten.name.clone(), rewritten.clone());
            }

            print_model_banner(&rewritten);
        }

        Ok(())
    }
}

/// Informational banner printed once per preloaded model. Markdown-ish
/// plain text; `COLOR` selects the decorated variant and `NO_COLOR`
/// suppresses the decoration entirely.
fn print_model_banner(cfg: &ModelConfig) {
    let decorate =
        std::env::var("COLOR").is_ok() && std::env::var("NO_COLOR").is_err();
    let render = |text: &str| {
        if decorate {
            println!("\x1b[1m{}\x1b[0m", text);
        } else {
            println!("{}", text);
        }
    };

    if !cfg.name.is_empty() {
        render(&format!("Model name: {}", cfg.name));
    }
    if !cfg.description.is_empty() {
        render(&cfg.description);
    }
    if !cfg.usage.is_empty() {
        render(&cfg.usage);
    }
}
