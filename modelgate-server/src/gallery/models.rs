//! Model install and delete operations.

use std::sync::atomic::{AtomicBool, Ordering};

use modelgate_common::gallery::{GalleryElement, GallerySource, RemoteFile};

use super::{backends, GalleryContext, GalleryOpStatus, GalleryService, ModelOp};
use crate::downloader;
use crate::error::{Error, Result};

/// Manifest behind a model gallery element's `url`: a config skeleton plus
/// the files to fetch next to it.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ModelManifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub license: String,
    /// Embedded model-config YAML document.
    #[serde(default)]
    pub config_file: String,
    #[serde(default)]
    pub files: Vec<RemoteFile>,
    /// Backend this model needs, installed alongside when autoloading is
    /// enabled.
    #[serde(default)]
    pub backend: String,
}

/// Resolve a gallery reference to an element. Accepted forms:
/// `gallery@name`, a bare element name searched across all configured
/// galleries, or a direct manifest URL.
pub async fn resolve_gallery_element(
    http: &reqwest::Client,
    galleries: &[GallerySource],
    reference: &str,
) -> Result<GalleryElement> {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return Ok(GalleryElement {
            url: reference.to_string(),
            ..Default::default()
        });
    }

    let (gallery_filter, element_name) = match reference.split_once('@') {
        Some((gallery, name)) => (Some(gallery), name),
        None => (None, reference),
    };

    for source in galleries {
        if let Some(wanted) = gallery_filter {
            if source.name != wanted {
                continue;
            }
        }
        let elements: Vec<GalleryElement> = fetch_yaml(http, &source.url).await?;
        if let Some(element) = elements.into_iter().find(|e| e.name == element_name) {
            return Ok(element);
        }
    }

    Err(Error::NotFound(format!(
        "no gallery element named {}",
        reference
    )))
}

/// Install one model: resolve, fetch manifest, merge overrides, download
/// files inside the models root, write `<name>.yaml`, optionally install
/// the declared backend, then reload the config registry.
pub async fn install_model(
    svc: &GalleryService,
    op: &ModelOp,
    cancel: &AtomicBool,
) -> Result<()> {
    let ctx = svc.context().clone();
    let element = resolve_gallery_element(&ctx.http, &ctx.galleries, &op.element).await?;
    check_cancelled(cancel)?;

    if element.url.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "gallery element {} has no manifest url",
            op.element
        )));
    }
    let manifest: ModelManifest = fetch_yaml(&ctx.http, &element.url).await?;
    check_cancelled(cancel)?;

    // Config skeleton from the manifest, as a raw YAML mapping so that
    // arbitrary override keys pass through to the final file.
    let mut doc: serde_yaml::Value = if manifest.config_file.is_empty() {
        serde_yaml::Value::Mapping(Default::default())
    } else {
        serde_yaml::from_str(&manifest.config_file)?
    };
    let mapping = doc
        .as_mapping_mut()
        .ok_or_else(|| Error::Parse("model manifest config is not a mapping".to_string()))?;

    let name = {
        let from_doc = mapping
            .get(serde_yaml::Value::from("name"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if !from_doc.is_empty() {
            from_doc.to_string()
        } else if !element.name.is_empty() {
            element.name.clone()
        } else if !manifest.name.is_empty() {
            manifest.name.clone()
        } else {
            return Err(Error::InvalidConfig(
                "model manifest carries no name".to_string(),
            ));
        }
    };
    mapping.insert(
        serde_yaml::Value::from("name"),
        serde_yaml::Value::from(name.clone()),
    );

    for (key, value) in element
        .overrides
        .iter()
        .chain(op.overrides.iter())
    {
        mapping.insert(serde_yaml::Value::from(key.clone()), value.clone());
    }

    // Every file lands inside the models root or the job fails before any
    // bytes move.
    let mut files: Vec<RemoteFile> = manifest.files.clone();
    files.extend(element.additional_files.iter().cloned());
    for file in &files {
        downloader::verify_path(&file.filename, &ctx.system.models_path)?;
    }

    for file in &files {
        check_cancelled(cancel)?;
        let target = downloader::verify_path(&file.filename, &ctx.system.models_path)?;
        let element_name = op.element.clone();
        let op_id = op.id.clone();
        let progress = move |file_name: &str, downloaded: u64, total: u64, percent: f64| {
            svc.update_status(
                &op_id,
                GalleryOpStatus {
                    message: format!("downloading {}", file_name),
                    file_name: file_name.to_string(),
                    progress: percent,
                    downloaded_bytes: downloaded,
                    total_bytes: total,
                    gallery_element_name: element_name.clone(),
                    cancellable: true,
                    ..Default::default()
                },
            );
        };
        downloader::download_file(&ctx.http, &file.uri, &target, &file.sha256, &progress)
            .await?;
    }
    check_cancelled(cancel)?;

    let config_path = ctx.system.models_path.join(format!("{}.yaml", name));
    let content = serde_yaml::to_string(&doc)?;
    std::fs::write(&config_path, content)?;
    tracing::info!(model = %name, path = %config_path.display(), "model config installed");

    let wanted_backend = if !manifest.backend.is_empty() {
        manifest.backend.clone()
    } else {
        element.backend.clone()
    };
    if !wanted_backend.is_empty() && ctx.autoload_backend_galleries {
        check_cancelled(cancel)?;
        if !ctx.registry.exists(&wanted_backend).await {
            tracing::info!(backend = %wanted_backend, "installing backend required by model");
            backends::install_backend_by_name(&ctx, &wanted_backend, cancel).await?;
        }
    }

    ctx.config_loader
        .load_from_directory(&ctx.system.models_path, &ctx.load_defaults)
        .await?;
    ctx.config_loader.preload().await?;
    Ok(())
}

/// Delete a model: its YAML, its weights and companion files, and the
/// in-memory entry.
pub async fn delete_model(ctx: &std::sync::Arc<GalleryContext>, name: &str) -> Result<()> {
    let config = ctx.config_loader.get(name).await;

    let config_path = ctx.system.models_path.join(format!("{}.yaml", name));
    if config_path.exists() {
        std::fs::remove_file(&config_path)?;
    }

    if let Some(config) = &config {
        let mut companions: Vec<String> = config
            .download_files
            .iter()
            .map(|f| f.filename.clone())
            .collect();
        let model_file = config.model_file_name();
        if !model_file.is_empty() {
            companions.push(model_file);
        }
        if !config.mmproj.is_empty() {
            companions.push(config.mmproj_file_name());
        }
        for companion in companions {
            match downloader::verify_path(&companion, &ctx.system.models_path) {
                Ok(path) => {
                    if path.exists() {
                        if let Err(e) = std::fs::remove_file(&path) {
                            tracing::warn!(file = %path.display(), error = %e, "could not remove companion file");
                        }
                    }
                }
                Err(_) => {
                    tracing::warn!(file = %companion, "companion file path escapes models dir, skipping");
                }
            }
        }
    }

    ctx.config_loader.remove(name).await;
    tracing::info!(model = %name, "model deleted");
    Ok(())
}

pub(super) async fn fetch_yaml<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
) -> Result<T> {
    let response = http.get(url).send().await?;
    if !response.status().is_success() {
        return Err(Error::Communication(format!(
            "fetching {} returned {}",
            url,
            response.status()
        )));
    }
    let text = response.text().await?;
    Ok(serde_yaml::from_str(&text)?)
}

fn check_cancelled(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::SeqCst) {
        Err(Error::Internal("operation cancelled".to_string()))
    } else {
        Ok(())
    }
}
