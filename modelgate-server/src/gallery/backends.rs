//! Backend install and delete operations.
//!
//! Backends install from gzipped tar archives (HTTP or local path) into
//! `backendsPath/<name>/`. The archive must contain a `metadata.yaml`
//! manifest and the executable entry point it names; a failed install
//! removes the partial directory before surfacing the error.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use modelgate_common::gallery::BackendManifest;

use super::models::resolve_gallery_element;
use super::{BackendOp, GalleryContext, GalleryOpStatus, GalleryService};
use crate::downloader;
use crate::error::{Error, Result};

pub async fn install_backend(
    svc: &GalleryService,
    op: &BackendOp,
    cancel: &AtomicBool,
) -> Result<()> {
    let ctx = svc.context().clone();

    let (name, archive_uri, sha256) = if !op.external_uri.is_empty() {
        (op.element.clone(), op.external_uri.clone(), String::new())
    } else {
        let element =
            resolve_gallery_element(&ctx.http, &ctx.backend_galleries, &op.element).await?;
        let name = if element.name.is_empty() {
            op.element.clone()
        } else {
            element.name.clone()
        };
        if element.uri.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "backend element {} has no archive uri",
                op.element
            )));
        }
        (name, element.uri, element.sha256)
    };
    check_cancelled(cancel)?;

    let op_id = op.id.clone();
    let element_name = op.element.clone();
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

    install_from_archive(&ctx, &name, &archive_uri, &sha256, cancel, &progress).await
}

/// Gallery-resolved install used when a model declares its backend.
/// Already-installed backends are left alone.
pub(crate) async fn install_backend_by_name(
    ctx: &std::sync::Arc<GalleryContext>,
    name: &str,
    cancel: &AtomicBool,
) -> Result<()> {
    if ctx.registry.exists(name).await {
        return Ok(());
    }
    let element = resolve_gallery_element(&ctx.http, &ctx.backend_galleries, name).await?;
    if element.uri.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "backend element {} has no archive uri",
            name
        )));
    }
    let install_name = if element.name.is_empty() {
        name.to_string()
    } else {
        element.name.clone()
    };
    install_from_archive(
        ctx,
        &install_name,
        &element.uri,
        &element.sha256,
        cancel,
        &downloader::no_progress,
    )
    .await
}

async fn install_from_archive(
    ctx: &std::sync::Arc<GalleryContext>,
    name: &str,
    archive_uri: &str,
    sha256: &str,
    cancel: &AtomicBool,
    progress: downloader::ProgressFn<'_>,
) -> Result<()> {
    let target_dir = ctx.system.backends_path.join(name);

    let result = async {
        let archive_path = if archive_uri.starts_with("http://")
            || archive_uri.starts_with("https://")
        {
            let staging = ctx
                .system
                .backends_path
                .join(format!(".download-{}.tar.gz", name));
            downloader::download_file(&ctx.http, archive_uri, &staging, sha256, progress)
                .await?;
            staging
        } else {
            let local = std::path::PathBuf::from(archive_uri);
            if !local.exists() {
                return Err(Error::NotFound(format!(
                    "backend archive not found: {}",
                    archive_uri
                )));
            }
            local
        };
        check_cancelled(cancel)?;

        extract_archive(&archive_path, &target_dir).await?;

        // A staged download is only a vehicle for the extraction.
        if archive_path.starts_with(&ctx.system.backends_path) {
            let _ = std::fs::remove_file(&archive_path);
        }

        verify_installed_backend(&target_dir)?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        if target_dir.exists() {
            let _ = std::fs::remove_dir_all(&target_dir);
        }
        return Err(e);
    }

    ctx.registry.rescan().await?;
    tracing::info!(backend = %name, dir = %target_dir.display(), "backend installed");
    Ok(())
}

/// Remove an installed backend directory and any external registration of
/// the same name.
pub async fn delete_backend(ctx: &std::sync::Arc<GalleryContext>, name: &str) -> Result<()> {
    let dir = ctx.system.backends_path.join(name);
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    ctx.registry.remove_external(name).await;
    ctx.registry.rescan().await?;
    tracing::info!(backend = %name, "backend deleted");
    Ok(())
}

async fn extract_archive(archive: &Path, target_dir: &Path) -> Result<()> {
    let archive = archive.to_path_buf();
    let target = target_dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        std::fs::create_dir_all(&target)?;
        let file = std::fs::File::open(&archive)?;
        let decoder = flate2::read::GzDecoder::new(file);
        let mut tar = tar::Archive::new(decoder);
        tar.unpack(&target)
            .map_err(|e| Error::Parse(format!("invalid backend archive: {}", e)))?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Internal(format!("extraction task failed: {}", e)))?
}

fn verify_installed_backend(dir: &Path) -> Result<()> {
    let manifest_path = dir.join("metadata.yaml");
    let content = std::fs::read_to_string(&manifest_path).map_err(|_| {
        Error::InvalidConfig("backend archive carries no metadata.yaml".to_string())
    })?;
    let manifest: BackendManifest = serde_yaml::from_str(&content)?;
    if manifest.name.is_empty() {
        return Err(Error::InvalidConfig(
            "backend manifest has no name".to_string(),
        ));
    }
    if !dir.join(&manifest.entrypoint).exists() {
        return Err(Error::InvalidConfig(format!(
            "backend manifest entry point missing: {}",
            manifest.entrypoint
        )));
    }
    Ok(())
}

fn check_cancelled(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::SeqCst) {
        Err(Error::Internal("operation cancelled".to_string()))
    } else {
        Ok(())
    }
}
