//! Streaming file downloads with checksum verification.
//!
//! Used by the config loader's preload step and by the gallery workers.
//! Downloads stream to disk chunk by chunk so progress can be reported and
//! cancellation leaves a partial file behind for resume-by-redownload.

use std::path::{Component, Path, PathBuf};

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};

/// Progress callback: (file name, downloaded bytes, total bytes, percent).
pub type ProgressFn<'a> = &'a (dyn Fn(&str, u64, u64, f64) + Send + Sync);

/// No-op progress callback.
pub fn no_progress(_: &str, _: u64, _: u64, _: f64) {}

/// Join `name` onto `base` and reject anything that would escape it.
pub fn verify_path(name: &str, base: &Path) -> Result<PathBuf> {
    let candidate = Path::new(name);
    if candidate.is_absolute() {
        return Err(Error::InvalidConfig(format!(
            "path escapes base directory: {}",
            name
        )));
    }
    for component in candidate.components() {
        if matches!(component, Component::ParentDir) {
            return Err(Error::InvalidConfig(format!(
                "path escapes base directory: {}",
                name
            )));
        }
    }
    Ok(base.join(candidate))
}

/// Check an existing file against an expected sha256 (lowercase hex).
pub fn file_matches_sha256(path: &Path, expected: &str) -> bool {
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(_) => return false,
    };
    let digest = hex::encode(Sha256::digest(&data));
    digest.eq_ignore_ascii_case(expected)
}

/// Download `uri` to `target`, streaming chunks and reporting progress.
///
/// When the target already exists it is kept if either no checksum was
/// supplied or the checksum matches; a mismatching file is re-downloaded.
/// A supplied checksum that does not match the downloaded bytes fails the
/// download and removes the file.
pub async fn download_file(
    client: &reqwest::Client,
    uri: &str,
    target: &Path,
    sha256: &str,
    progress: ProgressFn<'_>,
) -> Result<()> {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| uri.to_string());

    if target.exists() {
        if sha256.is_empty() {
            tracing::debug!(file = %file_name, "file already present, skipping download");
            return Ok(());
        }
        if file_matches_sha256(target, sha256) {
            tracing::debug!(file = %file_name, "file already present with matching sha256");
            return Ok(());
        }
        tracing::warn!(file = %file_name, "existing file has wrong sha256, re-downloading");
    }

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    tracing::info!(uri = %uri, target = %target.display(), "downloading");

    let response = client.get(uri).send().await?;
    if !response.status().is_success() {
        return Err(Error::Communication(format!(
            "download of {} failed with status {}",
            uri,
            response.status()
        )));
    }

    let total = response.content_length().unwrap_or(0);
    let mut downloaded: u64 = 0;
    let mut hasher = Sha256::new();
    let mut file = tokio::fs::File::create(target).await?;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::Communication(e.to_string()))?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        let percent = if total > 0 {
            downloaded as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        progress(&file_name, downloaded, total, percent);
    }
    file.flush().await?;

    if !sha256.is_empty() {
        let digest = hex::encode(hasher.finalize());
        if !digest.eq_ignore_ascii_case(sha256) {
            let _ = tokio::fs::remove_file(target).await;
            return Err(Error::InvalidConfig(format!(
                "sha256 mismatch for {}: expected {}, got {}",
                file_name, sha256, digest
            )));
        }
    }

    Ok(())
}
