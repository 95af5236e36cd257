//! Resolved system state: absolute paths and detected hardware.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};

/// GPU vendor detected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    None,
    Nvidia,
    Amd,
    Intel,
}

/// Immutable after init. Every core service receives a handle to this.
#[derive(Debug, Clone)]
pub struct SystemState {
    pub models_path: PathBuf,
    pub backends_path: PathBuf,
    pub system_backends_path: PathBuf,
    pub generated_content_path: PathBuf,
    pub gpu_vendor: GpuVendor,
    pub total_vram_bytes: u64,
}

impl SystemState {
    /// Resolve paths to absolute form, create the writable ones, and probe
    /// the GPU. Fails when the models directory cannot be created: without
    /// it the gateway cannot do anything useful.
    pub fn new(
        models_path: impl AsRef<Path>,
        backends_path: impl AsRef<Path>,
        system_backends_path: impl AsRef<Path>,
        generated_content_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let models_path = absolutize(models_path.as_ref());
        let backends_path = absolutize(backends_path.as_ref());
        let system_backends_path = absolutize(system_backends_path.as_ref());
        let generated_content_path = absolutize(generated_content_path.as_ref());

        for dir in [&models_path, &backends_path, &generated_content_path] {
            std::fs::create_dir_all(dir).map_err(|e| {
                Error::Internal(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }

        let (gpu_vendor, total_vram_bytes) = detect_gpu();
        tracing::info!(
            vendor = ?gpu_vendor,
            vram_bytes = total_vram_bytes,
            models = %models_path.display(),
            backends = %backends_path.display(),
            "system state resolved"
        );

        Ok(Self {
            models_path,
            backends_path,
            system_backends_path,
            generated_content_path,
            gpu_vendor,
            total_vram_bytes,
        })
    }

    pub fn has_gpu(&self) -> bool {
        self.gpu_vendor != GpuVendor::None
    }
}

fn absolutize(p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(p))
            .unwrap_or_else(|_| p.to_path_buf())
    }
}

/// Probe for a GPU: ask nvidia-smi for total VRAM, otherwise look at DRM
/// vendor ids under sysfs. VRAM stays 0 when unknown.
fn detect_gpu() -> (GpuVendor, u64) {
    if let Some(vram) = query_nvidia_smi() {
        return (GpuVendor::Nvidia, vram);
    }

    match sysfs_gpu_vendor() {
        Some(vendor) => (vendor, 0),
        None => (GpuVendor::None, 0),
    }
}

/// `nvidia-smi --query-gpu=memory.total --format=csv,noheader,nounits`
/// prints one MiB figure per GPU.
fn query_nvidia_smi() -> Option<u64> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let total_mib: u64 = text
        .lines()
        .filter_map(|l| l.trim().parse::<u64>().ok())
        .sum();
    if total_mib == 0 {
        return None;
    }
    Some(total_mib * 1024 * 1024)
}

/// Map PCI vendor ids from /sys/class/drm/card*/device/vendor.
fn sysfs_gpu_vendor() -> Option<GpuVendor> {
    let entries = std::fs::read_dir("/sys/class/drm").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("card") || name.contains('-') {
            continue;
        }
        let vendor_path = entry.path().join("device/vendor");
        if let Ok(vendor) = std::fs::read_to_string(&vendor_path) {
            match vendor.trim() {
                "0x10de" => return Some(GpuVendor::Nvidia),
                "0x1002" => return Some(GpuVendor::Amd),
                "0x8086" => return Some(GpuVendor::Intel),
                _ => continue,
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_new_creates_directories() {
        let tmp = TempDir::new().unwrap();
        let state = SystemState::new(
            tmp.path().join("models"),
            tmp.path().join("backends"),
            tmp.path().join("system-backends"),
            tmp.path().join("generated"),
        )
        .unwrap();

        assert!(state.models_path.is_dir());
        assert!(state.backends_path.is_dir());
        assert!(state.generated_content_path.is_dir());
        assert!(state.models_path.is_absolute());
    }

    #[test]
    fn test_relative_paths_are_absolutized() {
        let p = absolutize(Path::new("models"));
        assert!(p.is_absolute());
    }
}
