//! Gallery manifest schema.
//!
//! A gallery is a remote YAML catalogue of installable models or backends.
//! Elements resolve to a config skeleton plus files to fetch; backends
//! resolve to an archive with a `metadata.yaml` inside.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A configured gallery source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GallerySource {
    pub name: String,
    pub url: String,
}

/// One file referenced by a gallery element.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteFile {
    pub filename: String,
    #[serde(default)]
    pub sha256: String,
    pub uri: String,
}

/// One installable element of a gallery manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GalleryElement {
    pub name: String,
    /// URL of the element's own config manifest (models).
    #[serde(default)]
    pub url: String,
    /// Archive location (backends): HTTP(S) tarball or local path.
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub license: String,
    /// Free-form map merged into the resulting model config on install.
    #[serde(default)]
    pub overrides: HashMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub additional_files: Vec<RemoteFile>,
    /// Backend required by this model, installed alongside when backend
    /// autoloading is enabled.
    #[serde(default)]
    pub backend: String,
}

impl GalleryElement {
    /// Composite id in `gallery@name` form.
    pub fn id(&self, gallery_name: &str) -> String {
        format!("{}@{}", gallery_name, self.name)
    }
}

/// `metadata.yaml` contained in an installed backend directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendManifest {
    pub name: String,
    /// Executable entry point, relative to the backend directory.
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
    /// Usecase names this backend can serve.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub installed_at: String,
}

fn default_entrypoint() -> String {
    "run".to_string()
}
