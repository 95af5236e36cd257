//! End-to-end gallery flows against a mocked gallery host: install a model
//! with overrides, watch the config appear and load, then delete it again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sha2::Digest;
use tempfile::TempDir;
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use modelgate_server::backends::BackendRegistry;
use modelgate_server::gallery::{GalleryContext, GalleryOpStatus, GalleryService};
use modelgate_server::loader::{LoaderSettings, ModelLoader};
use modelgate_server::model_config::{LoadDefaults, ModelConfigLoader};
use modelgate_server::system::SystemState;

struct Harness {
    _tmp: TempDir,
    system: Arc<SystemState>,
    config_loader: Arc<ModelConfigLoader>,
    service: Arc<GalleryService>,
    _shutdown_tx: watch::Sender<bool>,
}

async fn harness(gallery_url: &str) -> Harness {
    let tmp = TempDir::new().unwrap();
    let system = Arc::new(
        SystemState::new(
            tmp.path().join("models"),
            tmp.path().join("backends"),
            tmp.path().join("system-backends"),
            tmp.path().join("generated"),
        )
        .unwrap(),
    );
    let registry = Arc::new(BackendRegistry::new(system.clone()));
    let config_loader = Arc::new(ModelConfigLoader::new(system.clone()));
    let model_loader = Arc::new(ModelLoader::new(
        registry.clone(),
        LoaderSettings::default(),
    ));

    let service = GalleryService::new(GalleryContext {
        system: system.clone(),
        config_loader: config_loader.clone(),
        model_loader,
        registry,
        galleries: vec![modelgate_common::gallery::GallerySource {
            name: "main".to_string(),
            url: gallery_url.to_string(),
        }],
        backend_galleries: vec![],
        autoload_backend_galleries: false,
        load_defaults: LoadDefaults::default(),
        http: reqwest::Client::new(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    service.start(shutdown_rx).await;

    Harness {
        _tmp: tmp,
        system,
        config_loader,
        service,
        _shutdown_tx: shutdown_tx,
    }
}

async fn wait_processed(service: &GalleryService, id: &str) -> GalleryOpStatus {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(status) = service.get_status(id) {
                if status.processed {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("gallery job did not finish")
}

async fn mount_bert2_gallery(server: &MockServer, weights: &[u8], sha256: &str) {
    let index = format!(
        "- name: bert2\n  url: {}/bert2/manifest.yaml\n  description: test embedding model\n",
        server.uri()
    );
    Mock::given(method("GET"))
        .and(path("/index.yaml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(index))
        .mount(server)
        .await;

    let manifest = format!(
        concat!(
            "name: bert2\n",
            "config_file: |\n",
            "  name: bert2\n",
            "  backend: bert-embeddings\n",
            "  embeddings: true\n",
            "  parameters:\n",
            "    model: bert2.bin\n",
            "files:\n",
            "- filename: bert2.bin\n",
            "  sha256: {}\n",
            "  uri: {}/bert2.bin\n",
        ),
        sha256,
        server.uri()
    );
    Mock::given(method("GET"))
        .and(path("/bert2/manifest.yaml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(manifest))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/bert2.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(weights.to_vec()))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_install_model_with_overrides_then_config_appears() {
    let server = MockServer::start().await;
    let weights = b"tiny bert weights".to_vec();
    let sha = hex::encode(sha2::Sha256::digest(&weights));
    mount_bert2_gallery(&server, &weights, &sha).await;

    let h = harness(&format!("{}/index.yaml", server.uri())).await;

    let mut overrides = HashMap::new();
    overrides.insert(
        "foo".to_string(),
        serde_yaml::Value::String("bar".to_string()),
    );
    let job_id = h.service.install_model("main@bert2", overrides).unwrap();

    let status = wait_processed(&h.service, &job_id).await;
    assert!(status.error.is_none(), "install failed: {:?}", status.error);
    assert!(!status.deletion);
    assert_eq!(status.progress, 100.0);

    // The config file landed, parses, and carries the override.
    let config_path = h.system.models_path.join("bert2.yaml");
    assert!(config_path.exists());
    let raw: serde_yaml::Value =
        serde_yaml::from_str(&std::fs::read_to_string(&config_path).unwrap()).unwrap();
    assert_eq!(raw["name"].as_str(), Some("bert2"));
    assert_eq!(raw["foo"].as_str(), Some("bar"));

    // The weights were downloaded and verified.
    assert_eq!(
        std::fs::read(h.system.models_path.join("bert2.bin")).unwrap(),
        weights
    );

    // The loader picked the new entry up during the post-install reload.
    let config = h.config_loader.get("bert2").await.unwrap();
    assert_eq!(config.backend, "bert-embeddings");
    assert_eq!(config.embeddings, Some(true));
}

#[tokio::test]
async fn test_install_then_delete_model() {
    let server = MockServer::start().await;
    let weights = b"weights".to_vec();
    let sha = hex::encode(sha2::Sha256::digest(&weights));
    mount_bert2_gallery(&server, &weights, &sha).await;

    let h = harness(&format!("{}/index.yaml", server.uri())).await;

    let install = h.service.install_model("bert2", HashMap::new()).unwrap();
    let status = wait_processed(&h.service, &install).await;
    assert!(status.error.is_none());
    assert!(h.config_loader.get("bert2").await.is_some());

    let delete = h.service.delete_model("bert2").unwrap();
    let status = wait_processed(&h.service, &delete).await;
    assert!(status.error.is_none());
    assert!(status.deletion);

    assert!(!h.system.models_path.join("bert2.yaml").exists());
    assert!(!h.system.models_path.join("bert2.bin").exists());
    assert!(h.config_loader.get("bert2").await.is_none());
}

#[tokio::test]
async fn test_install_rejects_checksum_mismatch() {
    let server = MockServer::start().await;
    let weights = b"weights".to_vec();
    mount_bert2_gallery(&server, &weights, &"0".repeat(64)).await;

    let h = harness(&format!("{}/index.yaml", server.uri())).await;

    let job_id = h.service.install_model("bert2", HashMap::new()).unwrap();
    let status = wait_processed(&h.service, &job_id).await;

    assert!(status.error.is_some());
    assert!(status.error.unwrap().contains("sha256"));
    assert!(!h.system.models_path.join("bert2.bin").exists());
    assert!(h.config_loader.get("bert2").await.is_none());
}

#[tokio::test]
async fn test_unknown_element_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/index.yaml"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .mount(&server)
        .await;

    let h = harness(&format!("{}/index.yaml", server.uri())).await;
    let job_id = h.service.install_model("missing", HashMap::new()).unwrap();
    let status = wait_processed(&h.service, &job_id).await;
    assert!(status.error.is_some());
}

#[tokio::test]
async fn test_backend_install_from_archive() {
    use std::io::Write;

    // Build a minimal backend tarball: metadata.yaml + run script.
    let staging = TempDir::new().unwrap();
    let backend_dir = staging.path().join("pack");
    std::fs::create_dir_all(&backend_dir).unwrap();
    std::fs::write(
        backend_dir.join("metadata.yaml"),
        "name: echo-backend\nentrypoint: run\ncapabilities:\n  - chat\n",
    )
    .unwrap();
    std::fs::write(backend_dir.join("run"), "#!/bin/sh\nexit 0\n").unwrap();

    let archive_path = staging.path().join("echo-backend.tar.gz");
    {
        let file = std::fs::File::create(&archive_path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut tar = tar::Builder::new(encoder);
        tar.append_path_with_name(backend_dir.join("metadata.yaml"), "metadata.yaml")
            .unwrap();
        tar.append_path_with_name(backend_dir.join("run"), "run")
            .unwrap();
        let encoder = tar.into_inner().unwrap();
        let mut file = encoder.finish().unwrap();
        file.flush().unwrap();
    }

    let h = harness("http://127.0.0.1:1/unused.yaml").await;

    let job_id = h
        .service
        .install_backend("echo-backend", archive_path.to_str().unwrap())
        .unwrap();
    let status = wait_processed(&h.service, &job_id).await;
    assert!(status.error.is_none(), "install failed: {:?}", status.error);

    let installed = h.system.backends_path.join("echo-backend");
    assert!(installed.join("metadata.yaml").exists());
    assert!(installed.join("run").exists());

    // And delete it again.
    let delete = h.service.delete_backend("echo-backend").unwrap();
    let status = wait_processed(&h.service, &delete).await;
    assert!(status.error.is_none());
    assert!(!installed.exists());
}
