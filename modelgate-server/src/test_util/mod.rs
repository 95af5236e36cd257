//! Shared helpers for unit tests: a mock backend speaking the control
//! plane over wiremock, and a throwaway system state rooted in a temp dir.

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::system::SystemState;

/// Fresh temp-dir-rooted system state. The `TempDir` must stay alive for
/// the duration of the test.
pub fn test_system() -> (TempDir, Arc<SystemState>) {
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
    (tmp, system)
}

/// A control-plane backend served by wiremock. Register its address as an
/// external backend and the loader will attach to it without spawning.
pub struct MockBackend {
    server: MockServer,
    address: String,
}

pub async fn mock_backend() -> MockBackend {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/healthz"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/load"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/shutdown"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/status"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"state": "ready"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/predict"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"text": "mock reply"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"embeddings": [[0.1, 0.2]]})),
        )
        .mount(&server)
        .await;

    let address = server
        .uri()
        .trim_start_matches("http://")
        .to_string();
    MockBackend { server, address }
}

impl MockBackend {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Make the next LoadModel call fail.
    pub async fn fail_next_load(&self) {
        Mock::given(method("POST"))
            .and(path("/v1/load"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "message": "simulated load failure"
            })))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&self.server)
            .await;
    }

    pub async fn load_calls(&self) -> usize {
        self.count_requests("/v1/load").await
    }

    pub async fn shutdown_calls(&self) -> usize {
        self.count_requests("/v1/shutdown").await
    }

    async fn count_requests(&self, wanted: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == wanted)
            .count()
    }
}
