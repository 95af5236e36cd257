//! Client for the backend control plane.
//!
//! Backends listen on a loopback address passed via `--addr` and expose a
//! small JSON-over-HTTP RPC surface: health probe, `LoadModel`, `Shutdown`,
//! `Status`, and the inference calls their capabilities cover.

use std::time::Duration;

use modelgate_common::{
    EmbeddingsRequest, EmbeddingsResponse, LoadModelRequest, ModelOptions, PredictRequest,
    PredictResponse, RpcResult, StatusResponse, TokenizeRequest, TokenizeResponse,
};

use crate::error::{Error, Result};

/// Deadline for the Shutdown RPC; after this the process gets signalled.
const SHUTDOWN_RPC_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct BackendClient {
    base_url: String,
    http: reqwest::Client,
}

impl BackendClient {
    pub fn new(address: &str) -> Self {
        Self {
            base_url: format!("http://{}", address),
            http: reqwest::Client::new(),
        }
    }

    pub fn address(&self) -> &str {
        self.base_url.trim_start_matches("http://")
    }

    /// Liveness probe used during the startup handshake.
    pub async fn health(&self) -> bool {
        match self.http.get(format!("{}/healthz", self.base_url)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    pub async fn load_model(&self, options: &ModelOptions) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/v1/load", self.base_url))
            .json(&LoadModelRequest {
                options: options.clone(),
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::BackendLoadFailed(format!("{}: {}", status, body)));
        }

        let result: RpcResult = resp.json().await?;
        if !result.success {
            return Err(Error::BackendLoadFailed(
                result.message.unwrap_or_else(|| "load rejected".to_string()),
            ));
        }
        Ok(())
    }

    /// Ask the backend to exit. Bounded by a short deadline; callers
    /// escalate to signals when this fails.
    pub async fn shutdown(&self) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/v1/shutdown", self.base_url))
            .timeout(SHUTDOWN_RPC_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Communication(format!(
                "shutdown returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    pub async fn status(&self) -> Result<StatusResponse> {
        let resp = self
            .http
            .get(format!("{}/v1/status", self.base_url))
            .send()
            .await?;
        Ok(resp.json().await?)
    }

    pub async fn predict(&self, request: &PredictRequest) -> Result<PredictResponse> {
        self.call("/v1/predict", request).await
    }

    pub async fn embeddings(&self, request: &EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        self.call("/v1/embeddings", request).await
    }

    pub async fn tokenize(&self, request: &TokenizeRequest) -> Result<TokenizeResponse> {
        self.call("/v1/tokenize", request).await
    }

    async fn call<Req, Resp>(&self, path: &str, request: &Req) -> Result<Resp>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(request)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Communication(format!("{}: {}", status, body)));
        }
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_health_probe() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let address = server.uri().trim_start_matches("http://").to_string();
        let client = BackendClient::new(&address);
        assert!(client.health().await);

        let dead = BackendClient::new("127.0.0.1:1");
        assert!(!dead.health().await);
    }

    #[tokio::test]
    async fn test_load_model_failure_surfaces_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/load"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": false,
                "message": "weights not found"
            })))
            .mount(&server)
            .await;

        let address = server.uri().trim_start_matches("http://").to_string();
        let client = BackendClient::new(&address);
        let err = client.load_model(&ModelOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::BackendLoadFailed(_)));
        assert!(err.to_string().contains("weights not found"));
    }
}
