//! Backend control-plane protocol types.
//!
//! Every backend subprocess exposes the same control plane on a loopback
//! address handed to it via `--addr`: a health probe, `LoadModel`,
//! `Shutdown`, `Status`, plus the inference calls appropriate to its
//! capabilities. The gateway is the only client.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Options passed to a backend's `LoadModel` call.
///
/// This is the merged view of a model config at load time: the weights
/// location plus everything the runtime needs to materialize the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelOptions {
    pub model: String,
    #[serde(default)]
    pub model_path: String,
    #[serde(default)]
    pub context_size: Option<i32>,
    #[serde(default)]
    pub threads: Option<i32>,
    #[serde(default)]
    pub f16: Option<bool>,
    #[serde(default)]
    pub gpu_layers: Option<i32>,
    #[serde(default)]
    pub main_gpu: Option<String>,
    #[serde(default)]
    pub tensor_split: Option<String>,
    #[serde(default)]
    pub mmap: Option<bool>,
    #[serde(default)]
    pub mmlock: Option<bool>,
    #[serde(default)]
    pub low_vram: Option<bool>,
    #[serde(default)]
    pub embeddings: Option<bool>,
    #[serde(default)]
    pub lora_adapter: Option<String>,
    #[serde(default)]
    pub lora_base: Option<String>,
    #[serde(default)]
    pub lora_scale: Option<f32>,
    #[serde(default)]
    pub draft_model: Option<String>,
    #[serde(default)]
    pub mm_proj: Option<String>,
    #[serde(default)]
    pub seed: Option<i32>,
    #[serde(default)]
    pub batch_size: Option<i32>,
    /// Free-form backend options ("gpu", "use_jinja:true", ...).
    #[serde(default)]
    pub options: Vec<String>,
    /// Extra environment for the backend process.
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

/// Request body for the `LoadModel` RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadModelRequest {
    pub options: ModelOptions,
}

/// Generic RPC outcome used by load/shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResult {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Backend process lifecycle state as reported by `Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Uninitialized,
    Busy,
    Ready,
    Error,
}

/// Response of the `Status` RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub state: BackendStatus,
    /// Resident memory in bytes, if the backend reports it.
    #[serde(default)]
    pub memory_bytes: Option<u64>,
}

/// Text generation request (chat and completion endpoints funnel here).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictRequest {
    pub prompt: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<i32>,
    #[serde(default)]
    pub max_tokens: Option<i32>,
    #[serde(default)]
    pub seed: Option<i32>,
    #[serde(default)]
    pub stop_words: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictResponse {
    pub text: String,
    #[serde(default)]
    pub prompt_tokens: Option<u32>,
    #[serde(default)]
    pub completion_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsRequest {
    pub input: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsResponse {
    pub embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizeRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizeResponse {
    pub tokens: Vec<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_options_defaults() {
        let json = r#"{"model": "weights.gguf"}"#;
        let opts: ModelOptions = serde_json::from_str(json).unwrap();
        assert_eq!(opts.model, "weights.gguf");
        assert!(opts.context_size.is_none());
        assert!(opts.options.is_empty());
    }

    #[test]
    fn test_status_response_state_names() {
        let json = r#"{"state": "ready"}"#;
        let status: StatusResponse = serde_json::from_str(json).unwrap();
        assert_eq!(status.state, BackendStatus::Ready);
        assert!(status.memory_bytes.is_none());
    }
}
