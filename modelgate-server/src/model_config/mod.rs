//! Typed model configuration.
//!
//! A `ModelConfig` is the merged record for one model: generation defaults,
//! prompt templates, backend selection, feature flags, MCP and agent
//! settings. Configs are read from YAML files in the models directory and
//! completed by `set_defaults` plus the GGUF guesser.

mod gguf;
mod loader;

pub use gguf::{estimate_gpu_layers, GgufMetadata};
pub use loader::{LoadDefaults, ModelConfigFilterFn, ModelConfigLoader};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use modelgate_common::gallery::RemoteFile;
use modelgate_common::usecase::Usecase;

use crate::error::{Error, Result};

/// Seed value meaning "pick a random seed".
pub const RAND_SEED: i32 = -1;

/// Generation defaults, the `parameters` YAML section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictionParameters {
    /// Weights file relative to the models directory, or a URL to download.
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typical_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tfz: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirostat: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirostat_tau: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirostat_eta: Option<f64>,
}

/// Prompt template configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateConfig {
    #[serde(default)]
    pub chat: String,
    #[serde(default)]
    pub chat_message: String,
    #[serde(default)]
    pub completion: String,
    #[serde(default)]
    pub edit: String,
    #[serde(default)]
    pub function: String,
    #[serde(default)]
    pub multimodal: String,
    /// Raw Jinja chat template carried over from the model file when no
    /// known family matched; rendered by the backend.
    #[serde(default)]
    pub jinja_template: String,
    /// Use the tokenizer's own chat template upstream.
    #[serde(default)]
    pub use_tokenizer_template: bool,
    #[serde(default)]
    pub reply_prefix: String,
}

impl TemplateConfig {
    pub fn is_empty(&self) -> bool {
        self.chat.is_empty()
            && self.chat_message.is_empty()
            && self.completion.is_empty()
            && self.edit.is_empty()
            && !self.use_tokenizer_template
    }
}

/// Diffusion-specific settings, only meaningful for image/video backends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffusersConfig {
    #[serde(default)]
    pub pipeline_type: String,
    #[serde(default)]
    pub scheduler_type: String,
    #[serde(default)]
    pub cuda: bool,
}

/// Other model names this config delegates parts of its pipeline to.
/// Resolved lazily through the config loader.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub tts: String,
    #[serde(default)]
    pub llm: String,
    #[serde(default)]
    pub transcription: String,
    #[serde(default)]
    pub vad: String,
}

impl PipelineConfig {
    pub fn references(&self) -> Vec<&str> {
        [&self.tts, &self.llm, &self.transcription, &self.vad]
            .into_iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.references().is_empty()
    }
}

/// Backend startup probe tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupProbe {
    #[serde(default = "default_probe_attempts")]
    pub attempts: u32,
    #[serde(default = "default_probe_sleep_ms")]
    pub sleep_ms: u64,
}

impl Default for StartupProbe {
    fn default() -> Self {
        Self {
            attempts: default_probe_attempts(),
            sleep_ms: default_probe_sleep_ms(),
        }
    }
}

fn default_probe_attempts() -> u32 {
    10
}
fn default_probe_sleep_ms() -> u64 {
    500
}

/// MCP wiring for a model: both fields hold embedded YAML documents
/// (`mcpServers:` maps), kept opaque until an agent job needs them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub remote: String,
    #[serde(default)]
    pub stdio: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServersDoc<T> {
    #[serde(default, rename = "mcpServers")]
    pub mcp_servers: HashMap<String, T>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpRemoteServer {
    pub url: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpStdioServer {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl McpConfig {
    pub fn is_empty(&self) -> bool {
        self.remote.is_empty() && self.stdio.is_empty()
    }

    /// Decode the embedded server documents.
    pub fn decode(
        &self,
    ) -> Result<(
        HashMap<String, McpRemoteServer>,
        HashMap<String, McpStdioServer>,
    )> {
        let remote = if self.remote.is_empty() {
            HashMap::new()
        } else {
            let doc: McpServersDoc<McpRemoteServer> = serde_yaml::from_str(&self.remote)?;
            doc.mcp_servers
        };
        let stdio = if self.stdio.is_empty() {
            HashMap::new()
        } else {
            let doc: McpServersDoc<McpStdioServer> = serde_yaml::from_str(&self.stdio)?;
            doc.mcp_servers
        };
        Ok((remote, stdio))
    }
}

/// Agent loop tuning for a model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default)]
    pub max_iterations: u32,
    #[serde(default)]
    pub enable_reasoning: bool,
    #[serde(default)]
    pub enable_re_evaluation: bool,
}

/// Merged configuration for one model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub name: String,
    /// Backend identifier; empty means auto-pick by usecase.
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub parameters: PredictionParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_size: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub f16: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reranking: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_layers: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mmap: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mmlock: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_vram: Option<bool>,
    #[serde(default)]
    pub mmproj: String,
    #[serde(default)]
    pub template: TemplateConfig,
    #[serde(default)]
    pub stopwords: Vec<String>,
    #[serde(default)]
    pub known_usecases: Vec<String>,
    #[serde(default)]
    pub download_files: Vec<RemoteFile>,
    #[serde(default)]
    pub diffusers: DiffusersConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub startup: StartupProbe,
    #[serde(default)]
    pub options: Option<Vec<String>>,
    #[serde(default)]
    pub overrides: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub usage: String,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub agent: AgentSettings,
}

impl ModelConfig {
    /// Fill every unset tri-state field with its default. The supplied
    /// `LoadDefaults` carry the gateway-level ctx/threads/f16/debug knobs.
    pub fn set_defaults(&mut self, defaults: &LoadDefaults) {
        let p = &mut self.parameters;
        if p.seed.is_none() {
            p.seed = Some(RAND_SEED);
        }
        if p.top_k.is_none() {
            p.top_k = Some(40);
        }
        if p.top_p.is_none() {
            p.top_p = Some(0.95);
        }
        if p.temperature.is_none() {
            p.temperature = Some(0.9);
        }
        if p.typical_p.is_none() {
            p.typical_p = Some(1.0);
        }
        if p.tfz.is_none() {
            p.tfz = Some(1.0);
        }
        if p.mirostat.is_none() {
            p.mirostat = Some(0);
        }
        if p.mirostat_tau.is_none() {
            p.mirostat_tau = Some(5.0);
        }
        if p.mirostat_eta.is_none() {
            p.mirostat_eta = Some(0.1);
        }
        if p.max_tokens.is_none() {
            p.max_tokens = Some(0);
        }

        if self.mmap.is_none() {
            // mmap on by default, except on Intel GPU setups
            self.mmap = Some(std::env::var("XPU").is_err());
        }
        if self.mmlock.is_none() {
            self.mmlock = Some(false);
        }
        if self.low_vram.is_none() {
            self.low_vram = Some(false);
        }
        if self.embeddings.is_none() {
            self.embeddings = Some(false);
        }
        if self.reranking.is_none() {
            self.reranking = Some(false);
        }

        if self.threads.is_none() {
            let threads = if defaults.threads > 0 {
                defaults.threads
            } else {
                4
            };
            self.threads = Some(threads.max(1));
        }
        if self.f16.is_none() {
            self.f16 = Some(defaults.f16);
        }
        if self.debug.is_none() {
            self.debug = Some(false);
        }
        if defaults.debug {
            self.debug = Some(true);
        }
        if self.context_size.is_none() && defaults.context_size > 0 {
            self.context_size = Some(defaults.context_size);
        }
    }

    /// Reject path traversal in path-like fields and malformed backend
    /// identifiers.
    pub fn validate(&self) -> Result<()> {
        let mut targets: Vec<&str> = vec![&self.backend, &self.parameters.model, &self.mmproj];
        targets.extend(self.download_files.iter().map(|f| f.filename.as_str()));

        for target in targets {
            if target.is_empty() {
                continue;
            }
            if target.starts_with(std::path::MAIN_SEPARATOR) || target.contains("..") {
                return Err(Error::InvalidConfig(format!(
                    "invalid file path: {}",
                    target
                )));
            }
        }

        if !self.backend.is_empty()
            && !self
                .backend
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::InvalidConfig(format!(
                "invalid backend name: {}",
                self.backend
            )));
        }

        Ok(())
    }

    pub fn is_model_url(&self) -> bool {
        looks_like_url(&self.parameters.model)
    }

    pub fn is_mmproj_url(&self) -> bool {
        looks_like_url(&self.mmproj)
    }

    /// Weights filename on disk. For URL-valued models this is derived from
    /// the URL's final path segment.
    pub fn model_file_name(&self) -> String {
        file_name_for(&self.parameters.model)
    }

    pub fn mmproj_file_name(&self) -> String {
        file_name_for(&self.mmproj)
    }

    pub fn has_template(&self) -> bool {
        !self.template.is_empty()
    }

    /// Declared usecase mask, `None` when the config declares nothing.
    pub fn declared_usecases(&self) -> Option<Usecase> {
        Usecase::from_names(&self.known_usecases)
    }

    /// True iff the declared set covers `wanted`, or the heuristic does.
    pub fn has_usecases(&self, wanted: Usecase) -> bool {
        if let Some(declared) = self.declared_usecases() {
            if declared.covers(wanted) {
                return true;
            }
        }
        self.guess_usecases(wanted)
    }

    /// Heuristic capability check for configs that do not declare their
    /// usecases. The backend may not be loaded yet, so this inspects the
    /// config shape only.
    pub fn guess_usecases(&self, wanted: Usecase) -> bool {
        if wanted.covers(Usecase::CHAT)
            && self.template.chat.is_empty()
            && self.template.chat_message.is_empty()
            && !self.template.use_tokenizer_template
        {
            return false;
        }
        if wanted.covers(Usecase::COMPLETION) && self.template.completion.is_empty() {
            return false;
        }
        if wanted.covers(Usecase::EDIT) && self.template.edit.is_empty() {
            return false;
        }
        if wanted.covers(Usecase::EMBEDDINGS) && self.embeddings != Some(true) {
            return false;
        }
        if wanted.covers(Usecase::IMAGE) {
            let image_backends = ["diffusers", "stablediffusion", "stablediffusion-ggml"];
            if !image_backends.contains(&self.backend.as_str()) {
                return false;
            }
            if self.backend == "diffusers" && self.diffusers.pipeline_type.is_empty() {
                return false;
            }
        }
        if wanted.covers(Usecase::VIDEO) {
            let video_backends = ["diffusers", "stablediffusion"];
            if !video_backends.contains(&self.backend.as_str()) {
                return false;
            }
            if self.backend == "diffusers" && self.diffusers.pipeline_type.is_empty() {
                return false;
            }
        }
        if wanted.covers(Usecase::RERANK) && self.backend != "rerankers" {
            return false;
        }
        if wanted.covers(Usecase::TRANSCRIPT) && self.backend != "whisper" {
            return false;
        }
        if wanted.covers(Usecase::TTS) {
            let tts_backends = ["bark-cpp", "piper", "transformers-musicgen"];
            if !tts_backends.contains(&self.backend.as_str()) {
                return false;
            }
        }
        if wanted.covers(Usecase::SOUND_GENERATION) && self.backend != "transformers-musicgen" {
            return false;
        }
        if wanted.covers(Usecase::TOKENIZE) {
            let tokenize_backends = ["llama.cpp", "rwkv"];
            if !tokenize_backends.contains(&self.backend.as_str()) {
                return false;
            }
        }
        if wanted.covers(Usecase::VAD) && self.backend != "silero-vad" {
            return false;
        }
        if wanted.covers(Usecase::DETECTION) && self.backend != "rfdetr" {
            return false;
        }
        true
    }

    /// Normalize `known_usecases` to the canonical names of everything the
    /// config can actually serve.
    pub fn sync_known_usecases(&mut self) {
        let mut names = Vec::new();
        for (name, flag) in Usecase::NAMED {
            if name == "llm" {
                continue;
            }
            if self.has_usecases(flag) {
                names.push(name.to_string());
            }
        }
        self.known_usecases = names;
    }

    /// Assemble the `LoadModel` options for this config.
    pub fn to_model_options(&self, models_path: &std::path::Path) -> modelgate_common::ModelOptions {
        modelgate_common::ModelOptions {
            model: self.model_file_name(),
            model_path: models_path
                .join(self.model_file_name())
                .to_string_lossy()
                .into_owned(),
            context_size: self.context_size,
            threads: self.threads,
            f16: self.f16,
            gpu_layers: self.gpu_layers,
            mmap: self.mmap,
            mmlock: self.mmlock,
            low_vram: self.low_vram,
            embeddings: self.embeddings,
            mm_proj: if self.mmproj.is_empty() {
                None
            } else {
                Some(self.mmproj_file_name())
            },
            seed: self.parameters.seed,
            options: self.options.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

fn looks_like_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

fn file_name_for(s: &str) -> String {
    if !looks_like_url(s) {
        return s.to_string();
    }
    s.rsplit('/')
        .next()
        .map(|seg| seg.split(['?', '#']).next().unwrap_or(seg))
        .unwrap_or(s)
        .to_string()
}
