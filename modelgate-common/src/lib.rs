//! ModelGate Common Types
//!
//! Shared types used by the gateway core services: usecase flags, the
//! backend control-plane protocol, the agent task/job schema and the
//! gallery element schema.

pub mod agent;
pub mod gallery;
pub mod protocol;
pub mod usecase;

pub use agent::{
    Job, JobStatus, JobTrace, JobsFile, ResultPush, Task, TasksFile,
};
pub use gallery::{BackendManifest, GalleryElement, GallerySource, RemoteFile};
pub use protocol::{
    BackendStatus, EmbeddingsRequest, EmbeddingsResponse, LoadModelRequest, ModelOptions,
    PredictRequest, PredictResponse, RpcResult, StatusResponse, TokenizeRequest,
    TokenizeResponse,
};
pub use usecase::Usecase;
