//! Gallery service: serialized installer/deleter for models and backends.
//!
//! All writes under the models and backends directories funnel through two
//! buffered channels, one worker each, so file-system effects are totally
//! ordered per kind. Job status lives in a shared map keyed by UUID which
//! consumers poll; an op-cache maps element names to their current job so
//! the UI shows at most one in-flight operation per element.

mod backends;
mod models;

pub use backends::{delete_backend, install_backend};
pub use models::{delete_model, install_model, resolve_gallery_element};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use modelgate_common::gallery::GallerySource;

use crate::backends::BackendRegistry;
use crate::error::{Error, Result};
use crate::loader::ModelLoader;
use crate::model_config::{LoadDefaults, ModelConfigLoader};
use crate::system::SystemState;

const QUEUE_CAPACITY: usize = 64;

/// Status of one gallery job, polled by UUID.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct GalleryOpStatus {
    pub deletion: bool,
    pub file_name: String,
    pub error: Option<String>,
    pub processed: bool,
    pub message: String,
    pub progress: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub gallery_element_name: String,
    pub cancelled: bool,
    pub cancellable: bool,
}

/// A queued model operation.
#[derive(Debug, Clone)]
pub struct ModelOp {
    pub id: String,
    /// `gallery@name`, a bare element name, or a manifest URL.
    pub element: String,
    pub delete: bool,
    pub overrides: HashMap<String, serde_yaml::Value>,
}

/// A queued backend operation.
#[derive(Debug, Clone)]
pub struct BackendOp {
    pub id: String,
    pub element: String,
    pub delete: bool,
    /// Direct archive location bypassing gallery resolution.
    pub external_uri: String,
}

/// Shared context handed to the operation handlers.
pub struct GalleryContext {
    pub system: Arc<SystemState>,
    pub config_loader: Arc<ModelConfigLoader>,
    pub model_loader: Arc<ModelLoader>,
    pub registry: Arc<BackendRegistry>,
    pub galleries: Vec<GallerySource>,
    pub backend_galleries: Vec<GallerySource>,
    pub autoload_backend_galleries: bool,
    pub load_defaults: LoadDefaults,
    pub http: reqwest::Client,
}

pub struct GalleryService {
    ctx: Arc<GalleryContext>,
    model_tx: mpsc::Sender<ModelOp>,
    backend_tx: mpsc::Sender<BackendOp>,
    model_rx: Mutex<Option<mpsc::Receiver<ModelOp>>>,
    backend_rx: Mutex<Option<mpsc::Receiver<BackendOp>>>,
    statuses: StdMutex<HashMap<String, TrackedStatus>>,
    /// element name -> current job UUID.
    op_cache: StdMutex<HashMap<String, String>>,
    cancellations: StdMutex<HashMap<String, Arc<AtomicBool>>>,
    /// Completed op-cache entries older than this are pruned; `None`
    /// retains them indefinitely.
    op_cache_ttl: StdMutex<Option<Duration>>,
}

struct TrackedStatus {
    status: GalleryOpStatus,
    updated_at: Instant,
}

impl GalleryService {
    pub fn new(ctx: GalleryContext) -> Arc<Self> {
        let (model_tx, model_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (backend_tx, backend_rx) = mpsc::channel(QUEUE_CAPACITY);
        Arc::new(Self {
            ctx: Arc::new(ctx),
            model_tx,
            backend_tx,
            model_rx: Mutex::new(Some(model_rx)),
            backend_rx: Mutex::new(Some(backend_rx)),
            statuses: StdMutex::new(HashMap::new()),
            op_cache: StdMutex::new(HashMap::new()),
            cancellations: StdMutex::new(HashMap::new()),
            op_cache_ttl: StdMutex::new(None),
        })
    }

    /// Retain completed op-cache entries only for `ttl`.
    pub fn set_op_cache_ttl(&self, ttl: Option<Duration>) {
        *self.op_cache_ttl.lock().unwrap() = ttl;
    }

    /// Enqueue a model install. Fails fast with `QueueFull` so the HTTP
    /// layer can 503 instead of blocking.
    pub fn install_model(
        &self,
        element: &str,
        overrides: HashMap<String, serde_yaml::Value>,
    ) -> Result<String> {
        self.enqueue_model(ModelOp {
            id: Uuid::new_v4().to_string(),
            element: element.to_string(),
            delete: false,
            overrides,
        })
    }

    pub fn delete_model(&self, name: &str) -> Result<String> {
        self.enqueue_model(ModelOp {
            id: Uuid::new_v4().to_string(),
            element: name.to_string(),
            delete: true,
            overrides: HashMap::new(),
        })
    }

    pub fn install_backend(&self, element: &str, external_uri: &str) -> Result<String> {
        self.enqueue_backend(BackendOp {
            id: Uuid::new_v4().to_string(),
            element: element.to_string(),
            delete: false,
            external_uri: external_uri.to_string(),
        })
    }

    pub fn delete_backend(&self, name: &str) -> Result<String> {
        self.enqueue_backend(BackendOp {
            id: Uuid::new_v4().to_string(),
            element: name.to_string(),
            delete: true,
            external_uri: String::new(),
        })
    }

    fn enqueue_model(&self, op: ModelOp) -> Result<String> {
        let id = op.id.clone();
        self.register_enqueued(&id, &op.element, op.delete);
        self.model_tx.try_send(op).map_err(|e| {
            self.drop_tracking(&id);
            Error::QueueFull(format!("model gallery queue: {}", e))
        })?;
        Ok(id)
    }

    fn enqueue_backend(&self, op: BackendOp) -> Result<String> {
        let id = op.id.clone();
        self.register_enqueued(&id, &op.element, op.delete);
        self.backend_tx.try_send(op).map_err(|e| {
            self.drop_tracking(&id);
            Error::QueueFull(format!("backend gallery queue: {}", e))
        })?;
        Ok(id)
    }

    fn register_enqueued(&self, id: &str, element: &str, deletion: bool) {
        self.update_status(
            id,
            GalleryOpStatus {
                deletion,
                message: "pending".to_string(),
                gallery_element_name: element.to_string(),
                cancellable: true,
                ..Default::default()
            },
        );
        self.op_cache
            .lock()
            .unwrap()
            .insert(element.to_string(), id.to_string());
        self.cancellations
            .lock()
            .unwrap()
            .insert(id.to_string(), Arc::new(AtomicBool::new(false)));
    }

    fn drop_tracking(&self, id: &str) {
        self.statuses.lock().unwrap().remove(id);
        self.cancellations.lock().unwrap().remove(id);
        self.op_cache.lock().unwrap().retain(|_, v| v != id);
    }

    pub fn update_status(&self, id: &str, status: GalleryOpStatus) {
        let mut statuses = self.statuses.lock().unwrap();
        statuses.insert(
            id.to_string(),
            TrackedStatus {
                status,
                updated_at: Instant::now(),
            },
        );

        let ttl = *self.op_cache_ttl.lock().unwrap();
        if let Some(ttl) = ttl {
            let expired: Vec<String> = statuses
                .iter()
                .filter(|(_, t)| t.status.processed && t.updated_at.elapsed() > ttl)
                .map(|(k, _)| k.clone())
                .collect();
            let mut op_cache = self.op_cache.lock().unwrap();
            for id in expired {
                statuses.remove(&id);
                op_cache.retain(|_, v| *v != id);
            }
        }
    }

    pub fn get_status(&self, id: &str) -> Option<GalleryOpStatus> {
        self.statuses
            .lock()
            .unwrap()
            .get(id)
            .map(|t| t.status.clone())
    }

    pub fn all_statuses(&self) -> HashMap<String, GalleryOpStatus> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .map(|(k, t)| (k.clone(), t.status.clone()))
            .collect()
    }

    /// Current job UUID for a gallery element, if one is tracked.
    pub fn op_for_element(&self, element: &str) -> Option<String> {
        self.op_cache.lock().unwrap().get(element).cloned()
    }

    /// Request cancellation of a job. The worker observes the flag at the
    /// next inter-step boundary.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let cancellations = self.cancellations.lock().unwrap();
        match cancellations.get(id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
            None => Err(Error::NotFound(format!("no cancellable operation {}", id))),
        }
    }

    fn cancel_flag(&self, id: &str) -> Arc<AtomicBool> {
        self.cancellations
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_else(|| Arc::new(AtomicBool::new(false)))
    }

    /// Start both workers. Each drains its own channel FIFO; a worker
    /// returns when the application shutdown signal flips.
    pub async fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut model_rx = self
            .model_rx
            .lock()
            .await
            .take()
            .expect("gallery service started twice");
        let mut backend_rx = self
            .backend_rx
            .lock()
            .await
            .take()
            .expect("gallery service started twice");

        let service = self.clone();
        let mut model_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = model_shutdown.changed() => return,
                    op = model_rx.recv() => {
                        let Some(op) = op else { return };
                        service.run_model_op(op).await;
                    }
                }
            }
        });

        let service = self.clone();
        let mut backend_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = backend_shutdown.changed() => return,
                    op = backend_rx.recv() => {
                        let Some(op) = op else { return };
                        service.run_backend_op(op).await;
                    }
                }
            }
        });
    }

    async fn run_model_op(&self, op: ModelOp) {
        let cancel = self.cancel_flag(&op.id);
        if self.finish_if_cancelled(&op.id, &op.element, op.delete, &cancel) {
            return;
        }

        self.update_status(
            &op.id,
            GalleryOpStatus {
                deletion: op.delete,
                message: format!("processing model: {}", op.element),
                gallery_element_name: op.element.clone(),
                cancellable: true,
                ..Default::default()
            },
        );

        let outcome = if op.delete {
            models::delete_model(&self.ctx, &op.element).await
        } else {
            models::install_model(self, &op, &cancel).await
        };

        match outcome {
            Ok(()) => {
                self.update_status(
                    &op.id,
                    GalleryOpStatus {
                        deletion: op.delete,
                        processed: true,
                        message: "completed".to_string(),
                        progress: 100.0,
                        gallery_element_name: op.element.clone(),
                        ..Default::default()
                    },
                );
            }
            Err(e) if cancel.load(Ordering::SeqCst) => {
                tracing::info!(element = %op.element, "model operation cancelled");
                let _ = e;
                self.mark_cancelled(&op.id, &op.element, op.delete);
            }
            Err(e) => {
                tracing::error!(element = %op.element, error = %e, "model operation failed");
                self.update_status(
                    &op.id,
                    GalleryOpStatus {
                        deletion: op.delete,
                        processed: true,
                        error: Some(e.to_string()),
                        message: format!("error: {}", e),
                        gallery_element_name: op.element.clone(),
                        ..Default::default()
                    },
                );
            }
        }
        self.cancellations.lock().unwrap().remove(&op.id);
    }

    async fn run_backend_op(&self, op: BackendOp) {
        let cancel = self.cancel_flag(&op.id);
        if self.finish_if_cancelled(&op.id, &op.element, op.delete, &cancel) {
            return;
        }

        self.update_status(
            &op.id,
            GalleryOpStatus {
                deletion: op.delete,
                message: format!("processing backend: {}", op.element),
                gallery_element_name: op.element.clone(),
                cancellable: true,
                ..Default::default()
            },
        );

        let outcome = if op.delete {
            backends::delete_backend(&self.ctx, &op.element).await
        } else {
            backends::install_backend(self, &op, &cancel).await
        };

        match outcome {
            Ok(()) => {
                self.update_status(
                    &op.id,
                    GalleryOpStatus {
                        deletion: op.delete,
                        processed: true,
                        message: "completed".to_string(),
                        progress: 100.0,
                        gallery_element_name: op.element.clone(),
                        ..Default::default()
                    },
                );
            }
            Err(e) if cancel.load(Ordering::SeqCst) => {
                let _ = e;
                self.mark_cancelled(&op.id, &op.element, op.delete);
            }
            Err(e) => {
                tracing::error!(element = %op.element, error = %e, "backend operation failed");
                self.update_status(
                    &op.id,
                    GalleryOpStatus {
                        deletion: op.delete,
                        processed: true,
                        error: Some(e.to_string()),
                        message: format!("error: {}", e),
                        gallery_element_name: op.element.clone(),
                        ..Default::default()
                    },
                );
            }
        }
        self.cancellations.lock().unwrap().remove(&op.id);
    }

    fn finish_if_cancelled(
        &self,
        id: &str,
        element: &str,
        deletion: bool,
        cancel: &AtomicBool,
    ) -> bool {
        if cancel.load(Ordering::SeqCst) {
            self.mark_cancelled(id, element, deletion);
            self.cancellations.lock().unwrap().remove(id);
            true
        } else {
            false
        }
    }

    fn mark_cancelled(&self, id: &str, element: &str, deletion: bool) {
        self.update_status(
            id,
            GalleryOpStatus {
                deletion,
                processed: true,
                cancelled: true,
                message: "cancelled".to_string(),
                gallery_element_name: element.to_string(),
                ..Default::default()
            },
        );
    }

    pub(crate) fn context(&self) -> &Arc<GalleryContext> {
        &self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::LoaderSettings;
    use crate::test_util::test_system;

    fn service() -> (tempfile::TempDir, Arc<GalleryService>) {
        let (tmp, system) = test_system();
        let registry = Arc::new(BackendRegistry::new(system.clone()));
        let config_loader = Arc::new(ModelConfigLoader::new(system.clone()));
        let model_loader = Arc::new(ModelLoader::new(
            registry.clone(),
            LoaderSettings::default(),
        ));
        let svc = GalleryService::new(GalleryContext {
            system,
            config_loader,
            model_loader,
            registry,
            galleries: vec![],
            backend_galleries: vec![],
            autoload_backend_galleries: false,
            load_defaults: LoadDefaults::default(),
            http: reqwest::Client::new(),
        });
        (tmp, svc)
    }

    #[tokio::test]
    async fn test_enqueue_tracks_status_and_op_cache() {
        let (_tmp, svc) = service();
        let id = svc.install_model("main@bert", HashMap::new()).unwrap();

        let status = svc.get_status(&id).unwrap();
        assert!(!status.processed);
        assert_eq!(status.gallery_element_name, "main@bert");
        assert_eq!(svc.op_for_element("main@bert"), Some(id));
    }

    #[tokio::test]
    async fn test_queue_full_fails_fast() {
        let (_tmp, svc) = service();
        // The worker never starts, so the channel fills up.
        let mut last = Ok(String::new());
        for i in 0..QUEUE_CAPACITY + 1 {
            last = svc.install_model(&format!("m{}", i), HashMap::new());
        }
        assert!(matches!(last, Err(Error::QueueFull(_))));
    }

    #[tokio::test]
    async fn test_cancel_before_processing() {
        let (_tmp, svc) = service();
        let id = svc.install_model("main@bert", HashMap::new()).unwrap();
        svc.cancel(&id).unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        svc.start(shutdown_rx).await;

        // The worker drains the op and marks it cancelled without running.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(status) = svc.get_status(&id) {
                    if status.processed {
                        assert!(status.cancelled);
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_unknown_id() {
        let (_tmp, svc) = service();
        assert!(svc.cancel("nope").is_err());
    }
}
