//! Shared application state.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::agent::AgentJobService;
use crate::backends::BackendRegistry;
use crate::config::Config;
use crate::gallery::GalleryService;
use crate::loader::ModelLoader;
use crate::model_config::ModelConfigLoader;
use crate::system::SystemState;
use crate::watchdog::WatchdogHandle;

/// Everything the handlers and the lifecycle code share. Constructed once
/// in `main` and passed down; there are no global access points.
pub struct AppState {
    pub config: std::sync::RwLock<Config>,
    pub system: Arc<SystemState>,
    pub registry: Arc<BackendRegistry>,
    pub config_loader: Arc<ModelConfigLoader>,
    pub model_loader: Arc<ModelLoader>,
    pub gallery: Arc<GalleryService>,
    pub agent: Arc<AgentJobService>,
    /// Handle of the currently running watchdog, if any; replaced on
    /// settings changes that require a restart.
    pub watchdog: Mutex<Option<WatchdogHandle>>,
    /// Application-wide shutdown signal observed by every long-lived task.
    pub shutdown_rx: watch::Receiver<bool>,
}
