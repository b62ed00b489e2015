//! Shared application context handed to every request handler.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::blobs::BlobStore;
use crate::bridge::ExecutionBridge;
use crate::config::ServerConfig;
use crate::coordinator::CoordinatorRegistry;
use crate::jobs::Job;
use crate::permissions::PermissionResolver;
use crate::persistence::PersistCommand;

pub struct AppContext {
    pub config: ServerConfig,
    pub db_path: PathBuf,
    pub bridge: Arc<ExecutionBridge>,
    pub coordinators: Arc<CoordinatorRegistry>,
    pub resolver: Arc<PermissionResolver>,
    pub persist_tx: mpsc::Sender<PersistCommand>,
    pub job_tx: mpsc::Sender<Job>,
    pub blobs: BlobStore,
}

pub type SharedContext = Arc<AppContext>;
