//! Application state management

use std::sync::Arc;

use crate::config::{Config, StorageConfig};
use crate::storage::FileServer;
use crate::upload::UploadCoordinator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    storage: Arc<StorageConfig>,
    coordinator: UploadCoordinator,
    file_server: FileServer,
}

impl AppState {
    /// Create a new application state. Nothing touches the disk until
    /// [`AppState::prepare`].
    pub fn new(config: Config) -> Self {
        let storage = Arc::new(config.storage.clone());
        let coordinator = UploadCoordinator::new(storage.clone(), &config.upload);
        let file_server = FileServer::new(storage.clone());

        Self {
            inner: Arc::new(AppStateInner {
                config,
                storage,
                coordinator,
                file_server,
            }),
        }
    }

    /// Create the storage tree and load the deduplication index.
    pub async fn prepare(&self) -> std::io::Result<()> {
        let storage = &self.inner.storage;
        tokio::fs::create_dir_all(storage.chunks_dir()).await?;
        tokio::fs::create_dir_all(storage.files_dir()).await?;

        let entries = self.inner.coordinator.dedup().bootstrap().await;
        tracing::info!(
            root = %storage.root.display(),
            dedup_entries = entries,
            "Storage ready"
        );
        Ok(())
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the upload coordinator
    pub fn coordinator(&self) -> &UploadCoordinator {
        &self.inner.coordinator
    }

    pub fn file_server(&self) -> &FileServer {
        &self.inner.file_server
    }
}
