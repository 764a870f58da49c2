use std::sync::Arc;

use tracing::debug;

use arca_storage::{Backend, StorageConfig};
use arca_types::error::Result;
use arca_types::Handle;

use crate::config::RepositoryConfig;

/// Backend settings (URL and retry policy) taken from the `repository:` section.
pub fn storage_config_from_repo(cfg: &RepositoryConfig) -> StorageConfig {
    StorageConfig {
        url: cfg.url.clone(),
        retry: cfg.retry.clone(),
    }
}

/// Open the repository described by `cfg`.
pub fn open_repo(cfg: &RepositoryConfig) -> Result<Arc<dyn Backend>> {
    let backend = arca_storage::open_backend(&storage_config_from_repo(cfg))?;
    Ok(Arc::from(backend))
}

/// Create the repository described by `cfg` and write its config object.
pub fn init_repo(cfg: &RepositoryConfig, config_blob: &[u8]) -> Result<Arc<dyn Backend>> {
    let backend = arca_storage::create_backend(&storage_config_from_repo(cfg))?;
    backend.save(&Handle::config(), config_blob)?;
    debug!(location = %backend.location(), "initialized repository");
    Ok(Arc::from(backend))
}
