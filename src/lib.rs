// Public modules
pub mod database;
pub mod domains;
pub mod errors;
pub mod types;
pub mod validation;

// Private modules
mod db_migration;

use crate::domains::store::DataStore;
use crate::domains::sync::SyncOrchestrator;
use crate::errors::{DomainError, ServiceError, ServiceResult};
use std::path::Path;
use std::sync::Arc;

pub use crate::domains::sync::{AppData, MergeStats, SyncBackendKind, SyncConfig, SyncOutcome};
pub use crate::domains::sync::service::SyncService;

/// The wired-up core handed to an app shell: the store owning the local
/// dataset and the orchestrator driving sync cycles against it.
pub struct AppCore {
    pub store: Arc<DataStore>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

/// Initialize the core under a data-root directory: open (or create) the
/// SQLite database, run migrations, and wire the store and sync
/// orchestrator. Call once per process before anything else.
pub async fn initialize(data_root: &Path) -> ServiceResult<AppCore> {
    std::fs::create_dir_all(data_root)
        .map_err(|e| ServiceError::Configuration(format!("cannot create data root: {}", e)))?;

    let pool = crate::database::create_pool_at(data_root)
        .await
        .map_err(DomainError::from)?;
    db_migration::initialize_database(&pool)
        .await
        .map_err(DomainError::from)?;

    let store = Arc::new(DataStore::new(pool));
    let orchestrator = Arc::new(
        SyncOrchestrator::new(store.clone(), data_root.to_path_buf()).map_err(|e| {
            ServiceError::Configuration(format!("cannot create attachment storage: {}", e))
        })?,
    );

    Ok(AppCore { store, orchestrator })
}
