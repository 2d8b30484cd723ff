pub mod engine;
pub mod merger;
pub mod service;
pub mod transport;
pub mod types;
pub mod utils;

pub use service::{SyncOrchestrator, SyncService};
pub use types::{AppData, MergeStats, SyncBackendKind, SyncConfig, SyncOutcome};
