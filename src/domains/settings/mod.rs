pub mod repository;
pub mod types;

pub use repository::SqliteSettingsRepository;
pub use types::{Settings, SyncHistoryEntry, HISTORY_CAPACITY, RESERVED_OBJECT_KEYS};
