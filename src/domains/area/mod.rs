pub mod repository;
pub mod types;

pub use repository::SqliteAreaRepository;
pub use types::Area;
