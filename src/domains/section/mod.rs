pub mod repository;
pub mod types;

pub use repository::SqliteSectionRepository;
pub use types::Section;
