pub mod repository;
pub mod types;

pub use repository::{SqliteTaskRepository, TaskRepository};
pub use types::{ChecklistItem, Recurrence, Task, TaskStatus};
