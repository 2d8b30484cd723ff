pub mod types;

pub use types::{Attachment, AttachmentKind, LocalStatus};
