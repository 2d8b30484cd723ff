use crate::errors::{DomainResult, ValidationError};
use crate::validation::{Validate, ValidationBuilder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What an attachment points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    /// Binary payload synced through the blob store.
    File,
    /// External URL; nothing to transfer.
    Link,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::File => "file",
            AttachmentKind::Link => "link",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "file" => Some(AttachmentKind::File),
            "link" => Some(AttachmentKind::Link),
            _ => None,
        }
    }
}

/// Whether the attachment's bytes are present on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LocalStatus {
    Available,
    #[default]
    Missing,
}

impl LocalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalStatus::Available => "available",
            LocalStatus::Missing => "missing",
        }
    }
}

/// Attachment child record, owned by a task or project and addressed by
/// (parent id, attachment id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub kind: AttachmentKind,
    pub title: String,
    /// Device-local path for files, target URL for links.
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Hex SHA-256 of the blob bytes, recorded at upload time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    /// Remote-relative blob path under `attachments/`. Assigned once at
    /// first upload and immutable afterwards.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_key: Option<String>,
    #[serde(default)]
    pub local_status: LocalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Attachment {
    pub fn is_file(&self) -> bool {
        self.kind == AttachmentKind::File
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// A file attachment the engine should consider for transfer.
    pub fn is_live_file(&self) -> bool {
        self.is_file() && !self.is_deleted()
    }

    /// Extension for the remote blob name: taken from the title when it has
    /// one, else from the URI. Lowercased, a dot plus at most 8
    /// alphanumerics; anything else yields no extension.
    pub fn derive_extension(&self) -> String {
        extension_of(&self.title)
            .or_else(|| extension_of(&self.uri))
            .map(|ext| format!(".{}", ext))
            .unwrap_or_default()
    }

    /// `<attachmentId><ext>` — the blob's file name, identical locally and
    /// remotely.
    pub fn blob_file_name(&self) -> String {
        format!("{}{}", self.id, self.derive_extension())
    }

    /// The cloud key this attachment gets when first uploaded.
    pub fn expected_cloud_key(&self) -> String {
        format!("attachments/{}", self.blob_file_name())
    }
}

fn extension_of(name: &str) -> Option<String> {
    // Query strings and fragments would otherwise leak into URL-derived
    // extensions.
    let trimmed = name.split(['?', '#']).next().unwrap_or(name);
    let after_dot = trimmed.rsplit_once('.')?.1;
    if after_dot.is_empty()
        || after_dot.len() > 8
        || !after_dot.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(after_dot.to_ascii_lowercase())
}

impl Validate for Attachment {
    fn validate(&self) -> DomainResult<()> {
        ValidationBuilder::new("id", Some(self.id.clone()))
            .required()
            .max_length(128)
            .validate()?;

        ValidationBuilder::new("title", Some(self.title.clone()))
            .max_length(500)
            .validate()?;

        if let Some(hash) = &self.file_hash {
            ValidationBuilder::new("fileHash", Some(hash.clone()))
                .sha256_hex()
                .validate()?;
        }

        if let Some(key) = &self.cloud_key {
            if !key.starts_with("attachments/") {
                return Err(ValidationError::invalid_value(
                    "cloudKey",
                    "must be a remote-relative path under attachments/",
                )
                .into());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(title: &str, uri: &str) -> Attachment {
        let now = Utc::now();
        Attachment {
            id: "A1".to_string(),
            kind: AttachmentKind::File,
            title: title.to_string(),
            uri: uri.to_string(),
            mime_type: None,
            size: None,
            file_hash: None,
            cloud_key: None,
            local_status: LocalStatus::Missing,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn extension_from_title() {
        assert_eq!(attachment("report.PDF", "/x/y").blob_file_name(), "A1.pdf");
    }

    #[test]
    fn extension_falls_back_to_uri() {
        let a = attachment("no extension here", "/files/photo.jpeg?v=2");
        assert_eq!(a.blob_file_name(), "A1.jpeg");
    }

    #[test]
    fn overlong_or_odd_extensions_dropped() {
        assert_eq!(attachment("archive.tarzstd9x", "x").blob_file_name(), "A1");
        assert_eq!(attachment("weird.p df", "x").blob_file_name(), "A1");
        assert_eq!(attachment("trailingdot.", "x").blob_file_name(), "A1");
    }

    #[test]
    fn cloud_key_shape() {
        assert_eq!(
            attachment("a.png", "x").expected_cloud_key(),
            "attachments/A1.png"
        );
    }

    #[test]
    fn rejects_foreign_cloud_key() {
        let mut a = attachment("a.png", "x");
        a.cloud_key = Some("../../etc/passwd".to_string());
        assert!(a.validate().is_err());
        a.cloud_key = Some("attachments/A1.png".to_string());
        assert!(a.validate().is_ok());
    }
}
