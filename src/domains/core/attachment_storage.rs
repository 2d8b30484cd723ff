use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum AttachmentStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Blob not found: {0}")]
    NotFound(String),
    #[error("Invalid blob name: {0}")]
    InvalidName(String),
    #[error("Storage error: {0}")]
    Other(String),
}

pub type AttachmentStorageResult<T> = Result<T, AttachmentStorageError>;

/// Owner of the local content-addressed blob directory (`attachments/`
/// under the app data root). Every blob is named `<attachmentId><ext>`.
///
/// Writes are staged to a temp path in the same directory and renamed into
/// place, so a crash mid-write never exposes a partial blob.
pub struct AttachmentStorage {
    base_path: PathBuf,
}

impl AttachmentStorage {
    /// Creates the storage rooted at `<data_root>/attachments`, ensuring the
    /// directory exists.
    pub fn new(data_root: &Path) -> io::Result<Self> {
        let base_path = data_root.join("attachments");
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Rejects path separators and dot-navigation so a blob name from a
    /// remote document can never escape the attachments directory.
    fn sanitize_name(name: &str) -> AttachmentStorageResult<&str> {
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name == "."
            || name == ".."
        {
            return Err(AttachmentStorageError::InvalidName(name.to_string()));
        }
        Ok(name)
    }

    /// Absolute path of a blob by file name.
    pub fn blob_path(&self, file_name: &str) -> AttachmentStorageResult<PathBuf> {
        Ok(self.base_path.join(Self::sanitize_name(file_name)?))
    }

    pub async fn exists(&self, file_name: &str) -> AttachmentStorageResult<bool> {
        let path = self.blob_path(file_name)?;
        Ok(fs::metadata(&path).await.is_ok())
    }

    pub async fn file_size(&self, file_name: &str) -> AttachmentStorageResult<u64> {
        let path = self.blob_path(file_name)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(AttachmentStorageError::NotFound(file_name.to_string()))
            }
            Err(e) => Err(AttachmentStorageError::Io(e)),
        }
    }

    pub async fn read_blob(&self, file_name: &str) -> AttachmentStorageResult<Vec<u8>> {
        let path = self.blob_path(file_name)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(AttachmentStorageError::NotFound(file_name.to_string()))
            }
            Err(e) => Err(AttachmentStorageError::Io(e)),
        }
    }

    /// Atomic write: temp file in the same directory, then rename.
    pub async fn write_blob(&self, file_name: &str, data: &[u8]) -> AttachmentStorageResult<()> {
        let final_path = self.blob_path(file_name)?;
        let tmp_path = self.base_path.join(format!(".{}.tmp", file_name));

        fs::write(&tmp_path, data).await?;
        if let Err(e) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(AttachmentStorageError::Io(e));
        }
        Ok(())
    }

    /// Delete a blob; a missing file counts as success.
    pub async fn delete_blob(&self, file_name: &str) -> AttachmentStorageResult<()> {
        let path = self.blob_path(file_name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AttachmentStorageError::Io(e)),
        }
    }

    /// File names of every blob currently on disk. Temp staging files are
    /// skipped.
    pub async fn list_blobs(&self) -> AttachmentStorageResult<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with('.') {
                    continue;
                }
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}

/// Lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_read_delete_roundtrip() {
        let dir = TempDir::new().unwrap();
        let storage = AttachmentStorage::new(dir.path()).unwrap();

        storage.write_blob("a1.pdf", b"hello").await.unwrap();
        assert!(storage.exists("a1.pdf").await.unwrap());
        assert_eq!(storage.read_blob("a1.pdf").await.unwrap(), b"hello");
        assert_eq!(storage.file_size("a1.pdf").await.unwrap(), 5);

        storage.delete_blob("a1.pdf").await.unwrap();
        assert!(!storage.exists("a1.pdf").await.unwrap());
        // Deleting again is still success.
        storage.delete_blob("a1.pdf").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let storage = AttachmentStorage::new(dir.path()).unwrap();

        assert!(storage.blob_path("../evil").is_err());
        assert!(storage.blob_path("a/b").is_err());
        assert!(storage.blob_path("").is_err());
    }

    #[tokio::test]
    async fn list_blobs_skips_temp_files() {
        let dir = TempDir::new().unwrap();
        let storage = AttachmentStorage::new(dir.path()).unwrap();

        storage.write_blob("a1.pdf", b"x").await.unwrap();
        storage.write_blob("a2.png", b"y").await.unwrap();
        tokio::fs::write(storage.base_path().join(".a3.tmp"), b"z")
            .await
            .unwrap();

        let mut names = storage.list_blobs().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["a1.pdf", "a2.png"]);
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
