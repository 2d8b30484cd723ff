use crate::domains::sync::transport::SyncTransport;
use crate::domains::sync::types::{AppData, CancellationToken, SyncBackendKind};
use crate::domains::sync::utils::{
    encode_document, parse_document, DOCUMENT_NAME, LEGACY_DOCUMENT_NAME,
};
use crate::errors::{SyncError, SyncResult};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Directory-rooted backend for file shares and locally mounted folders.
///
/// `content://` roots belong to the mobile shells: Android resolves them
/// through the Storage Access Framework and provides its own transport
/// behind the same trait.
pub struct FileTransport {
    root: PathBuf,
}

impl FileTransport {
    pub fn new(path: &str, data_root: &Path) -> SyncResult<Self> {
        if path.starts_with("content://") {
            return Err(SyncError::Configuration(
                "content:// sync paths require the platform file provider".to_string(),
            ));
        }

        let root = if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            data_root.join(path)
        };

        std::fs::create_dir_all(&root).map_err(|e| {
            SyncError::Configuration(format!(
                "cannot create sync directory {}: {}",
                root.display(),
                e
            ))
        })?;

        Ok(Self { root })
    }

    /// Resolve a remote-relative key beneath the root, rejecting any
    /// segment that could climb out of it.
    fn resolve(&self, key: &str) -> SyncResult<PathBuf> {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
                return Err(SyncError::Other(format!("invalid remote key: {}", key)));
            }
            path.push(segment);
        }
        Ok(path)
    }

    async fn read_if_present(&self, name: &str) -> SyncResult<Option<Vec<u8>>> {
        match fs::read(self.root.join(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(e)),
        }
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> SyncResult<()> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SyncError::Other(format!("invalid target path: {}", path.display())))?;
        let tmp = path.with_file_name(format!(".{}.tmp", file_name));

        fs::write(&tmp, bytes).await.map_err(io_error)?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_error(e));
        }
        Ok(())
    }
}

fn io_error(e: io::Error) -> SyncError {
    SyncError::Other(format!("file backend I/O error: {}", e))
}

#[async_trait]
impl SyncTransport for FileTransport {
    fn kind(&self) -> SyncBackendKind {
        SyncBackendKind::File
    }

    async fn read_document(&self, cancel: &CancellationToken) -> SyncResult<Option<AppData>> {
        cancel.check()?;
        let bytes = match self.read_if_present(DOCUMENT_NAME).await? {
            Some(bytes) => bytes,
            None => match self.read_if_present(LEGACY_DOCUMENT_NAME).await? {
                Some(bytes) => bytes,
                None => return Ok(None),
            },
        };
        parse_document(&bytes).map(Some)
    }

    async fn write_document(&self, data: &AppData, cancel: &CancellationToken) -> SyncResult<()> {
        cancel.check()?;
        let bytes = encode_document(data)?;
        self.write_atomic(&self.root.join(DOCUMENT_NAME), &bytes).await
    }

    async fn get_file(&self, key: &str, cancel: &CancellationToken) -> SyncResult<Vec<u8>> {
        cancel.check()?;
        let path = self.resolve(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(SyncError::RemoteMissing(key.to_string()))
            }
            Err(e) => Err(io_error(e)),
        }
    }

    async fn put_file(
        &self,
        key: &str,
        bytes: &[u8],
        _mime_type: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        cancel.check()?;
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        self.write_atomic(&path, bytes).await
    }

    async fn delete_file(&self, key: &str, cancel: &CancellationToken) -> SyncResult<()> {
        cancel.check()?;
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(e)),
        }
    }

    async fn exists(&self, key: &str, cancel: &CancellationToken) -> SyncResult<bool> {
        cancel.check()?;
        let path = self.resolve(key)?;
        Ok(fs::metadata(&path).await.is_ok())
    }
}
