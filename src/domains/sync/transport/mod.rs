pub mod cloud;
pub mod file;
pub mod webdav;

use crate::domains::sync::types::{AppData, CancellationToken, SyncBackendKind, SyncConfig};
use crate::errors::{SyncError, SyncResult};
use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub use cloud::CloudTransport;
pub use file::FileTransport;
pub use webdav::WebDavTransport;

/// Backend-agnostic access to the remote replica: the JSON document plus
/// the attachment blobs next to it. One instance serves one sync cycle's
/// configuration; every operation takes the cycle's cancellation token.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    fn kind(&self) -> SyncBackendKind;

    /// The remote document, or None when the remote is authoritatively
    /// empty (no file yet). Parse failures after sanitization surface as
    /// `SyncError::Parse`.
    async fn read_document(&self, cancel: &CancellationToken) -> SyncResult<Option<AppData>>;

    /// Replace the remote document. Atomic from a reader's perspective.
    async fn write_document(&self, data: &AppData, cancel: &CancellationToken) -> SyncResult<()>;

    /// Fetch a blob by remote-relative key (e.g. `attachments/A1.pdf`).
    async fn get_file(&self, key: &str, cancel: &CancellationToken) -> SyncResult<Vec<u8>>;

    /// Store a blob; idempotent.
    async fn put_file(
        &self,
        key: &str,
        bytes: &[u8],
        mime_type: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<()>;

    /// Remove a blob; deleting an absent key succeeds.
    async fn delete_file(&self, key: &str, cancel: &CancellationToken) -> SyncResult<()>;

    async fn exists(&self, key: &str, cancel: &CancellationToken) -> SyncResult<bool>;

    /// Upload size cap, when the backend has one.
    fn max_attachment_bytes(&self) -> Option<u64> {
        None
    }

    /// True while a rate-limit cooldown should keep attachment traffic off
    /// the wire.
    fn attachments_paused(&self) -> bool {
        false
    }
}

/// Retry schedule for transient transport failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Writes and deletes: 2 s base doubling to 30 s, five attempts.
    pub fn writes() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }

    /// One-shot reads get a shorter budget.
    pub fn reads() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.max_delay);
        // Jitter spreads concurrent clients that were rate limited together.
        let jitter_ms = rand::rng().random_range(0..=250);
        capped + Duration::from_millis(jitter_ms)
    }
}

/// Run `op` under the retry policy. Retries only errors classified as
/// retryable (timeouts, 5xx, 429); auth and configuration failures
/// surface immediately. Sleeps race the cancellation token.
pub async fn with_retries<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        cancel.check()?;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                log::debug!(
                    "sync: transient transport error (attempt {}/{}), retrying in {:?}: {}",
                    attempt + 1,
                    policy.max_attempts,
                    delay,
                    e
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Race a future against the cycle's cancellation token.
pub async fn cancellable<T, Fut>(cancel: &CancellationToken, fut: Fut) -> SyncResult<T>
where
    Fut: Future<Output = SyncResult<T>>,
{
    tokio::select! {
        result = fut => result,
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
    }
}

/// Build the transport for the validated configuration. `data_root` anchors
/// relative file-backend paths.
pub fn build_transport(
    config: &SyncConfig,
    data_root: &Path,
) -> SyncResult<Arc<dyn SyncTransport>> {
    config.validate()?;
    match config.backend {
        SyncBackendKind::Off => Ok(Arc::new(OffTransport)),
        SyncBackendKind::File => {
            let path = config.sync_path.as_deref().unwrap_or_default();
            Ok(Arc::new(FileTransport::new(path, data_root)?))
        }
        SyncBackendKind::Webdav => Ok(Arc::new(WebDavTransport::new(
            config.webdav_url.as_deref().unwrap_or_default(),
            config.webdav_username.as_deref(),
            config.webdav_password.as_deref(),
        )?)),
        SyncBackendKind::Cloud => Ok(Arc::new(CloudTransport::new(
            config.cloud_url.as_deref().unwrap_or_default(),
            config.cloud_token.as_deref().unwrap_or_default(),
        )?)),
    }
}

/// The disabled backend: reads see an empty remote, writes are rejected.
pub struct OffTransport;

#[async_trait]
impl SyncTransport for OffTransport {
    fn kind(&self) -> SyncBackendKind {
        SyncBackendKind::Off
    }

    async fn read_document(&self, _cancel: &CancellationToken) -> SyncResult<Option<AppData>> {
        Ok(None)
    }

    async fn write_document(&self, _data: &AppData, _cancel: &CancellationToken) -> SyncResult<()> {
        Err(SyncError::Configuration("sync backend is off".to_string()))
    }

    async fn get_file(&self, key: &str, _cancel: &CancellationToken) -> SyncResult<Vec<u8>> {
        Err(SyncError::RemoteMissing(key.to_string()))
    }

    async fn put_file(
        &self,
        _key: &str,
        _bytes: &[u8],
        _mime_type: &str,
        _cancel: &CancellationToken,
    ) -> SyncResult<()> {
        Err(SyncError::Configuration("sync backend is off".to_string()))
    }

    async fn delete_file(&self, _key: &str, _cancel: &CancellationToken) -> SyncResult<()> {
        Err(SyncError::Configuration("sync backend is off".to_string()))
    }

    async fn exists(&self, _key: &str, _cancel: &CancellationToken) -> SyncResult<bool> {
        Ok(false)
    }
}

/// In-memory transport for tests: a document slot plus a blob map.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryTransport {
        pub document: Mutex<Option<AppData>>,
        pub files: Mutex<HashMap<String, Vec<u8>>>,
        pub get_calls: AtomicUsize,
        pub write_calls: AtomicUsize,
        pub paused: AtomicBool,
        pub fail_document_writes: AtomicBool,
        pub reported_kind: Mutex<Option<SyncBackendKind>>,
    }

    impl MemoryTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reporting_as(self, kind: SyncBackendKind) -> Self {
            *self.reported_kind.lock().unwrap() = Some(kind);
            self
        }

        pub fn with_document(data: AppData) -> Self {
            let transport = Self::default();
            *transport.document.lock().unwrap() = Some(data);
            transport
        }

        pub fn put_blob(&self, key: &str, bytes: &[u8]) {
            self.files.lock().unwrap().insert(key.to_string(), bytes.to_vec());
        }

        pub fn blob(&self, key: &str) -> Option<Vec<u8>> {
            self.files.lock().unwrap().get(key).cloned()
        }

        pub fn remote_document(&self) -> Option<AppData> {
            self.document.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SyncTransport for MemoryTransport {
        fn kind(&self) -> SyncBackendKind {
            self.reported_kind
                .lock()
                .unwrap()
                .unwrap_or(SyncBackendKind::File)
        }

        async fn read_document(&self, cancel: &CancellationToken) -> SyncResult<Option<AppData>> {
            cancel.check()?;
            Ok(self.document.lock().unwrap().clone())
        }

        async fn write_document(
            &self,
            data: &AppData,
            cancel: &CancellationToken,
        ) -> SyncResult<()> {
            cancel.check()?;
            if self.fail_document_writes.load(Ordering::SeqCst) {
                return Err(SyncError::Transient("simulated write failure".to_string()));
            }
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            *self.document.lock().unwrap() = Some(data.clone());
            Ok(())
        }

        async fn get_file(&self, key: &str, cancel: &CancellationToken) -> SyncResult<Vec<u8>> {
            cancel.check()?;
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            self.files
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| SyncError::RemoteMissing(key.to_string()))
        }

        async fn put_file(
            &self,
            key: &str,
            bytes: &[u8],
            _mime_type: &str,
            cancel: &CancellationToken,
        ) -> SyncResult<()> {
            cancel.check()?;
            self.files
                .lock()
                .unwrap()
                .insert(key.to_string(), bytes.to_vec());
            Ok(())
        }

        async fn delete_file(&self, key: &str, cancel: &CancellationToken) -> SyncResult<()> {
            cancel.check()?;
            self.files.lock().unwrap().remove(key);
            Ok(())
        }

        async fn exists(&self, key: &str, cancel: &CancellationToken) -> SyncResult<bool> {
            cancel.check()?;
            Ok(self.files.lock().unwrap().contains_key(key))
        }

        fn attachments_paused(&self) -> bool {
            self.paused.load(Ordering::SeqCst)
        }
    }
}
