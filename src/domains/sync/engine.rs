use crate::domains::attachment::{Attachment, LocalStatus};
use crate::domains::core::attachment_storage::{sha256_hex, AttachmentStorage};
use crate::domains::sync::transport::SyncTransport;
use crate::domains::sync::types::{
    AppData, CancellationToken, NullProgressSink, ProgressSink, TransferOp, TransferStatus,
};
use crate::errors::{SyncError, SyncResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::fs;

/// Per-cycle transfer caps, bounding WebDAV traffic.
const MAX_UPLOADS_PER_CYCLE: usize = 10;
const MAX_DOWNLOADS_PER_CYCLE: usize = 10;

/// Deletion targets processed per cleanup pass; the rest roll over.
const MAX_CLEANUP_TARGETS: usize = 25;

/// Download retry spacing: longer when the remote says the blob is gone.
const MISSING_BACKOFF: Duration = Duration::from_secs(15 * 60);
const ERROR_BACKOFF: Duration = Duration::from_secs(2 * 60);

/// Orphan GC runs at most this often per device.
const CLEANUP_INTERVAL_HOURS: i64 = 24;

/// Tombstones older than this are hard-purged during cleanup.
const TOMBSTONE_RETENTION_DAYS: i64 = 90;

/// What the pre-sync pass did.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrepareSummary {
    pub uploaded: usize,
    pub cleared_keys: usize,
}

/// What the post-merge pass did. Integrity failures are collected, not
/// raised, so remaining attachments still transfer.
#[derive(Debug, Default)]
pub struct DownloadSummary {
    pub downloaded: usize,
    pub errors: Vec<(String, SyncError)>,
}

/// What a cleanup pass did.
#[derive(Debug, Default, Clone, Copy)]
pub struct CleanupSummary {
    pub ran: bool,
    pub deleted_local: usize,
    pub deleted_remote: usize,
    pub purged: usize,
    /// False when the target cap was hit and work remains for the next
    /// cycle.
    pub complete: bool,
}

/// Walks entity attachments around a sync cycle: uploads missing remote
/// blobs before the document is read, downloads missing local blobs after
/// the merged document is written, and garbage-collects orphans.
pub struct AttachmentEngine {
    storage: AttachmentStorage,
    progress: Arc<dyn ProgressSink>,
    download_backoff: Mutex<HashMap<String, Instant>>,
}

impl AttachmentEngine {
    pub fn new(data_root: &Path) -> std::io::Result<Self> {
        Ok(Self {
            storage: AttachmentStorage::new(data_root)?,
            progress: Arc::new(NullProgressSink),
            download_backoff: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    pub fn storage(&self) -> &AttachmentStorage {
        &self.storage
    }

    /// Pre-sync pass: probe local presence, upload blobs the remote lacks,
    /// clear cloud keys whose blobs vanished remotely. Mutates the
    /// in-memory snapshot only; the caller persists after the cycle
    /// succeeds.
    pub async fn prepare_uploads(
        &self,
        data: &mut AppData,
        transport: &dyn SyncTransport,
        cancel: &CancellationToken,
    ) -> SyncResult<PrepareSummary> {
        let mut summary = PrepareSummary::default();
        let mut uploads = 0usize;

        let max_bytes = transport.max_attachment_bytes();

        for task in data.tasks.iter_mut() {
            for attachment in task.attachments.iter_mut() {
                self.prepare_one(attachment, transport, cancel, max_bytes, &mut uploads, &mut summary)
                    .await?;
            }
        }
        for project in data.projects.iter_mut() {
            for attachment in project.attachments.iter_mut() {
                self.prepare_one(attachment, transport, cancel, max_bytes, &mut uploads, &mut summary)
                    .await?;
            }
        }

        Ok(summary)
    }

    async fn prepare_one(
        &self,
        attachment: &mut Attachment,
        transport: &dyn SyncTransport,
        cancel: &CancellationToken,
        max_bytes: Option<u64>,
        uploads: &mut usize,
        summary: &mut PrepareSummary,
    ) -> SyncResult<()> {
        cancel.check()?;
        if !attachment.is_live_file() {
            return Ok(());
        }

        let local_size = match fs::metadata(&attachment.uri).await {
            Ok(meta) => {
                attachment.local_status = LocalStatus::Available;
                Some(meta.len())
            }
            Err(_) => {
                attachment.local_status = LocalStatus::Missing;
                None
            }
        };

        let cloud_key = attachment.cloud_key.clone();
        match (cloud_key, local_size) {
            (None, Some(size)) => {
                if *uploads >= MAX_UPLOADS_PER_CYCLE || transport.attachments_paused() {
                    return Ok(());
                }
                if matches!(max_bytes, Some(cap) if size > cap) {
                    log::warn!(
                        "sync: attachment {} ({} bytes) exceeds the backend upload cap, skipping",
                        attachment.id,
                        size
                    );
                    return Ok(());
                }
                match self.upload_one(attachment, transport, cancel).await {
                    Ok(()) => {
                        *uploads += 1;
                        summary.uploaded += 1;
                    }
                    Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                    Err(e) => {
                        // Upload failures leave the attachment for a later
                        // cycle; a broken transport will fail the document
                        // read right after this pass anyway.
                        log::warn!("sync: upload of attachment {} failed: {}", attachment.id, e);
                    }
                }
            }
            (Some(key), _) => {
                if transport.attachments_paused() {
                    return Ok(());
                }
                match transport.exists(&key, cancel).await {
                    Ok(false) => {
                        log::info!(
                            "sync: cloud key {} of attachment {} is gone remotely, clearing",
                            key,
                            attachment.id
                        );
                        attachment.cloud_key = None;
                        summary.cleared_keys += 1;
                    }
                    Ok(true) => {}
                    Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                    Err(e) => {
                        log::debug!("sync: exists probe for {} failed: {}", attachment.id, e)
                    }
                }
            }
            (None, None) => {}
        }

        Ok(())
    }

    async fn upload_one(
        &self,
        attachment: &mut Attachment,
        transport: &dyn SyncTransport,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let bytes = fs::read(&attachment.uri)
            .await
            .map_err(|e| SyncError::Other(format!("read local attachment: {}", e)))?;

        let key = attachment.expected_cloud_key();
        let mime = attachment
            .mime_type
            .clone()
            .or_else(|| infer::get(&bytes).map(|k| k.mime_type().to_string()))
            .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string());

        let total = bytes.len() as u64;
        self.progress
            .on_progress(&attachment.id, TransferOp::Upload, 0, Some(total), TransferStatus::Started);

        let result = transport.put_file(&key, &bytes, &mime, cancel).await;

        match result {
            Ok(()) => {
                attachment.cloud_key = Some(key);
                attachment.file_hash = Some(sha256_hex(&bytes));
                attachment.size = Some(total);
                if attachment.mime_type.is_none() {
                    attachment.mime_type = Some(mime);
                }
                self.progress.on_progress(
                    &attachment.id,
                    TransferOp::Upload,
                    total,
                    Some(total),
                    TransferStatus::Completed,
                );
                Ok(())
            }
            Err(e) => {
                self.progress.on_progress(
                    &attachment.id,
                    TransferOp::Upload,
                    0,
                    Some(total),
                    TransferStatus::Failed,
                );
                Err(e)
            }
        }
    }

    /// Post-merge pass: fetch blobs the merged document references but this
    /// device lacks. Hash mismatches never leave bytes on disk.
    pub async fn process_downloads(
        &self,
        data: &mut AppData,
        transport: &dyn SyncTransport,
        cancel: &CancellationToken,
    ) -> SyncResult<DownloadSummary> {
        let mut summary = DownloadSummary::default();
        let mut downloads = 0usize;

        for task in data.tasks.iter_mut() {
            for attachment in task.attachments.iter_mut() {
                self.download_one(attachment, transport, cancel, &mut downloads, &mut summary)
                    .await?;
            }
        }
        for project in data.projects.iter_mut() {
            for attachment in project.attachments.iter_mut() {
                self.download_one(attachment, transport, cancel, &mut downloads, &mut summary)
                    .await?;
            }
        }

        Ok(summary)
    }

    async fn download_one(
        &self,
        attachment: &mut Attachment,
        transport: &dyn SyncTransport,
        cancel: &CancellationToken,
        downloads: &mut usize,
        summary: &mut DownloadSummary,
    ) -> SyncResult<()> {
        cancel.check()?;
        if !attachment.is_live_file() {
            return Ok(());
        }
        let Some(key) = attachment.cloud_key.clone() else {
            return Ok(());
        };

        // Already on disk, either at its recorded uri or in the blob dir.
        if fs::metadata(&attachment.uri).await.is_ok() {
            attachment.local_status = LocalStatus::Available;
            return Ok(());
        }
        let blob_name = attachment.blob_file_name();
        if self.storage.exists(&blob_name).await.unwrap_or(false) {
            if let Ok(path) = self.storage.blob_path(&blob_name) {
                attachment.uri = path.display().to_string();
            }
            attachment.local_status = LocalStatus::Available;
            return Ok(());
        }

        if *downloads >= MAX_DOWNLOADS_PER_CYCLE || transport.attachments_paused() {
            return Ok(());
        }
        if self.in_backoff(&attachment.id) {
            return Ok(());
        }

        self.progress
            .on_progress(&attachment.id, TransferOp::Download, 0, attachment.size, TransferStatus::Started);

        let bytes = match transport.get_file(&key, cancel).await {
            Ok(bytes) => bytes,
            Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
            Err(e) => {
                let backoff = if matches!(e, SyncError::RemoteMissing(_)) {
                    MISSING_BACKOFF
                } else {
                    ERROR_BACKOFF
                };
                self.set_backoff(&attachment.id, backoff);
                self.progress.on_progress(
                    &attachment.id,
                    TransferOp::Download,
                    0,
                    attachment.size,
                    TransferStatus::Failed,
                );
                log::warn!("sync: download of attachment {} failed: {}", attachment.id, e);
                summary.errors.push((attachment.id.clone(), e));
                return Ok(());
            }
        };

        if let Some(expected) = &attachment.file_hash {
            let actual = sha256_hex(&bytes);
            if &actual != expected {
                attachment.local_status = LocalStatus::Missing;
                self.set_backoff(&attachment.id, ERROR_BACKOFF);
                self.progress.on_progress(
                    &attachment.id,
                    TransferOp::Download,
                    0,
                    attachment.size,
                    TransferStatus::Failed,
                );
                log::error!(
                    "sync: attachment {} hash mismatch (expected {}, got {})",
                    attachment.id,
                    expected,
                    actual
                );
                summary.errors.push((
                    attachment.id.clone(),
                    SyncError::Integrity {
                        attachment_id: attachment.id.clone(),
                    },
                ));
                return Ok(());
            }
        }

        let total = bytes.len() as u64;
        self.storage
            .write_blob(&blob_name, &bytes)
            .await
            .map_err(|e| SyncError::Other(format!("store downloaded blob: {}", e)))?;

        if let Ok(path) = self.storage.blob_path(&blob_name) {
            attachment.uri = path.display().to_string();
        }
        attachment.local_status = LocalStatus::Available;
        attachment.size = Some(total);
        self.clear_backoff(&attachment.id);
        *downloads += 1;
        summary.downloaded += 1;

        self.progress.on_progress(
            &attachment.id,
            TransferOp::Download,
            total,
            Some(total),
            TransferStatus::Completed,
        );
        Ok(())
    }

    fn in_backoff(&self, attachment_id: &str) -> bool {
        let table = self.download_backoff.lock().unwrap_or_else(|p| p.into_inner());
        matches!(table.get(attachment_id), Some(until) if *until > Instant::now())
    }

    fn set_backoff(&self, attachment_id: &str, backoff: Duration) {
        let mut table = self.download_backoff.lock().unwrap_or_else(|p| p.into_inner());
        table.insert(attachment_id.to_string(), Instant::now() + backoff);
    }

    fn clear_backoff(&self, attachment_id: &str) {
        let mut table = self.download_backoff.lock().unwrap_or_else(|p| p.into_inner());
        table.remove(attachment_id);
    }

    /// Orphan GC plus tombstone retention. Runs at most once per 24 h,
    /// gated by `settings.attachments.lastCleanupAt`; the gate only
    /// advances when the pass finished under its target cap.
    pub async fn cleanup(
        &self,
        data: &mut AppData,
        transport: &dyn SyncTransport,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> SyncResult<CleanupSummary> {
        let mut summary = CleanupSummary::default();

        if let Some(last) = data.settings.last_cleanup_at() {
            if now - last < ChronoDuration::hours(CLEANUP_INTERVAL_HOURS) {
                summary.complete = true;
                return Ok(summary);
            }
        }
        summary.ran = true;

        let mut targets = 0usize;
        let mut capped = false;

        // Referenced blob names, live and tombstoned alike: a tombstone
        // still owns its blob until the retention pass drops it.
        let mut referenced: HashSet<String> = HashSet::new();
        for attachment in data.attachments() {
            referenced.insert(attachment.blob_file_name());
            referenced.insert(attachment.id.clone());
        }

        // Orphaned local blobs.
        let blobs = self
            .storage
            .list_blobs()
            .await
            .map_err(|e| SyncError::Other(format!("list blobs: {}", e)))?;
        for blob in blobs {
            cancel.check()?;
            if targets >= MAX_CLEANUP_TARGETS {
                capped = true;
                break;
            }
            let stem = blob.rsplit_once('.').map(|(s, _)| s).unwrap_or(&blob);
            if referenced.contains(&blob) || referenced.contains(stem) {
                continue;
            }
            log::info!("sync: deleting orphaned attachment blob {}", blob);
            self.storage
                .delete_blob(&blob)
                .await
                .map_err(|e| SyncError::Other(format!("delete orphan blob: {}", e)))?;
            summary.deleted_local += 1;
            targets += 1;
        }

        // Tombstoned attachments: local file and remote blob go away; the
        // array entry itself stays until the retention horizon so stale
        // replicas cannot resurrect it.
        let purge_horizon = now - ChronoDuration::days(TOMBSTONE_RETENTION_DAYS);
        if !capped {
            let (done, remote_deleted, local_deleted) = self
                .delete_tombstoned_blobs(data, transport, cancel, &mut targets)
                .await?;
            capped = !done;
            summary.deleted_remote += remote_deleted;
            summary.deleted_local += local_deleted;
        }

        for task in data.tasks.iter_mut() {
            task.attachments
                .retain(|a| !matches!(a.deleted_at, Some(at) if at < purge_horizon && a.cloud_key.is_none()));
        }
        for project in data.projects.iter_mut() {
            project
                .attachments
                .retain(|a| !matches!(a.deleted_at, Some(at) if at < purge_horizon && a.cloud_key.is_none()));
        }

        summary.purged += stamp_purged(&mut data.tasks, purge_horizon, now);
        summary.purged += stamp_purged(&mut data.projects, purge_horizon, now);
        summary.purged += stamp_purged(&mut data.sections, purge_horizon, now);
        summary.purged += stamp_purged(&mut data.areas, purge_horizon, now);

        summary.complete = !capped;
        if summary.complete {
            data.settings.set_last_cleanup_at(now);
        }

        Ok(summary)
    }

    async fn delete_tombstoned_blobs(
        &self,
        data: &mut AppData,
        transport: &dyn SyncTransport,
        cancel: &CancellationToken,
        targets: &mut usize,
    ) -> SyncResult<(bool, usize, usize)> {
        let mut remote_deleted = 0usize;
        let mut local_deleted = 0usize;

        fn wants_deletion(attachment: &Attachment) -> bool {
            attachment.deleted_at.is_some()
                && attachment.is_file()
                && (attachment.local_status == LocalStatus::Available
                    || attachment.cloud_key.is_some())
        }

        // Work is collected first because the deletions await; attachment
        // state is only cleared for targets that actually processed.
        let work: Vec<(String, String, Option<String>)> = data
            .attachments()
            .filter(|a| wants_deletion(a))
            .map(|a| (a.id.clone(), a.blob_file_name(), a.cloud_key.clone()))
            .collect();

        let mut processed: HashSet<String> = HashSet::new();
        let mut capped = false;
        for (id, blob, key) in work {
            cancel.check()?;
            if *targets >= MAX_CLEANUP_TARGETS {
                capped = true;
                break;
            }
            self.storage
                .delete_blob(&blob)
                .await
                .map_err(|e| SyncError::Other(format!("delete tombstoned blob: {}", e)))?;
            local_deleted += 1;
            if let Some(key) = &key {
                transport.delete_file(key, cancel).await?;
                remote_deleted += 1;
            }
            processed.insert(id);
            *targets += 1;
        }

        data.for_each_attachment_mut(|attachment| {
            if processed.contains(&attachment.id) {
                attachment.cloud_key = None;
                attachment.local_status = LocalStatus::Missing;
            }
        });

        Ok((!capped, remote_deleted, local_deleted))
    }
}

fn stamp_purged<T: crate::domains::sync::merger::Syncable + PurgeStamp>(
    entities: &mut [T],
    horizon: DateTime<Utc>,
    now: DateTime<Utc>,
) -> usize {
    let mut purged = 0;
    for entity in entities.iter_mut() {
        if entity.purged().is_none() {
            if let Some(deleted) = entity.deleted() {
                if deleted < horizon {
                    entity.set_purged(Some(now));
                    purged += 1;
                }
            }
        }
    }
    purged
}

/// Access to the hard-delete marker, for the retention pass.
pub trait PurgeStamp {
    fn purged(&self) -> Option<DateTime<Utc>>;
    fn set_purged(&mut self, at: Option<DateTime<Utc>>);
}

macro_rules! impl_purge_stamp {
    ($entity:ty) => {
        impl PurgeStamp for $entity {
            fn purged(&self) -> Option<DateTime<Utc>> {
                self.purged_at
            }
            fn set_purged(&mut self, at: Option<DateTime<Utc>>) {
                self.purged_at = at;
            }
        }
    };
}

impl_purge_stamp!(crate::domains::task::Task);
impl_purge_stamp!(crate::domains::project::Project);
impl_purge_stamp!(crate::domains::section::Section);
impl_purge_stamp!(crate::domains::area::Area);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::attachment::AttachmentKind;
    use crate::domains::sync::transport::testing::MemoryTransport;
    use crate::domains::task::{Task, TaskStatus};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn task_with_attachment(attachment: Attachment) -> Task {
        let now = ts("2024-06-01T10:00:00Z");
        Task {
            id: "T1".to_string(),
            title: "Task".to_string(),
            status: TaskStatus::Inbox,
            priority: None,
            project_id: None,
            section_id: None,
            area_id: None,
            start_time: None,
            due_date: None,
            review_at: None,
            completed_at: None,
            recurrence: None,
            push_count: None,
            tags: vec![],
            contexts: vec![],
            checklist: vec![],
            attachments: vec![attachment],
            order_num: None,
            is_focused_today: false,
            text_direction: None,
            time_estimate: None,
            description: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            purged_at: None,
        }
    }

    fn attachment(id: &str, uri: &str) -> Attachment {
        let now = ts("2024-06-01T10:00:00Z");
        Attachment {
            id: id.to_string(),
            kind: AttachmentKind::File,
            title: format!("{}.pdf", id),
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

    #[tokio::test]
    async fn upload_assigns_cloud_key_and_hash() {
        let dir = TempDir::new().unwrap();
        let local_file = dir.path().join("report.pdf");
        tokio::fs::write(&local_file, b"report bytes").await.unwrap();

        let engine = AttachmentEngine::new(dir.path()).unwrap();
        let transport = MemoryTransport::new();
        let cancel = CancellationToken::new();

        let mut data = AppData::default();
        data.tasks
            .push(task_with_attachment(attachment("A1", local_file.to_str().unwrap())));

        let summary = engine
            .prepare_uploads(&mut data, &transport, &cancel)
            .await
            .unwrap();
        assert_eq!(summary.uploaded, 1);

        let uploaded = &data.tasks[0].attachments[0];
        assert_eq!(uploaded.cloud_key.as_deref(), Some("attachments/A1.pdf"));
        assert_eq!(uploaded.local_status, LocalStatus::Available);
        assert_eq!(
            uploaded.file_hash.as_deref(),
            Some(sha256_hex(b"report bytes").as_str())
        );
        assert_eq!(
            transport.blob("attachments/A1.pdf").as_deref(),
            Some(b"report bytes".as_slice())
        );
    }

    #[tokio::test]
    async fn upload_cap_limits_one_cycle() {
        let dir = TempDir::new().unwrap();
        let engine = AttachmentEngine::new(dir.path()).unwrap();
        let transport = MemoryTransport::new();
        let cancel = CancellationToken::new();

        let mut data = AppData::default();
        for i in 0..15 {
            let path = dir.path().join(format!("f{}.txt", i));
            tokio::fs::write(&path, b"x").await.unwrap();
            let mut task = task_with_attachment(attachment(
                &format!("A{:02}", i),
                path.to_str().unwrap(),
            ));
            task.id = format!("T{:02}", i);
            data.tasks.push(task);
        }

        let summary = engine
            .prepare_uploads(&mut data, &transport, &cancel)
            .await
            .unwrap();
        assert_eq!(summary.uploaded, 10);
        assert_eq!(transport.files.lock().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn stale_cloud_key_is_cleared() {
        let dir = TempDir::new().unwrap();
        let engine = AttachmentEngine::new(dir.path()).unwrap();
        let transport = MemoryTransport::new();
        let cancel = CancellationToken::new();

        let mut att = attachment("A1", "/nonexistent/path.pdf");
        att.cloud_key = Some("attachments/A1.pdf".to_string());
        let mut data = AppData::default();
        data.tasks.push(task_with_attachment(att));

        let summary = engine
            .prepare_uploads(&mut data, &transport, &cancel)
            .await
            .unwrap();
        assert_eq!(summary.cleared_keys, 1);
        assert!(data.tasks[0].attachments[0].cloud_key.is_none());
        assert_eq!(data.tasks[0].attachments[0].local_status, LocalStatus::Missing);
    }

    #[tokio::test]
    async fn download_writes_blob_and_updates_uri() {
        let dir = TempDir::new().unwrap();
        let engine = AttachmentEngine::new(dir.path()).unwrap();
        let transport = MemoryTransport::new();
        let cancel = CancellationToken::new();

        transport.put_blob("attachments/A1.pdf", b"remote bytes");

        let mut att = attachment("A1", "");
        att.uri = "/gone/A1.pdf".to_string();
        att.cloud_key = Some("attachments/A1.pdf".to_string());
        att.file_hash = Some(sha256_hex(b"remote bytes"));
        let mut data = AppData::default();
        data.tasks.push(task_with_attachment(att));

        let summary = engine
            .process_downloads(&mut data, &transport, &cancel)
            .await
            .unwrap();
        assert_eq!(summary.downloaded, 1);
        assert!(summary.errors.is_empty());

        let downloaded = &data.tasks[0].attachments[0];
        assert_eq!(downloaded.local_status, LocalStatus::Available);
        let bytes = tokio::fs::read(&downloaded.uri).await.unwrap();
        assert_eq!(bytes, b"remote bytes");
    }

    #[tokio::test]
    async fn hash_mismatch_leaves_no_file_and_backs_off() {
        let dir = TempDir::new().unwrap();
        let engine = AttachmentEngine::new(dir.path()).unwrap();
        let transport = MemoryTransport::new();
        let cancel = CancellationToken::new();

        transport.put_blob("attachments/A1.pdf", b"tampered bytes");

        let mut att = attachment("A1", "/gone/A1.pdf");
        att.cloud_key = Some("attachments/A1.pdf".to_string());
        att.file_hash = Some(sha256_hex(b"original bytes"));
        let mut data = AppData::default();
        data.tasks.push(task_with_attachment(att));

        let summary = engine
            .process_downloads(&mut data, &transport, &cancel)
            .await
            .unwrap();
        assert_eq!(summary.downloaded, 0);
        assert!(matches!(
            summary.errors.as_slice(),
            [(id, SyncError::Integrity { .. })] if id == "A1"
        ));
        assert_eq!(data.tasks[0].attachments[0].local_status, LocalStatus::Missing);
        assert!(!engine.storage.exists("A1.pdf").await.unwrap());

        // The backoff table suppresses an immediate retry.
        let calls_before = transport.get_calls.load(Ordering::SeqCst);
        engine
            .process_downloads(&mut data, &transport, &cancel)
            .await
            .unwrap();
        assert_eq!(transport.get_calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn cleanup_removes_orphans_and_tombstoned_blobs() {
        let dir = TempDir::new().unwrap();
        let engine = AttachmentEngine::new(dir.path()).unwrap();
        let transport = MemoryTransport::new();
        let cancel = CancellationToken::new();

        // Orphan blob nothing references.
        engine.storage.write_blob("ZZ.bin", b"orphan").await.unwrap();
        // Referenced blob that must survive.
        engine.storage.write_blob("A1.pdf", b"keep").await.unwrap();
        // Tombstoned attachment with local and remote copies.
        engine.storage.write_blob("A2.png", b"dead").await.unwrap();
        transport.put_blob("attachments/A2.png", b"dead");

        let keep = {
            let mut a = attachment("A1", "x");
            a.uri = engine.storage.blob_path("A1.pdf").unwrap().display().to_string();
            a
        };
        let mut dead = attachment("A2", "x");
        dead.title = "A2.png".to_string();
        dead.cloud_key = Some("attachments/A2.png".to_string());
        dead.local_status = LocalStatus::Available;
        dead.deleted_at = Some(ts("2024-06-01T09:00:00Z"));

        let mut task = task_with_attachment(keep);
        task.attachments.push(dead);
        let mut data = AppData::default();
        data.tasks.push(task);

        let now = ts("2024-06-02T10:00:00Z");
        let summary = engine.cleanup(&mut data, &transport, &cancel, now).await.unwrap();
        assert!(summary.ran);
        assert!(summary.complete);
        assert!(summary.deleted_local >= 2);
        assert_eq!(summary.deleted_remote, 1);

        assert!(!engine.storage.exists("ZZ.bin").await.unwrap());
        assert!(!engine.storage.exists("A2.png").await.unwrap());
        assert!(engine.storage.exists("A1.pdf").await.unwrap());
        assert!(transport.blob("attachments/A2.png").is_none());
        // Tombstone entry survives until the retention horizon.
        assert_eq!(data.tasks[0].attachments.len(), 2);
        // Gate advanced.
        assert_eq!(data.settings.last_cleanup_at(), Some(now));
    }

    #[tokio::test]
    async fn cleanup_honors_24h_gate() {
        let dir = TempDir::new().unwrap();
        let engine = AttachmentEngine::new(dir.path()).unwrap();
        let transport = MemoryTransport::new();
        let cancel = CancellationToken::new();

        engine.storage.write_blob("ZZ.bin", b"orphan").await.unwrap();

        let mut data = AppData::default();
        data.settings.set_last_cleanup_at(ts("2024-06-02T00:00:00Z"));

        let summary = engine
            .cleanup(&mut data, &transport, &cancel, ts("2024-06-02T12:00:00Z"))
            .await
            .unwrap();
        assert!(!summary.ran);
        assert!(engine.storage.exists("ZZ.bin").await.unwrap());

        let summary = engine
            .cleanup(&mut data, &transport, &cancel, ts("2024-06-03T01:00:00Z"))
            .await
            .unwrap();
        assert!(summary.ran);
        assert!(!engine.storage.exists("ZZ.bin").await.unwrap());
    }

    #[tokio::test]
    async fn old_tombstones_get_purge_stamp() {
        let dir = TempDir::new().unwrap();
        let engine = AttachmentEngine::new(dir.path()).unwrap();
        let transport = MemoryTransport::new();
        let cancel = CancellationToken::new();

        let mut old = task_with_attachment(attachment("A1", "x"));
        old.attachments.clear();
        old.deleted_at = Some(ts("2024-01-01T00:00:00Z"));

        let mut data = AppData::default();
        data.tasks.push(old);

        // Well past the 90-day horizon.
        let now = ts("2024-06-01T00:00:00Z");
        let summary = engine.cleanup(&mut data, &transport, &cancel, now).await.unwrap();
        assert_eq!(summary.purged, 1);
        assert_eq!(data.tasks[0].purged_at, Some(now));
    }
}
