use crate::domains::area::Area;
use crate::domains::attachment::Attachment;
use crate::domains::project::Project;
use crate::domains::section::Section;
use crate::domains::settings::Settings;
use crate::domains::task::Task;
use crate::errors::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// The serialized sync document: the full dataset exchanged with a remote
/// replica as one JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppData {
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default)]
    pub areas: Vec<Area>,
    #[serde(default)]
    pub settings: Settings,
}

impl AppData {
    /// Visit every attachment (task- and project-owned) mutably.
    pub fn for_each_attachment_mut<F: FnMut(&mut Attachment)>(&mut self, mut f: F) {
        for task in &mut self.tasks {
            for attachment in &mut task.attachments {
                f(attachment);
            }
        }
        for project in &mut self.projects {
            for attachment in &mut project.attachments {
                f(attachment);
            }
        }
    }

    /// Iterate every attachment (task- and project-owned).
    pub fn attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.tasks
            .iter()
            .flat_map(|t| t.attachments.iter())
            .chain(self.projects.iter().flat_map(|p| p.attachments.iter()))
    }
}

/// Per-entity-type merge statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EntityMergeStats {
    pub conflicts: u32,
    pub conflict_ids: Vec<String>,
    pub max_clock_skew_ms: i64,
    pub timestamp_adjustments: u32,
}

/// Merge statistics across the four entity streams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MergeStats {
    pub tasks: EntityMergeStats,
    pub projects: EntityMergeStats,
    pub sections: EntityMergeStats,
    pub areas: EntityMergeStats,
}

impl MergeStats {
    pub fn total_conflicts(&self) -> u32 {
        self.tasks.conflicts + self.projects.conflicts + self.sections.conflicts + self.areas.conflicts
    }

    pub fn total_timestamp_adjustments(&self) -> u32 {
        self.tasks.timestamp_adjustments
            + self.projects.timestamp_adjustments
            + self.sections.timestamp_adjustments
            + self.areas.timestamp_adjustments
    }

    pub fn max_clock_skew_ms(&self) -> i64 {
        self.tasks
            .max_clock_skew_ms
            .max(self.projects.max_clock_skew_ms)
            .max(self.sections.max_clock_skew_ms)
            .max(self.areas.max_clock_skew_ms)
    }

    pub fn all_conflict_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        ids.extend(self.tasks.conflict_ids.iter().cloned());
        ids.extend(self.projects.conflict_ids.iter().cloned());
        ids.extend(self.sections.conflict_ids.iter().cloned());
        ids.extend(self.areas.conflict_ids.iter().cloned());
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.total_conflicts() == 0 && self.total_timestamp_adjustments() == 0
    }
}

/// Merge result status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStatus {
    Success,
    Conflict,
}

impl MergeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStatus::Success => "success",
            MergeStatus::Conflict => "conflict",
        }
    }
}

/// Output of one merge call
#[derive(Debug, Clone)]
pub struct MergeOutput {
    pub data: AppData,
    pub stats: MergeStats,
    pub status: MergeStatus,
}

/// Which transport a device syncs through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncBackendKind {
    #[default]
    Off,
    File,
    Webdav,
    Cloud,
}

impl SyncBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncBackendKind::Off => "off",
            SyncBackendKind::File => "file",
            SyncBackendKind::Webdav => "webdav",
            SyncBackendKind::Cloud => "cloud",
        }
    }

    /// Unknown values degrade to `Off` rather than failing configuration
    /// reads.
    pub fn from_str(s: &str) -> Self {
        match s {
            "file" => SyncBackendKind::File,
            "webdav" => SyncBackendKind::Webdav,
            "cloud" => SyncBackendKind::Cloud,
            _ => SyncBackendKind::Off,
        }
    }
}

/// Sync configuration read from the settings keys.
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    pub backend: SyncBackendKind,
    pub sync_path: Option<String>,
    pub webdav_url: Option<String>,
    pub webdav_username: Option<String>,
    pub webdav_password: Option<String>,
    pub cloud_url: Option<String>,
    pub cloud_token: Option<String>,
}

impl SyncConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let backend = settings
            .get_str("SYNC_BACKEND")
            .map(SyncBackendKind::from_str)
            .unwrap_or_default();

        Self {
            backend,
            sync_path: settings.get_str("SYNC_PATH").map(str::to_string),
            webdav_url: settings.get_str("WEBDAV_URL").map(str::to_string),
            webdav_username: settings.get_str("WEBDAV_USERNAME").map(str::to_string),
            webdav_password: settings.get_str("WEBDAV_PASSWORD").map(str::to_string),
            cloud_url: settings.get_str("CLOUD_URL").map(str::to_string),
            cloud_token: settings.get_str("CLOUD_TOKEN").map(str::to_string),
        }
    }

    /// Check the keys the chosen backend needs; missing ones fail fast.
    pub fn validate(&self) -> SyncResult<()> {
        match self.backend {
            SyncBackendKind::Off => Ok(()),
            SyncBackendKind::File => match &self.sync_path {
                Some(path) if !path.is_empty() => Ok(()),
                _ => Err(SyncError::Configuration(
                    "file sync requires SYNC_PATH".to_string(),
                )),
            },
            SyncBackendKind::Webdav => match &self.webdav_url {
                Some(url) if !url.is_empty() => Ok(()),
                _ => Err(SyncError::Configuration(
                    "WebDAV sync requires WEBDAV_URL".to_string(),
                )),
            },
            SyncBackendKind::Cloud => {
                match (&self.cloud_url, &self.cloud_token) {
                    (Some(url), Some(token)) if !url.is_empty() && !token.is_empty() => Ok(()),
                    _ => Err(SyncError::Configuration(
                        "cloud sync requires CLOUD_URL and CLOUD_TOKEN".to_string(),
                    )),
                }
            }
        }
    }
}

/// Result shape of one `perform_sync` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<MergeStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncOutcome {
    pub fn success(stats: Option<MergeStats>) -> Self {
        Self {
            success: true,
            stats,
            error: None,
        }
    }

    pub fn failure(error: String) -> Self {
        Self {
            success: false,
            stats: None,
            error: Some(error),
        }
    }
}

/// Cooperative cancellation shared by every I/O call of one cycle.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        // Err means the sender dropped, which only happens when the cycle
        // owning the token is gone; treat that as never-cancelled.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Error early when the cycle has been cancelled.
    pub fn check(&self) -> SyncResult<()> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Attachment transfer direction, for progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOp {
    Upload,
    Download,
}

/// Progress state reported to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Started,
    Completed,
    Failed,
}

/// Sink for attachment transfer progress. The UI shell implements this;
/// the engine reports, it never blocks on the sink.
pub trait ProgressSink: Send + Sync {
    fn on_progress(
        &self,
        attachment_id: &str,
        op: TransferOp,
        bytes: u64,
        total: Option<u64>,
        status: TransferStatus,
    );
}

/// No-op sink used when the shell does not care about progress.
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn on_progress(&self, _: &str, _: TransferOp, _: u64, _: Option<u64>, _: TransferStatus) {}
}

/// Shared connectivity state fed by the platform's network monitor.
/// `set_online(false)` mid-cycle aborts in-flight transfers.
#[derive(Debug, Clone)]
pub struct ConnectivityHandle {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for ConnectivityHandle {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivityHandle {
    pub fn new(online: bool) -> Self {
        let (tx, rx) = watch::channel(online);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn set_online(&self, online: bool) {
        let _ = self.tx.send(online);
    }

    pub fn is_online(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the device reports offline. Pending forever while it
    /// stays online.
    pub async fn went_offline(&self) {
        let mut rx = self.rx.clone();
        if !*rx.borrow() {
            return;
        }
        if rx.wait_for(|online| !*online).await.is_err() {
            // Sender gone: connectivity can no longer change, so never
            // report offline.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_backend_degrades_to_off() {
        assert_eq!(SyncBackendKind::from_str("webdav"), SyncBackendKind::Webdav);
        assert_eq!(SyncBackendKind::from_str("dropbox"), SyncBackendKind::Off);
    }

    #[test]
    fn config_validation_fails_fast_on_missing_keys() {
        let mut settings = Settings::new();
        settings.set("SYNC_BACKEND", serde_json::Value::String("webdav".into()));
        let config = SyncConfig::from_settings(&settings);
        assert!(config.validate().is_err());

        settings.set(
            "WEBDAV_URL",
            serde_json::Value::String("https://dav.example.com/gtd".into()),
        );
        let config = SyncConfig::from_settings(&settings);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn cancellation_token_fires() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        token.cancel();
        handle.await.unwrap();
        assert!(token.is_cancelled());
        assert!(token.check().is_err());
    }

    #[tokio::test]
    async fn connectivity_offline_signal() {
        let connectivity = ConnectivityHandle::new(true);
        let watcher = connectivity.clone();
        let handle = tokio::spawn(async move { watcher.went_offline().await });

        connectivity.set_online(false);
        handle.await.unwrap();
        assert!(!connectivity.is_online());
    }

    #[test]
    fn empty_document_parses_with_defaults() {
        let data: AppData = serde_json::from_str("{}").unwrap();
        assert!(data.tasks.is_empty());
        assert!(data.settings.0.is_empty());
    }
}
