use crate::domains::settings::SyncHistoryEntry;
use crate::domains::store::DataStore;
use crate::domains::sync::engine::AttachmentEngine;
use crate::domains::sync::merger;
use crate::domains::sync::transport::{build_transport, SyncTransport};
use crate::domains::sync::types::{
    CancellationToken, ConnectivityHandle, MergeStats, MergeStatus, ProgressSink, SyncBackendKind,
    SyncConfig, SyncOutcome,
};
use crate::domains::sync::utils::sanitize_error_message;
use crate::errors::{DomainError, SyncError, SyncResult};
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// High-level trait for the synchronisation service.
#[async_trait]
pub trait SyncService: Send + Sync {
    /// Run one sync cycle, or join the cycle already in flight.
    async fn perform_sync(self: Arc<Self>) -> SyncOutcome;
}

/// What one successfully completed cycle produced.
struct CycleSuccess {
    stats: MergeStats,
    merge_status: MergeStatus,
    attachment_errors: Vec<(String, SyncError)>,
}

/// Single-flight state: at most one cycle runs per process; callers that
/// arrive while it runs share its result, and at most one follow-up cycle
/// is queued behind it.
enum FlightState {
    Idle,
    Running {
        result: watch::Receiver<Option<SyncOutcome>>,
        pending: bool,
    },
}

/// Drives sync cycles against the configured backend. Owns all transient
/// in-flight state; the store owns the data, the engine owns the blob
/// directory.
pub struct SyncOrchestrator {
    store: Arc<DataStore>,
    engine: AttachmentEngine,
    data_root: PathBuf,
    connectivity: ConnectivityHandle,
    flight: Mutex<FlightState>,
    #[cfg(test)]
    transport_override: std::sync::Mutex<Option<Arc<dyn SyncTransport>>>,
}

impl SyncOrchestrator {
    pub fn new(store: Arc<DataStore>, data_root: PathBuf) -> std::io::Result<Self> {
        Ok(Self {
            engine: AttachmentEngine::new(&data_root)?,
            store,
            data_root,
            connectivity: ConnectivityHandle::new(true),
            flight: Mutex::new(FlightState::Idle),
            #[cfg(test)]
            transport_override: std::sync::Mutex::new(None),
        })
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.engine = self.engine.with_progress(sink);
        self
    }

    /// Handle the platform's network monitor feeds; flipping it offline
    /// aborts in-flight HTTP work.
    pub fn connectivity(&self) -> ConnectivityHandle {
        self.connectivity.clone()
    }

    #[cfg(test)]
    fn set_transport_override(&self, transport: Arc<dyn SyncTransport>) {
        *self.transport_override.lock().unwrap() = Some(transport);
    }

    fn resolve_transport(&self, config: &SyncConfig) -> SyncResult<Arc<dyn SyncTransport>> {
        #[cfg(test)]
        if let Some(transport) = self.transport_override.lock().unwrap().clone() {
            return Ok(transport);
        }
        build_transport(config, &self.data_root)
    }

    /// Abort the cycle if any local mutation landed since `stamp` was
    /// captured; a queued follow-up will pick the edit up.
    fn ensure_unchanged(&self, stamp: i64) -> SyncResult<()> {
        if self.store.change_stamp() != stamp {
            Err(SyncError::LocalSyncAbort)
        } else {
            Ok(())
        }
    }

    async fn run_cycle(&self) -> SyncResult<Option<CycleSuccess>> {
        let settings = self.store.load_settings().await.map_err(store_error)?;
        let config = SyncConfig::from_settings(&settings);
        if config.backend == SyncBackendKind::Off {
            log::debug!("sync: backend is off, nothing to do");
            return Ok(None);
        }
        config.validate()?;
        let transport = self.resolve_transport(&config)?;

        let is_http = matches!(
            transport.kind(),
            SyncBackendKind::Webdav | SyncBackendKind::Cloud
        );
        if is_http && !self.connectivity.is_online() {
            return Err(SyncError::OfflinePaused);
        }

        let cancel = CancellationToken::new();
        let offline_abort = Arc::new(AtomicBool::new(false));
        let watcher = {
            let connectivity = self.connectivity.clone();
            let cancel = cancel.clone();
            let offline_abort = offline_abort.clone();
            tokio::spawn(async move {
                connectivity.went_offline().await;
                offline_abort.store(true, Ordering::SeqCst);
                cancel.cancel();
            })
        };

        let result = self.run_cycle_inner(&*transport, &cancel).await;
        watcher.abort();

        match result {
            Err(SyncError::Cancelled) if offline_abort.load(Ordering::SeqCst) => {
                Err(SyncError::OfflinePaused)
            }
            other => other,
        }
    }

    async fn run_cycle_inner(
        &self,
        transport: &dyn SyncTransport,
        cancel: &CancellationToken,
    ) -> SyncResult<Option<CycleSuccess>> {
        // Flush debounced UI writes, then pin the stamp the freshness
        // guard compares against.
        self.store.flush().await.map_err(store_error)?;
        let stamp = self.store.change_stamp();

        let mut local = self.store.load_data().await.map_err(store_error)?;

        log::debug!("sync: pre-upload pass");
        let prepare = self
            .engine
            .prepare_uploads(&mut local, transport, cancel)
            .await?;
        if prepare.uploaded > 0 || prepare.cleared_keys > 0 {
            log::info!(
                "sync: uploaded {} attachment(s), cleared {} stale cloud key(s)",
                prepare.uploaded,
                prepare.cleared_keys
            );
        }

        log::debug!("sync: reading remote document");
        let remote = match transport.read_document(cancel).await {
            Ok(remote) => remote,
            Err(SyncError::Parse(message)) => {
                // A mangled remote document is treated as absent; the next
                // write replaces it with the local state.
                log::warn!("sync: remote document unreadable, treating as empty: {}", message);
                None
            }
            Err(e) => return Err(e),
        };

        let output = merger::merge(&local, remote.as_ref(), Utc::now());

        self.ensure_unchanged(stamp)?;
        self.store.save_data(&output.data).await.map_err(store_error)?;
        // Our own write moved the stamp; later guards compare against the
        // post-write value.
        let stamp = self.store.change_stamp();

        self.ensure_unchanged(stamp)?;
        log::debug!("sync: writing remote document");
        transport.write_document(&output.data, cancel).await?;

        let mut merged = output.data.clone();
        let downloads = self
            .engine
            .process_downloads(&mut merged, transport, cancel)
            .await?;
        if downloads.downloaded > 0 {
            log::info!("sync: downloaded {} attachment(s)", downloads.downloaded);
        }

        self.ensure_unchanged(stamp)?;
        let cleanup = self
            .engine
            .cleanup(&mut merged, transport, cancel, Utc::now())
            .await?;
        if cleanup.ran {
            log::info!(
                "sync: cleanup deleted {} local / {} remote blob(s), purged {} tombstone(s)",
                cleanup.deleted_local,
                cleanup.deleted_remote,
                cleanup.purged
            );
        }

        // Attachment passes mutate in memory only; persist them now that
        // the cycle is past its failure points.
        self.ensure_unchanged(stamp)?;
        self.store.save_data(&merged).await.map_err(store_error)?;

        // Refresh the in-memory view for the UI collaborator.
        let _ = self.store.load_data().await.map_err(store_error)?;

        Ok(Some(CycleSuccess {
            stats: output.stats,
            merge_status: output.status,
            attachment_errors: downloads.errors,
        }))
    }

    /// Persist the cycle outcome into settings and the history ring.
    async fn record_outcome(&self, status: &str, stats: Option<&MergeStats>, error: Option<String>) {
        let at = Utc::now();
        let mut settings = match self.store.load_settings().await {
            Ok(settings) => settings,
            Err(e) => {
                log::error!("sync: cannot load settings to record outcome: {}", e);
                return;
            }
        };

        let stats_value = stats.and_then(|s| serde_json::to_value(s).ok());
        settings.record_sync_outcome(at, status, stats_value, error.clone());
        settings.push_history(SyncHistoryEntry {
            at,
            status: status.to_string(),
            conflicts: stats.map(MergeStats::total_conflicts).unwrap_or(0),
            conflict_ids: stats.map(MergeStats::all_conflict_ids).unwrap_or_default(),
            max_clock_skew_ms: stats.map(MergeStats::max_clock_skew_ms).unwrap_or(0),
            timestamp_adjustments: stats
                .map(MergeStats::total_timestamp_adjustments)
                .unwrap_or(0),
            error,
        });

        if let Err(e) = self.store.save_settings(&settings).await {
            log::error!("sync: failed to record outcome: {}", e);
        }
    }

    /// Run one cycle and translate the result into the outcome shape,
    /// recording history where the error taxonomy calls for it. Returns
    /// the outcome and whether a follow-up cycle should be queued.
    async fn run_cycle_guarded(&self) -> (SyncOutcome, bool) {
        match self.run_cycle().await {
            Ok(None) => (SyncOutcome::success(None), false),
            Ok(Some(cycle)) => {
                if cycle.attachment_errors.is_empty() {
                    self.record_outcome(cycle.merge_status.as_str(), Some(&cycle.stats), None)
                        .await;
                    (SyncOutcome::success(Some(cycle.stats)), false)
                } else {
                    let message = cycle
                        .attachment_errors
                        .iter()
                        .map(|(_, e)| sanitize_error_message(&e.to_string()))
                        .collect::<Vec<_>>()
                        .join("; ");
                    self.record_outcome("error", Some(&cycle.stats), Some(message.clone()))
                        .await;
                    (
                        SyncOutcome {
                            success: false,
                            stats: Some(cycle.stats),
                            error: Some(message),
                        },
                        false,
                    )
                }
            }
            Err(SyncError::LocalSyncAbort) => {
                log::info!("sync: local data changed mid-cycle, re-queuing");
                (SyncOutcome::success(None), true)
            }
            Err(SyncError::OfflinePaused) => {
                log::info!("sync: device offline, cycle paused");
                (SyncOutcome::success(None), false)
            }
            Err(SyncError::Cancelled) => {
                log::info!("sync: cycle cancelled");
                (SyncOutcome::success(None), false)
            }
            Err(e) => {
                let message = sanitize_error_message(&e.to_string());
                log::error!("sync: cycle failed ({}): {}", e.kind(), message);
                self.record_outcome("error", None, Some(message.clone())).await;
                (SyncOutcome::failure(message), false)
            }
        }
    }
}

fn store_error(e: DomainError) -> SyncError {
    match e {
        DomainError::Sync(sync) => sync,
        other => SyncError::Other(format!("store: {}", other)),
    }
}

enum FlightRole {
    Runner(watch::Sender<Option<SyncOutcome>>),
    Waiter(watch::Receiver<Option<SyncOutcome>>),
}

#[async_trait]
impl SyncService for SyncOrchestrator {
    async fn perform_sync(self: Arc<Self>) -> SyncOutcome {
        // Join the in-flight cycle when there is one; otherwise become the
        // runner. Waiters also queue the single follow-up cycle.
        let role = {
            let mut flight = self.flight.lock().await;
            match &mut *flight {
                FlightState::Idle => {
                    let (tx, rx) = watch::channel(None);
                    *flight = FlightState::Running {
                        result: rx,
                        pending: false,
                    };
                    FlightRole::Runner(tx)
                }
                FlightState::Running { result, pending } => {
                    *pending = true;
                    FlightRole::Waiter(result.clone())
                }
            }
        };

        let sender = match role {
            FlightRole::Waiter(mut rx) => {
                if rx.wait_for(Option::is_some).await.is_err() {
                    return SyncOutcome::failure("sync cycle dropped".to_string());
                }
                let outcome = rx.borrow().clone();
                return outcome
                    .unwrap_or_else(|| SyncOutcome::failure("sync cycle dropped".to_string()));
            }
            FlightRole::Runner(tx) => tx,
        };

        let (outcome, requeue_after_abort) = self.run_cycle_guarded().await;

        let follow_up = {
            let mut flight = self.flight.lock().await;
            let pending = matches!(&*flight, FlightState::Running { pending: true, .. });
            *flight = FlightState::Idle;
            pending || requeue_after_abort
        };
        let _ = sender.send(Some(outcome.clone()));

        if follow_up {
            let orchestrator = self.clone();
            tokio::spawn(async move {
                orchestrator.perform_sync().await;
            });
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::create_test_pool;
    use crate::db_migration::initialize_database;
    use crate::domains::sync::transport::testing::MemoryTransport;
    use crate::domains::sync::types::AppData;
    use crate::domains::task::{Task, TaskStatus};
    use chrono::{DateTime, Utc};
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    fn task(id: &str, title: &str, updated: &str) -> Task {
        let updated: DateTime<Utc> = updated.parse().unwrap();
        Task {
            id: id.to_string(),
            title: title.to_string(),
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
            attachments: vec![],
            order_num: None,
            is_focused_today: false,
            text_direction: None,
            time_estimate: None,
            description: None,
            created_at: updated,
            updated_at: updated,
            deleted_at: None,
            purged_at: None,
        }
    }

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    async fn orchestrator_with(
        dir: &TempDir,
        backend: &str,
    ) -> (Arc<SyncOrchestrator>, Arc<DataStore>) {
        init_logs();
        let pool = create_test_pool().await;
        initialize_database(&pool).await.unwrap();
        let store = Arc::new(DataStore::new(pool));

        let mut settings = store.load_settings().await.unwrap();
        settings.set("SYNC_BACKEND", Value::String(backend.to_string()));
        settings.set(
            "SYNC_PATH",
            Value::String(dir.path().join("share").display().to_string()),
        );
        settings.set(
            "WEBDAV_URL",
            Value::String("https://dav.example.com/gtd".to_string()),
        );
        store.save_settings(&settings).await.unwrap();

        let orchestrator = Arc::new(
            SyncOrchestrator::new(store.clone(), dir.path().to_path_buf()).unwrap(),
        );
        (orchestrator, store)
    }

    #[tokio::test]
    async fn fresh_clone_pulls_remote_dataset() {
        let dir = TempDir::new().unwrap();
        let (orchestrator, store) = orchestrator_with(&dir, "file").await;

        let mut remote = AppData::default();
        remote.tasks.push(task("T1", "Remote task", "2024-01-01T00:00:00Z"));
        let transport = Arc::new(MemoryTransport::with_document(remote.clone()));
        orchestrator.set_transport_override(transport.clone());

        let outcome = orchestrator.clone().perform_sync().await;
        assert!(outcome.success, "outcome: {:?}", outcome);
        let stats = outcome.stats.unwrap();
        assert_eq!(stats.total_conflicts(), 0);
        assert_eq!(stats.total_timestamp_adjustments(), 0);

        let local = store.load_data().await.unwrap();
        assert_eq!(local.tasks.len(), 1);
        assert_eq!(local.tasks[0].id, "T1");

        // Remote entities are untouched.
        let written = transport.remote_document().unwrap();
        assert_eq!(written.tasks, remote.tasks);

        // Outcome landed in settings and history.
        let settings = store.load_settings().await.unwrap();
        assert_eq!(settings.get_str("lastSyncStatus"), Some("success"));
        assert_eq!(settings.history().len(), 1);
    }

    #[tokio::test]
    async fn repeat_sync_is_idempotent_for_entities() {
        let dir = TempDir::new().unwrap();
        let (orchestrator, store) = orchestrator_with(&dir, "file").await;

        let mut remote = AppData::default();
        remote.tasks.push(task("T1", "Stable", "2024-01-01T00:00:00Z"));
        let transport = Arc::new(MemoryTransport::with_document(remote));
        orchestrator.set_transport_override(transport.clone());

        orchestrator.clone().perform_sync().await;
        let after_first = store.load_data().await.unwrap();
        let outcome = orchestrator.clone().perform_sync().await;
        let after_second = store.load_data().await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.stats.unwrap().total_conflicts(), 0);
        assert_eq!(after_first.tasks, after_second.tasks);
        assert_eq!(
            transport.remote_document().unwrap().tasks,
            after_second.tasks
        );
    }

    /// Transport that holds the document read open until released, to make
    /// overlap deterministic.
    struct SlowTransport {
        inner: MemoryTransport,
        delay: Duration,
        concurrent_reads: AtomicUsize,
        max_concurrent_reads: AtomicUsize,
    }

    #[async_trait]
    impl SyncTransport for SlowTransport {
        fn kind(&self) -> SyncBackendKind {
            SyncBackendKind::File
        }

        async fn read_document(
            &self,
            cancel: &CancellationToken,
        ) -> SyncResult<Option<AppData>> {
            let current = self.concurrent_reads.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent_reads.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.concurrent_reads.fetch_sub(1, Ordering::SeqCst);
            self.inner.read_document(cancel).await
        }

        async fn write_document(
            &self,
            data: &AppData,
            cancel: &CancellationToken,
        ) -> SyncResult<()> {
            self.inner.write_document(data, cancel).await
        }

        async fn get_file(&self, key: &str, cancel: &CancellationToken) -> SyncResult<Vec<u8>> {
            self.inner.get_file(key, cancel).await
        }

        async fn put_file(
            &self,
            key: &str,
            bytes: &[u8],
            mime_type: &str,
            cancel: &CancellationToken,
        ) -> SyncResult<()> {
            self.inner.put_file(key, bytes, mime_type, cancel).await
        }

        async fn delete_file(&self, key: &str, cancel: &CancellationToken) -> SyncResult<()> {
            self.inner.delete_file(key, cancel).await
        }

        async fn exists(&self, key: &str, cancel: &CancellationToken) -> SyncResult<bool> {
            self.inner.exists(key, cancel).await
        }
    }

    #[tokio::test]
    async fn concurrent_calls_share_one_cycle() {
        let dir = TempDir::new().unwrap();
        let (orchestrator, _store) = orchestrator_with(&dir, "file").await;

        let transport = Arc::new(SlowTransport {
            inner: MemoryTransport::new(),
            delay: Duration::from_millis(100),
            concurrent_reads: AtomicUsize::new(0),
            max_concurrent_reads: AtomicUsize::new(0),
        });
        orchestrator.set_transport_override(transport.clone());

        let first = tokio::spawn(orchestrator.clone().perform_sync());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = tokio::spawn(orchestrator.clone().perform_sync());

        let first = first.await.unwrap();
        let second = second.await.unwrap();

        assert_eq!(first, second);
        assert_eq!(transport.max_concurrent_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn local_edit_mid_cycle_aborts_and_requeues() {
        let dir = TempDir::new().unwrap();
        let (orchestrator, store) = orchestrator_with(&dir, "file").await;

        let transport = Arc::new(SlowTransport {
            inner: MemoryTransport::new(),
            delay: Duration::from_millis(100),
            concurrent_reads: AtomicUsize::new(0),
            max_concurrent_reads: AtomicUsize::new(0),
        });
        orchestrator.set_transport_override(transport.clone());

        let cycle = tokio::spawn(orchestrator.clone().perform_sync());
        tokio::time::sleep(Duration::from_millis(30)).await;

        // User edit while the cycle is reading the remote.
        let mut data = store.load_data().await.unwrap();
        data.tasks.push(task("T9", "Typed mid-sync", "2024-06-01T10:00:00Z"));
        store.save_data(&data).await.unwrap();

        // The interrupted cycle ends quietly.
        let outcome = cycle.await.unwrap();
        assert!(outcome.success);
        assert!(outcome.error.is_none());

        // The queued follow-up syncs the edit.
        let mut synced = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if let Some(doc) = transport.inner.remote_document() {
                if doc.tasks.iter().any(|t| t.id == "T9") {
                    synced = true;
                    break;
                }
            }
        }
        assert!(synced, "follow-up cycle never synced the edit");
    }

    #[tokio::test]
    async fn offline_device_pauses_without_error() {
        let dir = TempDir::new().unwrap();
        let (orchestrator, store) = orchestrator_with(&dir, "webdav").await;

        let transport =
            Arc::new(MemoryTransport::new().reporting_as(SyncBackendKind::Webdav));
        orchestrator.set_transport_override(transport.clone());
        orchestrator.connectivity().set_online(false);

        let outcome = orchestrator.clone().perform_sync().await;
        assert!(outcome.success);
        assert!(outcome.error.is_none());

        // Nothing reached the remote, nothing was recorded as an error.
        assert!(transport.remote_document().is_none());
        let settings = store.load_settings().await.unwrap();
        assert!(settings.get("lastSyncStatus").is_none());
        assert!(settings.history().is_empty());
    }

    #[tokio::test]
    async fn missing_configuration_fails_fast() {
        let dir = TempDir::new().unwrap();
        let pool = create_test_pool().await;
        initialize_database(&pool).await.unwrap();
        let store = Arc::new(DataStore::new(pool));

        let mut settings = store.load_settings().await.unwrap();
        settings.set("SYNC_BACKEND", Value::String("webdav".to_string()));
        store.save_settings(&settings).await.unwrap();

        let orchestrator = Arc::new(
            SyncOrchestrator::new(store.clone(), dir.path().to_path_buf()).unwrap(),
        );

        let outcome = orchestrator.perform_sync().await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("WEBDAV_URL"));

        let settings = store.load_settings().await.unwrap();
        assert_eq!(settings.get_str("lastSyncStatus"), Some("error"));
        assert_eq!(settings.history().len(), 1);
    }

    #[tokio::test]
    async fn off_backend_is_a_quiet_no_op() {
        let dir = TempDir::new().unwrap();
        let (orchestrator, store) = orchestrator_with(&dir, "off").await;

        let outcome = orchestrator.perform_sync().await;
        assert!(outcome.success);
        assert!(outcome.stats.is_none());
        assert!(store.load_settings().await.unwrap().history().is_empty());
    }
}
