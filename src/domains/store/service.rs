use crate::domains::area::{Area, SqliteAreaRepository};
use crate::domains::core::repository::EntityRepository;
use crate::domains::project::{Project, SqliteProjectRepository};
use crate::domains::section::{Section, SqliteSectionRepository};
use crate::domains::settings::repository::{SettingsRepository, SqliteSettingsRepository};
use crate::domains::settings::Settings;
use crate::domains::sync::types::AppData;
use crate::domains::task::{SqliteTaskRepository, Task};
use crate::errors::{DbError, DomainError, DomainResult};
use crate::types::PaginationParams;
use crate::validation::Validate;
use chrono::{Duration, Utc};
use sqlx::{query, query_scalar, QueryBuilder, Sqlite, SqlitePool, Transaction};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domains::project::repository::ProjectRepository;
use crate::domains::task::repository::TaskRepository;

/// Rows fetched per page when assembling the full dataset.
const READ_PAGE_SIZE: u32 = 1000;

/// Ids staged per INSERT into a temp id table.
const ID_STAGE_CHUNK: usize = 500;

/// Advisory FTS lock expiry.
const FTS_LOCK_TTL_MINUTES: i64 = 5;

/// FTS query tokens with operator meaning that plain search input must not
/// carry into MATCH.
const RESERVED_FTS_TOKENS: &[&str] = &["AND", "OR", "NOT", "NEAR"];

/// Results of a cross-entity search.
#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub tasks: Vec<Task>,
    pub projects: Vec<Project>,
}

/// The local metadata store: canonical owner of the on-disk dataset.
///
/// Wraps the per-entity repositories behind document-level operations and
/// publishes a monotonic change stamp the sync orchestrator uses to detect
/// concurrent local edits.
pub struct DataStore {
    pool: SqlitePool,
    tasks: SqliteTaskRepository,
    projects: SqliteProjectRepository,
    sections: SqliteSectionRepository,
    areas: SqliteAreaRepository,
    settings: SqliteSettingsRepository,
    data_change_stamp: AtomicI64,
    pending_save: Mutex<Option<AppData>>,
}

impl DataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            tasks: SqliteTaskRepository::new(pool.clone()),
            projects: SqliteProjectRepository::new(pool.clone()),
            sections: SqliteSectionRepository::new(pool.clone()),
            areas: SqliteAreaRepository::new(pool.clone()),
            settings: SqliteSettingsRepository::new(pool.clone()),
            pool,
            data_change_stamp: AtomicI64::new(0),
            pending_save: Mutex::new(None),
        }
    }

    /// Monotonic stamp incremented on every local mutation.
    pub fn change_stamp(&self) -> i64 {
        self.data_change_stamp.load(Ordering::SeqCst)
    }

    fn bump_stamp(&self) {
        self.data_change_stamp.fetch_add(1, Ordering::SeqCst);
    }

    /// Stash a full snapshot for a later `flush`. UI code paths debounce
    /// their writes through here; the stamp moves immediately so an
    /// in-flight sync cycle notices the edit.
    pub async fn queue_save(&self, data: AppData) {
        let mut pending = self.pending_save.lock().await;
        *pending = Some(data);
        self.bump_stamp();
    }

    /// Persist the queued snapshot, if any.
    pub async fn flush(&self) -> DomainResult<()> {
        let pending = {
            let mut guard = self.pending_save.lock().await;
            guard.take()
        };
        if let Some(data) = pending {
            self.save_data(&data).await?;
        }
        Ok(())
    }

    /// Persist an entire dataset in a single transaction: prune rows absent
    /// from the snapshot, upsert everything else in chunks, and write the
    /// settings singleton.
    pub async fn save_data(&self, data: &AppData) -> DomainResult<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let task_ids: Vec<&str> = data.tasks.iter().map(|t| t.id.as_str()).collect();
        let project_ids: Vec<&str> = data.projects.iter().map(|p| p.id.as_str()).collect();
        let section_ids: Vec<&str> = data.sections.iter().map(|s| s.id.as_str()).collect();
        let area_ids: Vec<&str> = data.areas.iter().map(|a| a.id.as_str()).collect();

        stage_ids(&mut tx, self.tasks.table_name(), &task_ids).await?;
        stage_ids(&mut tx, self.projects.table_name(), &project_ids).await?;
        stage_ids(&mut tx, self.sections.table_name(), &section_ids).await?;
        stage_ids(&mut tx, self.areas.table_name(), &area_ids).await?;

        self.tasks.prune_missing_with_tx(&mut tx).await?;
        self.projects.prune_missing_with_tx(&mut tx).await?;
        self.sections.prune_missing_with_tx(&mut tx).await?;
        self.areas.prune_missing_with_tx(&mut tx).await?;

        self.tasks.upsert_batch_with_tx(&data.tasks, &mut tx).await?;
        self.projects
            .upsert_batch_with_tx(&data.projects, &mut tx)
            .await?;
        self.sections
            .upsert_batch_with_tx(&data.sections, &mut tx)
            .await?;
        self.areas.upsert_batch_with_tx(&data.areas, &mut tx).await?;

        self.settings.save_with_tx(&data.settings, &mut tx).await?;

        tx.commit().await.map_err(DbError::from)?;
        self.bump_stamp();
        Ok(())
    }

    /// Assemble the full dataset with paged reads.
    pub async fn load_data(&self) -> DomainResult<AppData> {
        Ok(AppData {
            tasks: load_all(&self.tasks).await?,
            projects: load_all(&self.projects).await?,
            sections: load_all(&self.sections).await?,
            areas: load_all(&self.areas).await?,
            settings: self.settings.load().await?,
        })
    }

    pub async fn load_settings(&self) -> DomainResult<Settings> {
        self.settings.load().await
    }

    /// Persist settings alone, without touching entity tables. Does not
    /// bump the change stamp: sync bookkeeping writes must not abort the
    /// cycle that makes them.
    pub async fn save_settings(&self, settings: &Settings) -> DomainResult<()> {
        self.settings.save(settings).await
    }

    // -- entity CRUD used by the UI collaborator --------------------------

    pub async fn upsert_task(&self, task: &Task) -> DomainResult<()> {
        task.validate()?;
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        self.tasks
            .upsert_batch_with_tx(std::slice::from_ref(task), &mut tx)
            .await?;
        tx.commit().await.map_err(DbError::from)?;
        self.bump_stamp();
        Ok(())
    }

    pub async fn upsert_project(&self, project: &Project) -> DomainResult<()> {
        project.validate()?;
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        self.projects
            .upsert_batch_with_tx(std::slice::from_ref(project), &mut tx)
            .await?;
        tx.commit().await.map_err(DbError::from)?;
        self.bump_stamp();
        Ok(())
    }

    pub async fn upsert_section(&self, section: &Section) -> DomainResult<()> {
        section.validate()?;
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        self.sections
            .upsert_batch_with_tx(std::slice::from_ref(section), &mut tx)
            .await?;
        tx.commit().await.map_err(DbError::from)?;
        self.bump_stamp();
        Ok(())
    }

    pub async fn upsert_area(&self, area: &Area) -> DomainResult<()> {
        area.validate()?;
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        self.areas
            .upsert_batch_with_tx(std::slice::from_ref(area), &mut tx)
            .await?;
        tx.commit().await.map_err(DbError::from)?;
        self.bump_stamp();
        Ok(())
    }

    /// Tombstone a task; the row stays for merge dominance.
    pub async fn soft_delete_task(&self, id: &str) -> DomainResult<()> {
        let now = Utc::now().to_rfc3339();
        let result = query("UPDATE tasks SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(&now)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DomainError::EntityNotFound("Task".to_string(), id.to_string()));
        }
        self.bump_stamp();
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> DomainResult<Task> {
        use crate::domains::core::repository::FindById;
        self.tasks.find_by_id(id).await
    }

    // -- search -----------------------------------------------------------

    /// Cross-entity FTS search. On index failure the indices are rebuilt
    /// under the advisory lock and the query retried once.
    pub async fn search_all(&self, raw_query: &str) -> DomainResult<SearchResults> {
        let Some(match_expr) = sanitize_fts_query(raw_query) else {
            return Ok(SearchResults::default());
        };

        match self.run_search(&match_expr).await {
            Ok(results) => Ok(results),
            Err(DomainError::Database(DbError::Fts(first_err))) => {
                log::warn!("search failed ({}), rebuilding FTS indices", first_err);
                self.rebuild_fts().await?;
                self.run_search(&match_expr).await
            }
            Err(e) => Err(e),
        }
    }

    async fn run_search(&self, match_expr: &str) -> DomainResult<SearchResults> {
        Ok(SearchResults {
            tasks: self.tasks.search(match_expr).await?,
            projects: self.projects.search(match_expr).await?,
        })
    }

    /// Rebuild both FTS indices from their base tables, serialized through
    /// the fts_lock advisory row.
    pub async fn rebuild_fts(&self) -> DomainResult<()> {
        let owner = Uuid::new_v4().to_string();
        self.acquire_fts_lock(&owner).await?;

        let result = self.rebuild_fts_inner().await;

        // Release even when the rebuild failed; a stale lock would block
        // repairs for the TTL window.
        if let Err(e) = self.release_fts_lock(&owner).await {
            log::error!("failed to release fts_lock: {}", e);
        }

        result
    }

    async fn rebuild_fts_inner(&self) -> DomainResult<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        query("INSERT INTO tasks_fts(tasks_fts) VALUES('delete-all')")
            .execute(&mut *tx)
            .await
            .map_err(|e| DbError::Fts(format!("tasks_fts delete-all: {}", e)))?;
        query(
            "INSERT INTO tasks_fts(rowid, title, description, tags, contexts) \
             SELECT rowid, title, coalesce(description, ''), tags, contexts FROM tasks",
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| DbError::Fts(format!("tasks_fts rebuild: {}", e)))?;

        query("INSERT INTO projects_fts(projects_fts) VALUES('delete-all')")
            .execute(&mut *tx)
            .await
            .map_err(|e| DbError::Fts(format!("projects_fts delete-all: {}", e)))?;
        query(
            "INSERT INTO projects_fts(rowid, title, support_notes) \
             SELECT rowid, title, coalesce(support_notes, '') FROM projects",
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| DbError::Fts(format!("projects_fts rebuild: {}", e)))?;

        tx.commit().await.map_err(DbError::from)?;
        Ok(())
    }

    async fn acquire_fts_lock(&self, owner: &str) -> DomainResult<()> {
        let cutoff = (Utc::now() - Duration::minutes(FTS_LOCK_TTL_MINUTES)).to_rfc3339();
        query("DELETE FROM fts_lock WHERE locked_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;

        query("INSERT OR IGNORE INTO fts_lock (id, locked_at, owner) VALUES (1, ?, ?)")
            .bind(Utc::now().to_rfc3339())
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;

        let holder: Option<String> = query_scalar("SELECT owner FROM fts_lock WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?;

        if holder.as_deref() == Some(owner) {
            Ok(())
        } else {
            Err(DomainError::Database(DbError::Locked))
        }
    }

    async fn release_fts_lock(&self, owner: &str) -> DomainResult<()> {
        query("DELETE FROM fts_lock WHERE id = 1 AND owner = ?")
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    /// (base rows, fts rows) per indexed table, for consistency checks.
    pub async fn fts_counts(&self) -> DomainResult<((i64, i64), (i64, i64))> {
        let tasks: i64 = query_scalar("SELECT COUNT(*) FROM tasks")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;
        let tasks_fts: i64 = query_scalar("SELECT COUNT(*) FROM tasks_fts")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;
        let projects: i64 = query_scalar("SELECT COUNT(*) FROM projects")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;
        let projects_fts: i64 = query_scalar("SELECT COUNT(*) FROM projects_fts")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(((tasks, tasks_fts), (projects, projects_fts)))
    }
}

async fn load_all<T, R>(repo: &R) -> DomainResult<Vec<T>>
where
    R: EntityRepository<T>,
{
    let mut items = Vec::new();
    let mut page = 1u32;
    loop {
        let params = PaginationParams {
            page,
            per_page: READ_PAGE_SIZE,
        };
        let result = repo.find_page(params).await?;
        let fetched = result.items.len();
        items.extend(result.items);
        if fetched < READ_PAGE_SIZE as usize {
            return Ok(items);
        }
        page += 1;
    }
}

/// Stage the ids of a save set into the per-connection temp table the prune
/// step diffs against.
async fn stage_ids<'t>(
    tx: &mut Transaction<'t, Sqlite>,
    table: &str,
    ids: &[&str],
) -> DomainResult<()> {
    let temp_table = format!("save_ids_{}", table);

    let create = format!(
        "CREATE TEMP TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY)",
        temp_table
    );
    query(&create).execute(&mut **tx).await.map_err(DbError::from)?;

    let clear = format!("DELETE FROM {}", temp_table);
    query(&clear).execute(&mut **tx).await.map_err(DbError::from)?;

    for chunk in ids.chunks(ID_STAGE_CHUNK) {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("INSERT OR IGNORE INTO {} (id) ", temp_table));
        builder.push_values(chunk, |mut b, id| {
            b.push_bind(*id);
        });
        builder
            .build()
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;
    }

    Ok(())
}

/// Turn raw UI input into an FTS5 MATCH expression: control characters
/// stripped, reserved operator tokens dropped, each remaining term quoted
/// and prefix-matched, terms joined with implicit AND.
fn sanitize_fts_query(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();

    let terms: Vec<String> = cleaned
        .split_whitespace()
        .filter(|t| !RESERVED_FTS_TOKENS.contains(t))
        .map(|t| format!("\"{}\"*", t.replace('"', "")))
        .filter(|t| t != "\"\"*")
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::create_test_pool;
    use crate::db_migration::initialize_database;
    use crate::domains::task::TaskStatus;
    use chrono::DateTime;

    fn task(id: &str, title: &str) -> Task {
        let now: DateTime<Utc> = "2024-06-01T10:00:00Z".parse().unwrap();
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
            created_at: now,
            updated_at: now,
            deleted_at: None,
            purged_at: None,
        }
    }

    async fn store() -> DataStore {
        let pool = create_test_pool().await;
        initialize_database(&pool).await.unwrap();
        DataStore::new(pool)
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let store = store().await;
        let mut data = AppData::default();
        data.tasks.push(task("T1", "Buy milk"));
        data.tasks.push(task("T2", "Call plumber"));

        store.save_data(&data).await.unwrap();
        let loaded = store.load_data().await.unwrap();
        assert_eq!(loaded.tasks.len(), 2);
        assert_eq!(loaded, data);
    }

    #[tokio::test]
    async fn save_prunes_rows_missing_from_snapshot() {
        let store = store().await;
        let mut data = AppData::default();
        data.tasks.push(task("T1", "Keep"));
        data.tasks.push(task("T2", "Drop"));
        store.save_data(&data).await.unwrap();

        data.tasks.retain(|t| t.id == "T1");
        store.save_data(&data).await.unwrap();

        let loaded = store.load_data().await.unwrap();
        assert_eq!(loaded.tasks.len(), 1);
        assert_eq!(loaded.tasks[0].id, "T1");
    }

    #[tokio::test]
    async fn change_stamp_advances_on_mutation() {
        let store = store().await;
        let before = store.change_stamp();
        store.save_data(&AppData::default()).await.unwrap();
        assert!(store.change_stamp() > before);

        let stamped = store.change_stamp();
        store.queue_save(AppData::default()).await;
        assert!(store.change_stamp() > stamped);
        store.flush().await.unwrap();
    }

    #[tokio::test]
    async fn fts_counts_match_after_save() {
        let store = store().await;
        let mut data = AppData::default();
        for i in 0..5 {
            data.tasks.push(task(&format!("T{}", i), &format!("Task {}", i)));
        }
        store.save_data(&data).await.unwrap();

        let ((tasks, tasks_fts), (projects, projects_fts)) = store.fts_counts().await.unwrap();
        assert_eq!(tasks, tasks_fts);
        assert_eq!(projects, projects_fts);
    }

    #[tokio::test]
    async fn search_finds_live_rows_only() {
        let store = store().await;
        let mut data = AppData::default();
        data.tasks.push(task("T1", "Water the plants"));
        let mut deleted = task("T2", "Water the lawn");
        deleted.deleted_at = Some(Utc::now());
        data.tasks.push(deleted);
        store.save_data(&data).await.unwrap();

        let results = store.search_all("water").await.unwrap();
        assert_eq!(results.tasks.len(), 1);
        assert_eq!(results.tasks[0].id, "T1");
    }

    #[tokio::test]
    async fn search_survives_index_rebuild() {
        let store = store().await;
        let mut data = AppData::default();
        data.tasks.push(task("T1", "Sharpen the saw"));
        store.save_data(&data).await.unwrap();

        store.rebuild_fts().await.unwrap();
        let results = store.search_all("sharpen").await.unwrap();
        assert_eq!(results.tasks.len(), 1);
    }

    #[test]
    fn fts_sanitization() {
        assert_eq!(
            sanitize_fts_query("water AND plants"),
            Some("\"water\"* \"plants\"*".to_string())
        );
        assert_eq!(sanitize_fts_query("NOT OR AND"), None);
        assert_eq!(sanitize_fts_query("  \u{0007} "), None);
        assert_eq!(
            sanitize_fts_query("say \"hello\""),
            Some("\"say\"* \"hello\"*".to_string())
        );
    }
}
