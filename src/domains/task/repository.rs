use crate::domains::core::repository::{EntityRepository, FindById, UPSERT_CHUNK_SIZE};
use crate::domains::task::types::{Task, TaskRow};
use crate::errors::{DbError, DomainError, DomainResult};
use crate::types::{PaginatedResult, PaginationParams};
use async_trait::async_trait;
use sqlx::{query, query_as, query_scalar, QueryBuilder, Sqlite, SqlitePool, Transaction};

/// Trait defining task repository operations
#[async_trait]
pub trait TaskRepository: EntityRepository<Task> {
    /// Live tasks matching a sanitized FTS expression.
    async fn search(&self, match_expr: &str) -> DomainResult<Vec<Task>>;
}

/// SQLite implementation for TaskRepository
#[derive(Debug, Clone)]
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn map_row_to_entity(row: TaskRow) -> DomainResult<Task> {
        row.into_entity()
    }

    fn bind_task<'q>(
        builder: &mut sqlx::query_builder::Separated<'_, 'q, Sqlite, &'static str>,
        task: &'q Task,
    ) -> DomainResult<()> {
        builder
            .push_bind(task.id.as_str())
            .push_bind(task.title.as_str())
            .push_bind(task.status.as_str())
            .push_bind(task.priority)
            .push_bind(task.project_id.as_deref())
            .push_bind(task.section_id.as_deref())
            .push_bind(task.area_id.as_deref())
            .push_bind(task.start_time.map(|t| t.to_rfc3339()))
            .push_bind(task.due_date.map(|t| t.to_rfc3339()))
            .push_bind(task.review_at.map(|t| t.to_rfc3339()))
            .push_bind(task.completed_at.map(|t| t.to_rfc3339()))
            .push_bind(
                task.recurrence
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .map_err(|e| DomainError::Internal(format!("serialize recurrence: {}", e)))?,
            )
            .push_bind(task.push_count)
            .push_bind(encode_json("tags", &task.tags)?)
            .push_bind(encode_json("contexts", &task.contexts)?)
            .push_bind(encode_json("checklist", &task.checklist)?)
            .push_bind(encode_json("attachments", &task.attachments)?)
            .push_bind(task.order_num)
            .push_bind(task.is_focused_today as i64)
            .push_bind(task.text_direction.as_deref())
            .push_bind(task.time_estimate)
            .push_bind(task.description.as_deref())
            .push_bind(task.created_at.to_rfc3339())
            .push_bind(task.updated_at.to_rfc3339())
            .push_bind(task.deleted_at.map(|t| t.to_rfc3339()))
            .push_bind(task.purged_at.map(|t| t.to_rfc3339()));
        Ok(())
    }
}

fn encode_json<T: serde::Serialize>(field: &str, value: &T) -> DomainResult<String> {
    serde_json::to_string(value)
        .map_err(|e| DomainError::Internal(format!("serialize {}: {}", field, e)))
}

#[async_trait]
impl FindById<Task> for SqliteTaskRepository {
    async fn find_by_id(&self, id: &str) -> DomainResult<Task> {
        let row = query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::EntityNotFound("Task".to_string(), id.to_string()))?;

        Self::map_row_to_entity(row)
    }
}

#[async_trait]
impl EntityRepository<Task> for SqliteTaskRepository {
    fn table_name(&self) -> &'static str {
        "tasks"
    }

    async fn find_page(&self, params: PaginationParams) -> DomainResult<PaginatedResult<Task>> {
        let offset = (params.page.saturating_sub(1) as i64) * params.per_page as i64;

        let total: i64 = query_scalar("SELECT COUNT(*) FROM tasks")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;

        let rows = query_as::<_, TaskRow>("SELECT * FROM tasks ORDER BY id LIMIT ? OFFSET ?")
            .bind(params.per_page as i64)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(Self::map_row_to_entity(row)?);
        }

        Ok(PaginatedResult::new(items, total as u64, params))
    }

    async fn upsert_batch_with_tx<'t>(
        &self,
        entities: &[Task],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        for chunk in entities.chunks(UPSERT_CHUNK_SIZE) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO tasks (id, title, status, priority, project_id, section_id, \
                 area_id, start_time, due_date, review_at, completed_at, recurrence, \
                 push_count, tags, contexts, checklist, attachments, order_num, \
                 is_focused_today, text_direction, time_estimate, description, \
                 created_at, updated_at, deleted_at, purged_at) ",
            );

            let mut bind_err = None;
            builder.push_values(chunk, |mut b, task| {
                if let Err(e) = Self::bind_task(&mut b, task) {
                    bind_err = Some(e);
                }
            });
            if let Some(e) = bind_err {
                return Err(e);
            }

            builder.push(
                " ON CONFLICT(id) DO UPDATE SET \
                 title = excluded.title, status = excluded.status, \
                 priority = excluded.priority, project_id = excluded.project_id, \
                 section_id = excluded.section_id, area_id = excluded.area_id, \
                 start_time = excluded.start_time, due_date = excluded.due_date, \
                 review_at = excluded.review_at, completed_at = excluded.completed_at, \
                 recurrence = excluded.recurrence, push_count = excluded.push_count, \
                 tags = excluded.tags, contexts = excluded.contexts, \
                 checklist = excluded.checklist, attachments = excluded.attachments, \
                 order_num = excluded.order_num, is_focused_today = excluded.is_focused_today, \
                 text_direction = excluded.text_direction, time_estimate = excluded.time_estimate, \
                 description = excluded.description, created_at = excluded.created_at, \
                 updated_at = excluded.updated_at, deleted_at = excluded.deleted_at, \
                 purged_at = excluded.purged_at",
            );

            builder
                .build()
                .execute(&mut **tx)
                .await
                .map_err(DbError::from)?;
        }

        Ok(())
    }

    async fn prune_missing_with_tx<'t>(
        &self,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64> {
        let result = query("DELETE FROM tasks WHERE id NOT IN (SELECT id FROM save_ids_tasks)")
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn search(&self, match_expr: &str) -> DomainResult<Vec<Task>> {
        let rows = query_as::<_, TaskRow>(
            "SELECT t.* FROM tasks t \
             JOIN tasks_fts ON tasks_fts.rowid = t.rowid \
             WHERE tasks_fts MATCH ? AND t.deleted_at IS NULL \
             ORDER BY tasks_fts.rank",
        )
        .bind(match_expr)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DbError::Fts(format!("task search failed: {}", e)))?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(Self::map_row_to_entity(row)?);
        }
        Ok(items)
    }
}
