use crate::domains::core::repository::{EntityRepository, FindById, UPSERT_CHUNK_SIZE};
use crate::domains::project::types::{Project, ProjectRow};
use crate::errors::{DbError, DomainError, DomainResult};
use crate::types::{PaginatedResult, PaginationParams};
use async_trait::async_trait;
use sqlx::{query, query_as, query_scalar, QueryBuilder, Sqlite, SqlitePool, Transaction};

/// Trait defining project repository operations
#[async_trait]
pub trait ProjectRepository: EntityRepository<Project> {
    /// Live projects matching a sanitized FTS expression.
    async fn search(&self, match_expr: &str) -> DomainResult<Vec<Project>>;
}

/// SQLite implementation for ProjectRepository
#[derive(Debug, Clone)]
pub struct SqliteProjectRepository {
    pool: SqlitePool,
}

impl SqliteProjectRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn map_row_to_entity(row: ProjectRow) -> DomainResult<Project> {
        row.into_entity()
    }

    fn bind_project<'q>(
        builder: &mut sqlx::query_builder::Separated<'_, 'q, Sqlite, &'static str>,
        project: &'q Project,
    ) -> DomainResult<()> {
        builder
            .push_bind(project.id.as_str())
            .push_bind(project.title.as_str())
            .push_bind(project.status.as_str())
            .push_bind(project.color.as_deref())
            .push_bind(project.order)
            .push_bind(encode_json("tag_ids", &project.tag_ids)?)
            .push_bind(project.is_sequential as i64)
            .push_bind(project.is_focused as i64)
            .push_bind(project.support_notes.as_deref())
            .push_bind(encode_json("attachments", &project.attachments)?)
            .push_bind(project.review_at.map(|t| t.to_rfc3339()))
            .push_bind(project.area_id.as_deref())
            .push_bind(project.area_title.as_deref())
            .push_bind(project.created_at.to_rfc3339())
            .push_bind(project.updated_at.to_rfc3339())
            .push_bind(project.deleted_at.map(|t| t.to_rfc3339()))
            .push_bind(project.purged_at.map(|t| t.to_rfc3339()));
        Ok(())
    }
}

fn encode_json<T: serde::Serialize>(field: &str, value: &T) -> DomainResult<String> {
    serde_json::to_string(value)
        .map_err(|e| DomainError::Internal(format!("serialize {}: {}", field, e)))
}

#[async_trait]
impl FindById<Project> for SqliteProjectRepository {
    async fn find_by_id(&self, id: &str) -> DomainResult<Project> {
        let row = query_as::<_, ProjectRow>("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::EntityNotFound("Project".to_string(), id.to_string()))?;

        Self::map_row_to_entity(row)
    }
}

#[async_trait]
impl EntityRepository<Project> for SqliteProjectRepository {
    fn table_name(&self) -> &'static str {
        "projects"
    }

    async fn find_page(&self, params: PaginationParams) -> DomainResult<PaginatedResult<Project>> {
        let offset = (params.page.saturating_sub(1) as i64) * params.per_page as i64;

        let total: i64 = query_scalar("SELECT COUNT(*) FROM projects")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;

        let rows = query_as::<_, ProjectRow>("SELECT * FROM projects ORDER BY id LIMIT ? OFFSET ?")
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
        entities: &[Project],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        for chunk in entities.chunks(UPSERT_CHUNK_SIZE) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO projects (id, title, status, color, order_num, tag_ids, \
                 is_sequential, is_focused, support_notes, attachments, review_at, \
                 area_id, area_title, created_at, updated_at, deleted_at, purged_at) ",
            );

            let mut bind_err = None;
            builder.push_values(chunk, |mut b, project| {
                if let Err(e) = Self::bind_project(&mut b, project) {
                    bind_err = Some(e);
                }
            });
            if let Some(e) = bind_err {
                return Err(e);
            }

            builder.push(
                " ON CONFLICT(id) DO UPDATE SET \
                 title = excluded.title, status = excluded.status, color = excluded.color, \
                 order_num = excluded.order_num, tag_ids = excluded.tag_ids, \
                 is_sequential = excluded.is_sequential, is_focused = excluded.is_focused, \
                 support_notes = excluded.support_notes, attachments = excluded.attachments, \
                 review_at = excluded.review_at, area_id = excluded.area_id, \
                 area_title = excluded.area_title, created_at = excluded.created_at, \
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
        let result =
            query("DELETE FROM projects WHERE id NOT IN (SELECT id FROM save_ids_projects)")
                .execute(&mut **tx)
                .await
                .map_err(DbError::from)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ProjectRepository for SqliteProjectRepository {
    async fn search(&self, match_expr: &str) -> DomainResult<Vec<Project>> {
        let rows = query_as::<_, ProjectRow>(
            "SELECT p.* FROM projects p \
             JOIN projects_fts ON projects_fts.rowid = p.rowid \
             WHERE projects_fts MATCH ? AND p.deleted_at IS NULL \
             ORDER BY projects_fts.rank",
        )
        .bind(match_expr)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DbError::Fts(format!("project search failed: {}", e)))?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(Self::map_row_to_entity(row)?);
        }
        Ok(items)
    }
}
