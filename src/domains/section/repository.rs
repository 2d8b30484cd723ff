use crate::domains::core::repository::{EntityRepository, FindById, UPSERT_CHUNK_SIZE};
use crate::domains::section::types::{Section, SectionRow};
use crate::errors::{DbError, DomainError, DomainResult};
use crate::types::{PaginatedResult, PaginationParams};
use async_trait::async_trait;
use sqlx::{query, query_as, query_scalar, QueryBuilder, Sqlite, SqlitePool, Transaction};

/// SQLite repository for sections
#[derive(Debug, Clone)]
pub struct SqliteSectionRepository {
    pool: SqlitePool,
}

impl SqliteSectionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FindById<Section> for SqliteSectionRepository {
    async fn find_by_id(&self, id: &str) -> DomainResult<Section> {
        let row = query_as::<_, SectionRow>("SELECT * FROM sections WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::EntityNotFound("Section".to_string(), id.to_string()))?;

        row.into_entity()
    }
}

#[async_trait]
impl EntityRepository<Section> for SqliteSectionRepository {
    fn table_name(&self) -> &'static str {
        "sections"
    }

    async fn find_page(&self, params: PaginationParams) -> DomainResult<PaginatedResult<Section>> {
        let offset = (params.page.saturating_sub(1) as i64) * params.per_page as i64;

        let total: i64 = query_scalar("SELECT COUNT(*) FROM sections")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;

        let rows = query_as::<_, SectionRow>("SELECT * FROM sections ORDER BY id LIMIT ? OFFSET ?")
            .bind(params.per_page as i64)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(row.into_entity()?);
        }

        Ok(PaginatedResult::new(items, total as u64, params))
    }

    async fn upsert_batch_with_tx<'t>(
        &self,
        entities: &[Section],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        for chunk in entities.chunks(UPSERT_CHUNK_SIZE) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO sections (id, project_id, title, description, order_num, \
                 is_collapsed, created_at, updated_at, deleted_at, purged_at) ",
            );

            builder.push_values(chunk, |mut b, section| {
                b.push_bind(section.id.as_str())
                    .push_bind(section.project_id.as_str())
                    .push_bind(section.title.as_str())
                    .push_bind(section.description.as_deref())
                    .push_bind(section.order)
                    .push_bind(section.is_collapsed as i64)
                    .push_bind(section.created_at.to_rfc3339())
                    .push_bind(section.updated_at.to_rfc3339())
                    .push_bind(section.deleted_at.map(|t| t.to_rfc3339()))
                    .push_bind(section.purged_at.map(|t| t.to_rfc3339()));
            });

            builder.push(
                " ON CONFLICT(id) DO UPDATE SET \
                 project_id = excluded.project_id, title = excluded.title, \
                 description = excluded.description, order_num = excluded.order_num, \
                 is_collapsed = excluded.is_collapsed, created_at = excluded.created_at, \
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
            query("DELETE FROM sections WHERE id NOT IN (SELECT id FROM save_ids_sections)")
                .execute(&mut **tx)
                .await
                .map_err(DbError::from)?;
        Ok(result.rows_affected())
    }
}
