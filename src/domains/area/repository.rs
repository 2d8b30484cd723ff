use crate::domains::area::types::{Area, AreaRow};
use crate::domains::core::repository::{EntityRepository, FindById, UPSERT_CHUNK_SIZE};
use crate::errors::{DbError, DomainError, DomainResult};
use crate::types::{PaginatedResult, PaginationParams};
use async_trait::async_trait;
use sqlx::{query, query_as, query_scalar, QueryBuilder, Sqlite, SqlitePool, Transaction};

/// SQLite repository for areas
#[derive(Debug, Clone)]
pub struct SqliteAreaRepository {
    pool: SqlitePool,
}

impl SqliteAreaRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FindById<Area> for SqliteAreaRepository {
    async fn find_by_id(&self, id: &str) -> DomainResult<Area> {
        let row = query_as::<_, AreaRow>("SELECT * FROM areas WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::EntityNotFound("Area".to_string(), id.to_string()))?;

        row.into_entity()
    }
}

#[async_trait]
impl EntityRepository<Area> for SqliteAreaRepository {
    fn table_name(&self) -> &'static str {
        "areas"
    }

    async fn find_page(&self, params: PaginationParams) -> DomainResult<PaginatedResult<Area>> {
        let offset = (params.page.saturating_sub(1) as i64) * params.per_page as i64;

        let total: i64 = query_scalar("SELECT COUNT(*) FROM areas")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;

        let rows = query_as::<_, AreaRow>("SELECT * FROM areas ORDER BY id LIMIT ? OFFSET ?")
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
        entities: &[Area],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        for chunk in entities.chunks(UPSERT_CHUNK_SIZE) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO areas (id, name, color, icon, order_num, created_at, \
                 updated_at, deleted_at, purged_at) ",
            );

            builder.push_values(chunk, |mut b, area| {
                b.push_bind(area.id.as_str())
                    .push_bind(area.name.as_str())
                    .push_bind(area.color.as_deref())
                    .push_bind(area.icon.as_deref())
                    .push_bind(area.order)
                    .push_bind(area.created_at.to_rfc3339())
                    .push_bind(area.updated_at.to_rfc3339())
                    .push_bind(area.deleted_at.map(|t| t.to_rfc3339()))
                    .push_bind(area.purged_at.map(|t| t.to_rfc3339()));
            });

            builder.push(
                " ON CONFLICT(id) DO UPDATE SET \
                 name = excluded.name, color = excluded.color, icon = excluded.icon, \
                 order_num = excluded.order_num, created_at = excluded.created_at, \
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
        let result = query("DELETE FROM areas WHERE id NOT IN (SELECT id FROM save_ids_areas)")
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;
        Ok(result.rows_affected())
    }
}
