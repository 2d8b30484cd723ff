use crate::errors::DomainResult;
use crate::types::{PaginatedResult, PaginationParams};
use async_trait::async_trait;
use sqlx::{Sqlite, Transaction};

/// Rows written per multi-row upsert statement batch.
pub const UPSERT_CHUNK_SIZE: usize = 200;

/// Trait for finding entities by ID
#[async_trait]
pub trait FindById<T> {
    /// Find an entity by ID, tombstoned or not.
    async fn find_by_id(&self, id: &str) -> DomainResult<T>;
}

/// Operations every synced entity repository supports. The store facade
/// drives these inside a single save transaction.
#[async_trait]
pub trait EntityRepository<T>: FindById<T> + Send + Sync {
    /// The backing table name (also the temp-id table suffix).
    fn table_name(&self) -> &'static str;

    /// One page of rows ordered by id, including tombstones.
    async fn find_page(&self, params: PaginationParams) -> DomainResult<PaginatedResult<T>>;

    /// Upsert a slice of entities within the caller's transaction.
    /// Callers chunk to `UPSERT_CHUNK_SIZE`.
    async fn upsert_batch_with_tx<'t>(
        &self,
        entities: &[T],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    /// Delete every row whose id is not in the save set for this
    /// transaction (ids were staged into the temp id table beforehand).
    async fn prune_missing_with_tx<'t>(
        &self,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64>;
}
