use crate::domains::settings::types::Settings;
use crate::errors::{DbError, DomainError, DomainResult};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{query, query_scalar, Sqlite, SqlitePool, Transaction};

/// Repository for the settings singleton row (id = 1).
#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn load(&self) -> DomainResult<Settings>;
    async fn save(&self, settings: &Settings) -> DomainResult<()>;
    async fn save_with_tx<'t>(
        &self,
        settings: &Settings,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteSettingsRepository {
    pool: SqlitePool,
}

impl SqliteSettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn encode(settings: &Settings) -> DomainResult<String> {
        serde_json::to_string(settings)
            .map_err(|e| DomainError::Internal(format!("serialize settings: {}", e)))
    }
}

#[async_trait]
impl SettingsRepository for SqliteSettingsRepository {
    async fn load(&self) -> DomainResult<Settings> {
        let raw: Option<String> = query_scalar("SELECT data FROM settings WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?;

        match raw {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| DomainError::Internal(format!("corrupt settings row: {}", e))),
            None => Ok(Settings::new()),
        }
    }

    async fn save(&self, settings: &Settings) -> DomainResult<()> {
        let json = Self::encode(settings)?;
        query(
            "INSERT INTO settings (id, data, updated_at) VALUES (1, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
        )
        .bind(json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }

    async fn save_with_tx<'t>(
        &self,
        settings: &Settings,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let json = Self::encode(settings)?;
        query(
            "INSERT INTO settings (id, data, updated_at) VALUES (1, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
        )
        .bind(json)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }
}
