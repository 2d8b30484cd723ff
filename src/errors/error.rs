use serde::Serialize;
use thiserror::Error;

/// Database errors
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Record not found: {0} with ID {1}")]
    NotFound(String, String),

    #[error("Database is locked")]
    Locked,

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Full-text index error: {0}")]
    Fts(String),

    #[error("Database error: {0}")]
    Other(String),
}

/// Manual Clone implementation for DbError
impl Clone for DbError {
    fn clone(&self) -> Self {
        match self {
            DbError::Sqlx(err) => DbError::Other(format!("SQLx error: {}", err)),
            DbError::Transaction(s) => DbError::Transaction(s.clone()),
            DbError::Query(s) => DbError::Query(s.clone()),
            DbError::NotFound(s1, s2) => DbError::NotFound(s1.clone(), s2.clone()),
            DbError::Locked => DbError::Locked,
            DbError::Migration(s) => DbError::Migration(s.clone()),
            DbError::Fts(s) => DbError::Fts(s.clone()),
            DbError::Other(s) => DbError::Other(s.clone()),
        }
    }
}

impl Serialize for DbError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Domain-level errors
#[derive(Debug, Error, Clone, Serialize)]
pub enum DomainError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Entity not found: {0} with ID {1}")]
    EntityNotFound(String, String),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("File error: {0}")]
    File(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Service-level errors (application specific)
#[derive(Debug, Error, Clone, Serialize)]
pub enum ServiceError {
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("External service error: {0}")]
    ExternalService(String),
}

impl From<SyncError> for ServiceError {
    fn from(err: SyncError) -> Self {
        ServiceError::Domain(DomainError::Sync(err))
    }
}

impl From<DbError> for ServiceError {
    fn from(err: DbError) -> Self {
        ServiceError::Domain(DomainError::Database(err))
    }
}

/// Sync-specific errors. Variants map onto the behaviors a cycle needs to
/// distinguish: fail fast, retry, surface, or swallow.
#[derive(Debug, Error, Clone, Serialize)]
pub enum SyncError {
    /// Missing or invalid backend configuration. Never retried.
    #[error("Sync configuration error: {0}")]
    Configuration(String),

    /// Network unreachable, or the cycle was aborted by an offline
    /// transition. Not recorded as an error.
    #[error("Sync paused: device is offline")]
    OfflinePaused,

    /// Timeout, connection reset, 5xx, 429. Retried with backoff.
    #[error("Transient transport error: {0}")]
    Transient(String),

    /// Remote rejected our request with 429/503 rate limiting.
    #[error("Rate limited by remote (HTTP {status})")]
    RateLimited { status: u16 },

    /// 401/403. Never retried.
    #[error("{message}")]
    Auth { status: u16, message: String },

    /// The remote has no blob under the requested key.
    #[error("Remote file not found: {0}")]
    RemoteMissing(String),

    /// Document bytes could not be parsed even after sanitization.
    #[error("Remote document is not valid JSON: {0}")]
    Parse(String),

    /// Downloaded attachment bytes did not match the recorded hash.
    #[error("Attachment {attachment_id} failed hash verification")]
    Integrity { attachment_id: String },

    /// The local store was mutated while the cycle was in flight.
    #[error("Local data changed during sync; cycle aborted")]
    LocalSyncAbort,

    /// Cooperative cancellation fired mid-operation.
    #[error("Sync cancelled")]
    Cancelled,

    #[error("Sync error: {0}")]
    Other(String),
}

impl SyncError {
    /// Whether a transport retry loop may attempt this operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_) | SyncError::RateLimited { .. })
    }

    /// Whether the failure is an offline condition rather than a real error.
    pub fn is_offline(&self) -> bool {
        matches!(self, SyncError::OfflinePaused)
    }

    /// Classify a reqwest failure. Connect-level failures are treated as
    /// offline so the cycle can end quietly instead of recording an error.
    pub fn from_http(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return SyncError::Transient(format!("request timed out: {}", err));
        }
        if err.is_connect() {
            return SyncError::OfflinePaused;
        }
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), &err.to_string());
        }
        SyncError::Transient(err.to_string())
    }

    /// Classify an HTTP status that arrived with a response body.
    pub fn from_status(status: u16, detail: &str) -> Self {
        match status {
            401 | 403 => SyncError::Auth {
                status,
                message: format!("Remote unauthorized ({}). Check URL and credentials", status),
            },
            429 | 503 => SyncError::RateLimited { status },
            s if s >= 500 => SyncError::Transient(format!("server error {}: {}", s, detail)),
            s => SyncError::Other(format!("unexpected status {}: {}", s, detail)),
        }
    }
}

/// Validation errors
#[derive(Debug, Error, Clone, Serialize)]
pub enum ValidationError {
    #[error("Field '{field}' is required")]
    Required { field: String },

    #[error("Field '{field}' must be at least {min} characters")]
    MinLength { field: String, min: usize },

    #[error("Field '{field}' cannot exceed {max} characters")]
    MaxLength { field: String, max: usize },

    #[error("Field '{field}' contains invalid format: {reason}")]
    Format { field: String, reason: String },

    #[error("Field '{field}' contains an invalid value: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Entity is invalid: {0}")]
    Entity(String),

    #[error("Validation error: {0}")]
    Custom(String),
}

impl ValidationError {
    pub fn required(field: &str) -> Self {
        Self::Required { field: field.to_string() }
    }

    pub fn min_length(field: &str, min: usize) -> Self {
        Self::MinLength { field: field.to_string(), min }
    }

    pub fn max_length(field: &str, max: usize) -> Self {
        Self::MaxLength { field: field.to_string(), max }
    }

    pub fn format(field: &str, reason: &str) -> Self {
        Self::Format {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_value(field: &str, reason: &str) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn entity(message: &str) -> Self {
        Self::Entity(message.to_string())
    }

    pub fn custom(message: &str) -> Self {
        Self::Custom(message.to_string())
    }
}

impl SyncError {
    /// Short stable label used in history entries and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Configuration(_) => "configuration",
            SyncError::OfflinePaused => "offline",
            SyncError::Transient(_) => "transient",
            SyncError::RateLimited { .. } => "rate_limited",
            SyncError::Auth { .. } => "auth",
            SyncError::RemoteMissing(_) => "remote_missing",
            SyncError::Parse(_) => "parse",
            SyncError::Integrity { .. } => "integrity",
            SyncError::LocalSyncAbort => "local_abort",
            SyncError::Cancelled => "cancelled",
            SyncError::Other(_) => "other",
        }
    }
}
