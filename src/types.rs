use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pagination parameters for store reads
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaginationParams {
    pub page: u32,
    pub per_page: u32,
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 1000,
        }
    }
}

/// Paginated result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatedResult<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
    pub total_pages: u32,
}

impl<T> PaginatedResult<T> {
    pub fn new(items: Vec<T>, total: u64, params: PaginationParams) -> Self {
        let total_pages = (total as f64 / params.per_page as f64).ceil() as u32;
        Self {
            items,
            total,
            page: params.page,
            per_page: params.per_page,
            total_pages,
        }
    }
}

/// Parse an RFC 3339 timestamp column, rejecting with the column name on failure.
pub fn parse_datetime(column: &str, raw: &str) -> Result<DateTime<Utc>, crate::errors::DomainError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            crate::errors::DomainError::Internal(format!(
                "invalid timestamp in column '{}': {} ({})",
                column, raw, e
            ))
        })
}

/// Parse a JSON text column into its typed form.
pub fn parse_json_column<T: serde::de::DeserializeOwned>(
    column: &str,
    raw: &str,
) -> Result<T, crate::errors::DomainError> {
    serde_json::from_str(raw).map_err(|e| {
        crate::errors::DomainError::Internal(format!("invalid JSON in column '{}': {}", column, e))
    })
}

/// Parse an optional RFC 3339 timestamp column.
pub fn parse_datetime_opt(
    column: &str,
    raw: &Option<String>,
) -> Result<Option<DateTime<Utc>>, crate::errors::DomainError> {
    match raw {
        Some(s) => parse_datetime(column, s).map(Some),
        None => Ok(None),
    }
}
