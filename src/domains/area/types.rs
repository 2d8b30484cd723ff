use crate::errors::DomainResult;
use crate::types::{parse_datetime, parse_datetime_opt};
use crate::validation::{Validate, ValidationBuilder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Area entity - a life area grouping projects and loose tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Area {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purged_at: Option<DateTime<Utc>>,
}

impl Area {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

impl Validate for Area {
    fn validate(&self) -> DomainResult<()> {
        ValidationBuilder::new("id", Some(self.id.clone()))
            .required()
            .max_length(128)
            .validate()?;

        ValidationBuilder::new("name", Some(self.name.clone()))
            .required()
            .max_length(500)
            .validate()?;

        if let Some(color) = &self.color {
            ValidationBuilder::new("color", Some(color.clone()))
                .hex_color()
                .validate()?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AreaRow {
    pub id: String,
    pub name: String,
    pub color: Option<String>,
    pub icon: Option<String>,
    pub order_num: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
    pub purged_at: Option<String>,
}

impl AreaRow {
    pub fn into_entity(self) -> DomainResult<Area> {
        Ok(Area {
            id: self.id,
            name: self.name,
            color: self.color,
            icon: self.icon,
            order: self.order_num,
            created_at: parse_datetime("created_at", &self.created_at)?,
            updated_at: parse_datetime("updated_at", &self.updated_at)?,
            deleted_at: parse_datetime_opt("deleted_at", &self.deleted_at)?,
            purged_at: parse_datetime_opt("purged_at", &self.purged_at)?,
        })
    }
}
