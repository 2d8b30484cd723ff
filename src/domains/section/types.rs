use crate::errors::DomainResult;
use crate::types::{parse_datetime, parse_datetime_opt};
use crate::validation::{Validate, ValidationBuilder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Section entity - an ordered slice of a project's task list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub id: String,
    pub project_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
    #[serde(default)]
    pub is_collapsed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purged_at: Option<DateTime<Utc>>,
}

impl Section {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

impl Validate for Section {
    fn validate(&self) -> DomainResult<()> {
        ValidationBuilder::new("id", Some(self.id.clone()))
            .required()
            .max_length(128)
            .validate()?;

        ValidationBuilder::new("projectId", Some(self.project_id.clone()))
            .required()
            .validate()?;

        ValidationBuilder::new("title", Some(self.title.clone()))
            .required()
            .max_length(1000)
            .validate()?;

        Ok(())
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SectionRow {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub description: Option<String>,
    pub order_num: Option<i64>,
    pub is_collapsed: i64,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
    pub purged_at: Option<String>,
}

impl SectionRow {
    pub fn into_entity(self) -> DomainResult<Section> {
        Ok(Section {
            id: self.id,
            project_id: self.project_id,
            title: self.title,
            description: self.description,
            order: self.order_num,
            is_collapsed: self.is_collapsed != 0,
            created_at: parse_datetime("created_at", &self.created_at)?,
            updated_at: parse_datetime("updated_at", &self.updated_at)?,
            deleted_at: parse_datetime_opt("deleted_at", &self.deleted_at)?,
            purged_at: parse_datetime_opt("purged_at", &self.purged_at)?,
        })
    }
}
