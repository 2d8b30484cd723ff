use crate::domains::attachment::Attachment;
use crate::errors::DomainResult;
use crate::types::{parse_datetime, parse_datetime_opt, parse_json_column};
use crate::validation::{Validate, ValidationBuilder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    #[default]
    Active,
    Someday,
    Waiting,
    Archived,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Active => "active",
            ProjectStatus::Someday => "someday",
            ProjectStatus::Waiting => "waiting",
            ProjectStatus::Archived => "archived",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ProjectStatus::Active),
            "someday" => Some(ProjectStatus::Someday),
            "waiting" => Some(ProjectStatus::Waiting),
            "archived" => Some(ProjectStatus::Archived),
            _ => None,
        }
    }
}

/// Project entity - a multi-step outcome grouping tasks and sections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub status: ProjectStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
    #[serde(default)]
    pub tag_ids: Vec<String>,
    #[serde(default)]
    pub is_sequential: bool,
    #[serde(default)]
    pub is_focused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub support_notes: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area_id: Option<String>,
    /// Denormalized area name, carried for devices that render the project
    /// list before areas have loaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area_title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purged_at: Option<DateTime<Utc>>,
}

impl Project {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

impl Validate for Project {
    fn validate(&self) -> DomainResult<()> {
        ValidationBuilder::new("id", Some(self.id.clone()))
            .required()
            .max_length(128)
            .validate()?;

        ValidationBuilder::new("title", Some(self.title.clone()))
            .required()
            .max_length(1000)
            .validate()?;

        if let Some(color) = &self.color {
            ValidationBuilder::new("color", Some(color.clone()))
                .hex_color()
                .validate()?;
        }

        for attachment in &self.attachments {
            attachment.validate()?;
        }

        Ok(())
    }
}

/// ProjectRow - SQLite row representation for mapping from the database
#[derive(Debug, Clone, FromRow)]
pub struct ProjectRow {
    pub id: String,
    pub title: String,
    pub status: String,
    pub color: Option<String>,
    pub order_num: Option<i64>,
    pub tag_ids: String,
    pub is_sequential: i64,
    pub is_focused: i64,
    pub support_notes: Option<String>,
    pub attachments: String,
    pub review_at: Option<String>,
    pub area_id: Option<String>,
    pub area_title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
    pub purged_at: Option<String>,
}

impl ProjectRow {
    pub fn into_entity(self) -> DomainResult<Project> {
        let status = ProjectStatus::from_str(&self.status).unwrap_or_default();

        Ok(Project {
            id: self.id,
            title: self.title,
            status,
            color: self.color,
            order: self.order_num,
            tag_ids: parse_json_column("tag_ids", &self.tag_ids)?,
            is_sequential: self.is_sequential != 0,
            is_focused: self.is_focused != 0,
            support_notes: self.support_notes,
            attachments: parse_json_column("attachments", &self.attachments)?,
            review_at: parse_datetime_opt("review_at", &self.review_at)?,
            area_id: self.area_id,
            area_title: self.area_title,
            created_at: parse_datetime("created_at", &self.created_at)?,
            updated_at: parse_datetime("updated_at", &self.updated_at)?,
            deleted_at: parse_datetime_opt("deleted_at", &self.deleted_at)?,
            purged_at: parse_datetime_opt("purged_at", &self.purged_at)?,
        })
    }
}
