use crate::domains::attachment::Attachment;
use crate::errors::DomainResult;
use crate::types::{parse_datetime, parse_datetime_opt, parse_json_column};
use crate::validation::{Validate, ValidationBuilder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// GTD bucket a task lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Inbox,
    Next,
    Waiting,
    Someday,
    Scheduled,
    Done,
    Archived,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Inbox => "inbox",
            TaskStatus::Next => "next",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Someday => "someday",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Done => "done",
            TaskStatus::Archived => "archived",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "inbox" => Some(TaskStatus::Inbox),
            "next" => Some(TaskStatus::Next),
            "waiting" => Some(TaskStatus::Waiting),
            "someday" => Some(TaskStatus::Someday),
            "scheduled" => Some(TaskStatus::Scheduled),
            "done" => Some(TaskStatus::Done),
            "archived" => Some(TaskStatus::Archived),
            _ => None,
        }
    }
}

/// Repeat rule carried verbatim from the editing device; `rule` is the
/// human preset ("weekly", "monthly", ...), `rrule` the expanded RFC 5545
/// string when one exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recurrence {
    pub rule: String,
    pub strategy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by_day: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rrule: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecklistItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub is_completed: bool,
}

/// Task entity - the central GTD record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Recurrence>,
    /// Times the task was deferred by a review pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_count: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub contexts: Vec<String>,
    #[serde(default)]
    pub checklist: Vec<ChecklistItem>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_num: Option<i64>,
    #[serde(default)]
    pub is_focused_today: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_direction: Option<String>,
    /// Minutes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_estimate: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purged_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

impl Validate for Task {
    fn validate(&self) -> DomainResult<()> {
        ValidationBuilder::new("id", Some(self.id.clone()))
            .required()
            .max_length(128)
            .validate()?;

        ValidationBuilder::new("title", Some(self.title.clone()))
            .required()
            .max_length(1000)
            .validate()?;

        for attachment in &self.attachments {
            attachment.validate()?;
        }

        Ok(())
    }
}

/// TaskRow - SQLite row representation for mapping from the database
#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub id: String,
    pub title: String,
    pub status: String,
    pub priority: Option<i64>,
    pub project_id: Option<String>,
    pub section_id: Option<String>,
    pub area_id: Option<String>,
    pub start_time: Option<String>,
    pub due_date: Option<String>,
    pub review_at: Option<String>,
    pub completed_at: Option<String>,
    pub recurrence: Option<String>,
    pub push_count: Option<i64>,
    pub tags: String,
    pub contexts: String,
    pub checklist: String,
    pub attachments: String,
    pub order_num: Option<i64>,
    pub is_focused_today: i64,
    pub text_direction: Option<String>,
    pub time_estimate: Option<i64>,
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
    pub purged_at: Option<String>,
}

impl TaskRow {
    pub fn into_entity(self) -> DomainResult<Task> {
        // Unknown statuses written by a newer app version degrade to inbox
        // rather than failing the whole load.
        let status = TaskStatus::from_str(&self.status).unwrap_or_default();

        let recurrence = match &self.recurrence {
            Some(raw) if !raw.is_empty() => Some(parse_json_column("recurrence", raw)?),
            _ => None,
        };

        Ok(Task {
            id: self.id,
            title: self.title,
            status,
            priority: self.priority,
            project_id: self.project_id,
            section_id: self.section_id,
            area_id: self.area_id,
            start_time: parse_datetime_opt("start_time", &self.start_time)?,
            due_date: parse_datetime_opt("due_date", &self.due_date)?,
            review_at: parse_datetime_opt("review_at", &self.review_at)?,
            completed_at: parse_datetime_opt("completed_at", &self.completed_at)?,
            recurrence,
            push_count: self.push_count,
            tags: parse_json_column("tags", &self.tags)?,
            contexts: parse_json_column("contexts", &self.contexts)?,
            checklist: parse_json_column("checklist", &self.checklist)?,
            attachments: parse_json_column("attachments", &self.attachments)?,
            order_num: self.order_num,
            is_focused_today: self.is_focused_today != 0,
            text_direction: self.text_direction,
            time_estimate: self.time_estimate,
            description: self.description,
            created_at: parse_datetime("created_at", &self.created_at)?,
            updated_at: parse_datetime("updated_at", &self.updated_at)?,
            deleted_at: parse_datetime_opt("deleted_at", &self.deleted_at)?,
            purged_at: parse_datetime_opt("purged_at", &self.purged_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_status_degrades_to_inbox() {
        assert_eq!(TaskStatus::from_str("someday"), Some(TaskStatus::Someday));
        assert_eq!(TaskStatus::from_str("brand-new-status"), None);
    }

    #[test]
    fn document_roundtrip_uses_camel_case() {
        let now = Utc::now();
        let task = Task {
            id: "T1".to_string(),
            title: "Write weekly review".to_string(),
            status: TaskStatus::Next,
            priority: Some(2),
            project_id: Some("P1".to_string()),
            section_id: None,
            area_id: None,
            start_time: None,
            due_date: None,
            review_at: None,
            completed_at: None,
            recurrence: None,
            push_count: None,
            tags: vec!["review".to_string()],
            contexts: vec!["@desk".to_string()],
            checklist: vec![],
            attachments: vec![],
            order_num: Some(1),
            is_focused_today: true,
            text_direction: None,
            time_estimate: Some(30),
            description: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            purged_at: None,
        };

        let json = serde_json::to_value(&task).unwrap();
        assert!(json.get("projectId").is_some());
        assert!(json.get("isFocusedToday").is_some());
        assert!(json.get("deletedAt").is_none());

        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn document_tolerates_missing_collections() {
        let raw = r#"{
            "id": "T9",
            "title": "Sparse",
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-01T00:00:00Z"
        }"#;
        let task: Task = serde_json::from_str(raw).unwrap();
        assert_eq!(task.status, TaskStatus::Inbox);
        assert!(task.tags.is_empty());
        assert!(task.attachments.is_empty());
    }
}
