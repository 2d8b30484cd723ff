use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Ring-buffer capacity of `lastSyncHistory`.
pub const HISTORY_CAPACITY: usize = 10;

/// Reserved sub-objects that merge one level deep instead of being replaced
/// wholesale. `externalCalendars` is deliberately absent: the device-local
/// list is authoritative and re-injected after merge.
pub const RESERVED_OBJECT_KEYS: &[&str] = &["ai", "gtd", "features", "diagnostics", "attachments"];

/// One entry of the sync history ring buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHistoryEntry {
    pub at: DateTime<Utc>,
    /// "success" | "conflict" | "error"
    pub status: String,
    #[serde(default)]
    pub conflicts: u32,
    #[serde(default)]
    pub conflict_ids: Vec<String>,
    #[serde(default)]
    pub max_clock_skew_ms: i64,
    #[serde(default)]
    pub timestamp_adjustments: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Free-form settings blob. Stored as one JSON object in the singleton
/// settings row and carried verbatim inside the sync document; typed
/// accessors cover the keys the engine itself reads and writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Settings(pub Map<String, Value>);

impl Settings {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) {
        self.0.remove(key);
    }

    fn object_mut(&mut self, key: &str) -> &mut Map<String, Value> {
        let entry = self
            .0
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        entry.as_object_mut().unwrap()
    }

    fn nested_str(&self, object: &str, key: &str) -> Option<String> {
        self.0
            .get(object)?
            .as_object()?
            .get(key)?
            .as_str()
            .map(str::to_string)
    }

    /// `settings.attachments.lastCleanupAt` — gate for the orphan GC pass.
    pub fn last_cleanup_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.nested_str("attachments", "lastCleanupAt")?;
        DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn set_last_cleanup_at(&mut self, at: DateTime<Utc>) {
        self.object_mut("attachments")
            .insert("lastCleanupAt".to_string(), Value::String(at.to_rfc3339()));
    }

    pub fn external_calendars(&self) -> Option<&Value> {
        self.0.get("externalCalendars")
    }

    pub fn history(&self) -> Vec<SyncHistoryEntry> {
        self.0
            .get("lastSyncHistory")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Append a history entry, newest first, evicting past capacity.
    pub fn push_history(&mut self, entry: SyncHistoryEntry) {
        let mut entries = self.history();
        entries.insert(0, entry);
        entries.truncate(HISTORY_CAPACITY);
        if let Ok(value) = serde_json::to_value(&entries) {
            self.0.insert("lastSyncHistory".to_string(), value);
        }
    }

    /// Record the outcome of a completed cycle on the summary keys and the
    /// history ring. `error` must already be credential-sanitized.
    pub fn record_sync_outcome(
        &mut self,
        at: DateTime<Utc>,
        status: &str,
        stats: Option<Value>,
        error: Option<String>,
    ) {
        self.set("lastSyncAt", Value::String(at.to_rfc3339()));
        self.set("lastSyncStatus", Value::String(status.to_string()));
        match &error {
            Some(message) => self.set("lastSyncError", Value::String(message.clone())),
            None => self.remove("lastSyncError"),
        }
        match stats {
            Some(stats) => self.set("lastSyncStats", stats),
            None => self.remove("lastSyncStats"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(at: &str) -> SyncHistoryEntry {
        SyncHistoryEntry {
            at: at.parse().unwrap(),
            status: "success".to_string(),
            conflicts: 0,
            conflict_ids: vec![],
            max_clock_skew_ms: 0,
            timestamp_adjustments: 0,
            error: None,
        }
    }

    #[test]
    fn history_ring_evicts_oldest() {
        let mut settings = Settings::new();
        for day in 1..=12 {
            settings.push_history(entry(&format!("2024-01-{:02}T00:00:00Z", day)));
        }

        let history = settings.history();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        // Newest first; the two oldest entries fell off.
        assert_eq!(history[0].at, "2024-01-12T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert_eq!(history[9].at, "2024-01-03T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn cleanup_stamp_roundtrip() {
        let mut settings = Settings::new();
        assert!(settings.last_cleanup_at().is_none());

        let now = Utc::now();
        settings.set_last_cleanup_at(now);
        let read = settings.last_cleanup_at().unwrap();
        assert_eq!(read.timestamp(), now.timestamp());
    }

    #[test]
    fn record_outcome_clears_stale_error() {
        let mut settings = Settings::new();
        settings.record_sync_outcome(Utc::now(), "error", None, Some("boom".to_string()));
        assert_eq!(settings.get_str("lastSyncError"), Some("boom"));

        settings.record_sync_outcome(Utc::now(), "success", None, None);
        assert!(settings.get("lastSyncError").is_none());
        assert_eq!(settings.get_str("lastSyncStatus"), Some("success"));
    }
}
