use crate::domains::settings::{Settings, SyncHistoryEntry, HISTORY_CAPACITY, RESERVED_OBJECT_KEYS};
use serde_json::Value;

/// Merge the settings blobs: shallow, remote overlaying local, except for
/// the keys with their own rules — reserved sub-objects merge one level
/// deep, `lastSyncHistory` is unioned, and `externalCalendars` stays
/// whatever the local device pulled from its provider.
pub fn merge_settings(local: &Settings, remote: &Settings) -> Settings {
    let mut merged = local.clone();

    for (key, remote_value) in &remote.0 {
        match key.as_str() {
            "externalCalendars" => continue,
            "lastSyncHistory" => continue,
            k if RESERVED_OBJECT_KEYS.contains(&k) => {
                match (merged.0.get_mut(key), remote_value.as_object()) {
                    (Some(Value::Object(local_obj)), Some(remote_obj)) => {
                        for (sub_key, sub_value) in remote_obj {
                            local_obj.insert(sub_key.clone(), sub_value.clone());
                        }
                    }
                    _ => {
                        merged.0.insert(key.clone(), remote_value.clone());
                    }
                }
            }
            _ => {
                merged.0.insert(key.clone(), remote_value.clone());
            }
        }
    }

    let history = merge_history(local.history(), remote.history());
    if !history.is_empty() {
        if let Ok(value) = serde_json::to_value(&history) {
            merged.0.insert("lastSyncHistory".to_string(), value);
        }
    }

    merged
}

fn merge_history(
    local: Vec<SyncHistoryEntry>,
    remote: Vec<SyncHistoryEntry>,
) -> Vec<SyncHistoryEntry> {
    let mut entries = local;
    for entry in remote {
        if !entries.iter().any(|e| e.at == entry.at) {
            entries.push(entry);
        }
    }
    entries.sort_by(|a, b| b.at.cmp(&a.at));
    entries.truncate(HISTORY_CAPACITY);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn entry(at: &str, status: &str) -> SyncHistoryEntry {
        SyncHistoryEntry {
            at: at.parse().unwrap(),
            status: status.to_string(),
            conflicts: 0,
            conflict_ids: vec![],
            max_clock_skew_ms: 0,
            timestamp_adjustments: 0,
            error: None,
        }
    }

    #[test]
    fn remote_overlays_plain_keys() {
        let mut local = Settings::new();
        local.set("theme", Value::String("dark".into()));
        local.set("localOnly", Value::Bool(true));
        let mut remote = Settings::new();
        remote.set("theme", Value::String("light".into()));

        let merged = merge_settings(&local, &remote);
        assert_eq!(merged.get_str("theme"), Some("light"));
        assert_eq!(merged.get("localOnly"), Some(&Value::Bool(true)));
    }

    #[test]
    fn reserved_objects_merge_one_level_deep() {
        let mut local = Settings::new();
        local.set(
            "gtd",
            serde_json::json!({"weeklyReviewDay": "friday", "inboxZero": true}),
        );
        let mut remote = Settings::new();
        remote.set("gtd", serde_json::json!({"weeklyReviewDay": "sunday"}));

        let merged = merge_settings(&local, &remote);
        let gtd = merged.get("gtd").unwrap().as_object().unwrap();
        assert_eq!(gtd.get("weeklyReviewDay").unwrap(), "sunday");
        // A sub-key only the local side has survives the overlay.
        assert_eq!(gtd.get("inboxZero").unwrap(), &Value::Bool(true));
    }

    #[test]
    fn external_calendars_stay_local() {
        let mut local = Settings::new();
        local.set("externalCalendars", serde_json::json!(["work.ics"]));
        let mut remote = Settings::new();
        remote.set("externalCalendars", serde_json::json!(["other-device.ics"]));

        let merged = merge_settings(&local, &remote);
        assert_eq!(
            merged.get("externalCalendars"),
            Some(&serde_json::json!(["work.ics"]))
        );

        // A device with no provider list does not inherit the remote one.
        let empty = Settings::new();
        let merged = merge_settings(&empty, &remote);
        assert!(merged.get("externalCalendars").is_none());
    }

    #[test]
    fn history_union_sorts_desc_and_truncates() {
        let mut local = Settings::new();
        let mut remote = Settings::new();
        for day in 1..=8 {
            local.push_history(entry(&format!("2024-01-{:02}T00:00:00Z", day), "success"));
        }
        for day in 5..=12 {
            remote.push_history(entry(&format!("2024-01-{:02}T00:00:00Z", day), "success"));
        }

        let merged = merge_settings(&local, &remote);
        let history = merged.history();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(
            history[0].at,
            "2024-01-12T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        // Shared timestamps appear once.
        let times: Vec<_> = history.iter().map(|e| e.at).collect();
        let mut deduped = times.clone();
        deduped.dedup();
        assert_eq!(times, deduped);
    }
}
