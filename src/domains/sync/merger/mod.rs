mod settings;

use crate::domains::area::Area;
use crate::domains::attachment::Attachment;
use crate::domains::project::Project;
use crate::domains::section::Section;
use crate::domains::sync::types::{
    AppData, EntityMergeStats, MergeOutput, MergeStats, MergeStatus,
};
use crate::domains::task::Task;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Two updates to the same entity within this window are deemed concurrent.
pub const SKEW_THRESHOLD_MS: i64 = 30_000;

/// Conflict ids recorded per entity type before capping.
const MAX_CONFLICT_IDS: usize = 20;

/// Accessors the generic merge needs from every synced entity.
pub trait Syncable: Clone + Serialize {
    fn entity_id(&self) -> &str;
    fn created(&self) -> DateTime<Utc>;
    fn updated(&self) -> DateTime<Utc>;
    fn set_updated(&mut self, at: DateTime<Utc>);
    fn deleted(&self) -> Option<DateTime<Utc>>;
    fn set_deleted(&mut self, at: Option<DateTime<Utc>>);

    fn attachments(&self) -> Option<&Vec<Attachment>> {
        None
    }
    fn attachments_mut(&mut self) -> Option<&mut Vec<Attachment>> {
        None
    }
}

macro_rules! impl_syncable {
    ($entity:ty) => {
        impl Syncable for $entity {
            fn entity_id(&self) -> &str {
                &self.id
            }
            fn created(&self) -> DateTime<Utc> {
                self.created_at
            }
            fn updated(&self) -> DateTime<Utc> {
                self.updated_at
            }
            fn set_updated(&mut self, at: DateTime<Utc>) {
                self.updated_at = at;
            }
            fn deleted(&self) -> Option<DateTime<Utc>> {
                self.deleted_at
            }
            fn set_deleted(&mut self, at: Option<DateTime<Utc>>) {
                self.deleted_at = at;
            }
        }
    };
    ($entity:ty, attachments) => {
        impl Syncable for $entity {
            fn entity_id(&self) -> &str {
                &self.id
            }
            fn created(&self) -> DateTime<Utc> {
                self.created_at
            }
            fn updated(&self) -> DateTime<Utc> {
                self.updated_at
            }
            fn set_updated(&mut self, at: DateTime<Utc>) {
                self.updated_at = at;
            }
            fn deleted(&self) -> Option<DateTime<Utc>> {
                self.deleted_at
            }
            fn set_deleted(&mut self, at: Option<DateTime<Utc>>) {
                self.deleted_at = at;
            }
            fn attachments(&self) -> Option<&Vec<Attachment>> {
                Some(&self.attachments)
            }
            fn attachments_mut(&mut self) -> Option<&mut Vec<Attachment>> {
                Some(&mut self.attachments)
            }
        }
    };
}

impl_syncable!(Task, attachments);
impl_syncable!(Project, attachments);
impl_syncable!(Section);
impl_syncable!(Area);

/// Three-way reconciliation of the local snapshot with a remote snapshot.
///
/// Pure and deterministic: no I/O, no clock reads beyond the `now` argument.
/// A missing remote means the local document is authoritative.
pub fn merge(local: &AppData, remote: Option<&AppData>, now: DateTime<Utc>) -> MergeOutput {
    let Some(remote) = remote else {
        return MergeOutput {
            data: local.clone(),
            stats: MergeStats::default(),
            status: MergeStatus::Success,
        };
    };

    let mut stats = MergeStats::default();
    let data = AppData {
        tasks: merge_entities(&local.tasks, &remote.tasks, now, &mut stats.tasks),
        projects: merge_entities(&local.projects, &remote.projects, now, &mut stats.projects),
        sections: merge_entities(&local.sections, &remote.sections, now, &mut stats.sections),
        areas: merge_entities(&local.areas, &remote.areas, now, &mut stats.areas),
        settings: settings::merge_settings(&local.settings, &remote.settings),
    };

    let status = if stats.total_conflicts() > 0 {
        MergeStatus::Conflict
    } else {
        MergeStatus::Success
    };

    MergeOutput { data, stats, status }
}

fn merge_entities<T: Syncable>(
    local: &[T],
    remote: &[T],
    now: DateTime<Utc>,
    stats: &mut EntityMergeStats,
) -> Vec<T> {
    let mut by_id: BTreeMap<&str, (Option<&T>, Option<&T>)> = BTreeMap::new();
    for entity in local {
        by_id.entry(entity.entity_id()).or_default().0 = Some(entity);
    }
    for entity in remote {
        by_id.entry(entity.entity_id()).or_default().1 = Some(entity);
    }

    let mut merged = Vec::with_capacity(by_id.len());
    for (_, pair) in by_id {
        let entity = match pair {
            (Some(ours), None) => ours.clone(),
            (None, Some(theirs)) => theirs.clone(),
            (Some(ours), Some(theirs)) => merge_pair(ours, theirs, stats),
            (None, None) => unreachable!(),
        };
        merged.push(clamp_future_timestamp(entity, now, stats));
    }
    merged
}

fn merge_pair<T: Syncable>(ours: &T, theirs: &T, stats: &mut EntityMergeStats) -> T {
    let skew_ms = (ours.updated() - theirs.updated()).num_milliseconds().abs();
    stats.max_clock_skew_ms = stats.max_clock_skew_ms.max(skew_ms);

    // Tombstone dominance: a deletion beats any concurrent edit, and the
    // earliest deletion time sticks.
    let our_deleted = ours.deleted();
    let their_deleted = theirs.deleted();
    if our_deleted.is_some() || their_deleted.is_some() {
        let mut winner = match (our_deleted, their_deleted) {
            (Some(_), None) => ours.clone(),
            (None, Some(_)) => theirs.clone(),
            _ => pick_winner(ours, theirs).clone(),
        };
        let earliest = match (our_deleted, their_deleted) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        winner.set_deleted(earliest);
        merge_attachment_lists(&mut winner, ours, theirs);
        return winner;
    }

    // Concurrent non-deleted edits within the skew window with observable
    // differences count as a conflict.
    if skew_ms <= SKEW_THRESHOLD_MS && observable_value(ours) != observable_value(theirs) {
        stats.conflicts += 1;
        if stats.conflict_ids.len() < MAX_CONFLICT_IDS {
            stats.conflict_ids.push(ours.entity_id().to_string());
        }
    }

    let mut winner = pick_winner(ours, theirs).clone();
    merge_attachment_lists(&mut winner, ours, theirs);
    winner
}

/// Last-writer-wins at entity granularity: greater updatedAt, then greater
/// createdAt; a full tie falls back to the smaller serialization so the
/// result cannot depend on argument order.
fn pick_winner<'a, T: Syncable>(ours: &'a T, theirs: &'a T) -> &'a T {
    match ours
        .updated()
        .cmp(&theirs.updated())
        .then(ours.created().cmp(&theirs.created()))
    {
        std::cmp::Ordering::Greater => ours,
        std::cmp::Ordering::Less => theirs,
        std::cmp::Ordering::Equal => {
            if observable_value(ours).to_string() <= observable_value(theirs).to_string() {
                ours
            } else {
                theirs
            }
        }
    }
}

/// Entity state relevant for conflict detection: everything except
/// `updatedAt`.
fn observable_value<T: Serialize>(entity: &T) -> serde_json::Value {
    let mut value = serde_json::to_value(entity).unwrap_or(serde_json::Value::Null);
    if let Some(map) = value.as_object_mut() {
        map.remove("updatedAt");
    }
    value
}

/// A winner's timestamp beyond `now + skew` came from a clock running
/// ahead; clamp it so timestamps stay monotone across devices.
fn clamp_future_timestamp<T: Syncable>(
    mut entity: T,
    now: DateTime<Utc>,
    stats: &mut EntityMergeStats,
) -> T {
    let horizon = now + Duration::milliseconds(SKEW_THRESHOLD_MS);
    if entity.updated() > horizon {
        entity.set_updated(now);
        stats.timestamp_adjustments += 1;
    }
    entity
}

/// Merge the winner's attachment array with the loser's by attachment id,
/// using the same tombstone-then-LWW rule, and union the blob bookkeeping
/// fields.
fn merge_attachment_lists<T: Syncable>(winner: &mut T, ours: &T, theirs: &T) {
    let (Some(our_list), Some(their_list)) = (ours.attachments(), theirs.attachments()) else {
        return;
    };

    let mut by_id: BTreeMap<&str, (Option<&Attachment>, Option<&Attachment>)> = BTreeMap::new();
    for attachment in our_list {
        by_id.entry(attachment.id.as_str()).or_default().0 = Some(attachment);
    }
    for attachment in their_list {
        by_id.entry(attachment.id.as_str()).or_default().1 = Some(attachment);
    }

    let mut merged = Vec::with_capacity(by_id.len());
    for (_, pair) in by_id {
        let attachment = match pair {
            (Some(a), None) => a.clone(),
            (None, Some(b)) => b.clone(),
            (Some(a), Some(b)) => merge_attachment_pair(a, b),
            (None, None) => unreachable!(),
        };
        merged.push(attachment);
    }

    if let Some(list) = winner.attachments_mut() {
        *list = merged;
    }
}

fn merge_attachment_pair(ours: &Attachment, theirs: &Attachment) -> Attachment {
    let (winner, loser) = match (ours.deleted_at, theirs.deleted_at) {
        (Some(_), None) => (ours, theirs),
        (None, Some(_)) => (theirs, ours),
        _ => {
            if ours.updated_at >= theirs.updated_at {
                (ours, theirs)
            } else {
                (theirs, ours)
            }
        }
    };

    let mut merged = winner.clone();

    // Tombstones keep the earliest deletion time, like entities do.
    if let (Some(a), Some(b)) = (ours.deleted_at, theirs.deleted_at) {
        merged.deleted_at = Some(a.min(b));
    }

    // Blob bookkeeping is unioned: a value one side is missing fills in
    // from the other; on disagreement the winner's stands.
    if merged.cloud_key.is_none() {
        merged.cloud_key = loser.cloud_key.clone();
    }
    if merged.file_hash.is_none() {
        merged.file_hash = loser.file_hash.clone();
    }
    if merged.size.is_none() {
        merged.size = loser.size;
    }

    merged
}
