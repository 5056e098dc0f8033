//! Point-in-time captures of every entity's severity and structural diffs
//! between two captures ("nominal vs current", or "then vs now").

use crate::entity::{Entity, EntityDelta, EntityKey, EntityMap, LayerAttributes};
use crate::error::MonitorError;
use crate::severity::SeverityLevel;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub severity: SeverityLevel,
    #[serde(default)]
    pub annotation: String,
    /// When the entity entered `severity`.
    #[serde(default)]
    pub since_unix_ms: Option<i64>,
    #[serde(default)]
    pub attributes: LayerAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub system_name: String,
    pub captured_at_unix_ms: i64,
    pub entries: BTreeMap<EntityKey, SnapshotEntry>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &EntityKey) -> Option<&SnapshotEntry> {
        self.entries.get(key)
    }

    pub fn severity_of(&self, key: &EntityKey) -> Option<SeverityLevel> {
        self.entries.get(key).map(|e| e.severity)
    }

    /// Reconstitutes entities, each with a single transition.
    pub fn restore_entities(&self) -> EntityMap {
        self.entries
            .iter()
            .map(|(key, entry)| {
                let entity = Entity::restore(
                    key.clone(),
                    entry.severity,
                    entry.annotation.clone(),
                    entry.since_unix_ms.unwrap_or(self.captured_at_unix_ms),
                    entry.attributes.clone(),
                );
                (key.clone(), entity)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityChange {
    pub from: SeverityLevel,
    pub to: SeverityLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub added: BTreeSet<EntityKey>,
    pub removed: BTreeSet<EntityKey>,
    pub changed: BTreeMap<EntityKey, SeverityChange>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }

    /// The diff in the opposite direction.
    pub fn inverted(&self) -> SnapshotDiff {
        SnapshotDiff {
            added: self.removed.clone(),
            removed: self.added.clone(),
            changed: self
                .changed
                .iter()
                .map(|(k, c)| {
                    (
                        k.clone(),
                        SeverityChange {
                            from: c.to,
                            to: c.from,
                        },
                    )
                })
                .collect(),
        }
    }
}

pub fn capture<'a>(
    system_name: &str,
    entities: impl IntoIterator<Item = &'a Entity>,
    at_unix_ms: i64,
) -> Snapshot {
    let entries = entities
        .into_iter()
        .map(|e| {
            let last = e.last_transition();
            (
                e.key().clone(),
                SnapshotEntry {
                    severity: e.current_severity(),
                    annotation: last.map(|t| t.annotation.clone()).unwrap_or_default(),
                    since_unix_ms: last.map(|t| t.at_unix_ms),
                    attributes: e.attributes().clone(),
                },
            )
        })
        .collect();
    Snapshot {
        system_name: system_name.to_string(),
        captured_at_unix_ms: at_unix_ms,
        entries,
    }
}

/// Keys only in `b` are added, keys only in `a` removed; shared keys are
/// reported when their severity differs. Timestamps are never compared.
pub fn diff(a: &Snapshot, b: &Snapshot) -> SnapshotDiff {
    let mut out = SnapshotDiff::default();
    for (key, entry) in &b.entries {
        match a.entries.get(key) {
            None => {
                out.added.insert(key.clone());
            }
            Some(prev) if prev.severity != entry.severity => {
                out.changed.insert(
                    key.clone(),
                    SeverityChange {
                        from: prev.severity,
                        to: entry.severity,
                    },
                );
            }
            Some(_) => {}
        }
    }
    for key in a.entries.keys() {
        if !b.entries.contains_key(key) {
            out.removed.insert(key.clone());
        }
    }
    out
}

/// Attribute deltas for every entity present in both snapshots, for
/// "how much changed since then" questions.
pub fn deltas(
    earlier: &Snapshot,
    later: &Snapshot,
) -> Result<BTreeMap<EntityKey, EntityDelta>, MonitorError> {
    let before = earlier.restore_entities();
    let after = later.restore_entities();
    let mut out = BTreeMap::new();
    for (key, entity) in &after {
        if let Some(prev) = before.get(key) {
            out.insert(key.clone(), entity.diff_against(prev)?);
        }
    }
    Ok(out)
}
