//! Snapshot: the full key -> value mapping exchanged in one sync cycle.

use crate::model::{is_snapshot_key, Bookmark, ContextRecord};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

/// Value stored under a snapshot key.
///
/// Lists are bookmark lists, objects are context records; the shape of the
/// JSON decides, not the key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SnapshotValue {
    Bookmarks(Vec<Bookmark>),
    Context(ContextRecord),
}

impl SnapshotValue {
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        match value {
            Value::Array(_) => serde_json::from_value(value).map(SnapshotValue::Bookmarks),
            Value::Object(_) => serde_json::from_value(value).map(SnapshotValue::Context),
            other => Err(serde::de::Error::custom(format!(
                "expected a context record or bookmark list, found {other}"
            ))),
        }
    }

    pub fn to_json(&self) -> Value {
        // Both variants are plain data; serialization cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Drop the entry or bookmark whose id equals `id`.
    pub fn remove_id(&mut self, id: &str) {
        match self {
            SnapshotValue::Bookmarks(list) => list.retain(|b| b.id != id),
            SnapshotValue::Context(record) => record.entries.retain(|e| e.id != id),
        }
    }

    /// Whether the value holds no entries / bookmarks.
    pub fn is_empty(&self) -> bool {
        match self {
            SnapshotValue::Bookmarks(list) => list.is_empty(),
            SnapshotValue::Context(record) => record.entries.is_empty(),
        }
    }
}

/// Ordered mapping from storage key to value.
///
/// A `BTreeMap` keeps serialization and iteration order deterministic, which
/// keeps content fingerprints stable for identical snapshots.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct Snapshot(BTreeMap<String, SnapshotValue>);

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a remote document leniently.
    ///
    /// Anything that is not a JSON object decodes as an empty snapshot. Keys
    /// whose values fail to decode are skipped with a warning rather than
    /// failing the whole document.
    pub fn from_json(value: Value) -> Self {
        let Value::Object(map) = value else {
            if !value.is_null() {
                warn!("Remote snapshot is not a JSON object, treating as empty");
            }
            return Self::default();
        };
        Self::from_entries(map)
    }

    /// Build from raw local store entries, keeping only snapshot keys.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mut snapshot = Self::default();
        for (key, value) in entries {
            if !is_snapshot_key(&key) {
                continue;
            }
            match SnapshotValue::from_json(value) {
                Ok(v) => {
                    snapshot.0.insert(key, v);
                }
                Err(e) => warn!(key = %key, "Skipping malformed snapshot value: {}", e),
            }
        }
        snapshot
    }

    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .0
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        Value::Object(map)
    }

    pub fn get(&self, key: &str) -> Option<&SnapshotValue> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: SnapshotValue) {
        self.0.insert(key.into(), value);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SnapshotValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn context(&self, key: &str) -> Option<&ContextRecord> {
        match self.0.get(key) {
            Some(SnapshotValue::Context(record)) => Some(record),
            _ => None,
        }
    }

    pub fn bookmarks(&self, key: &str) -> Option<&[Bookmark]> {
        match self.0.get(key) {
            Some(SnapshotValue::Bookmarks(list)) => Some(list),
            _ => None,
        }
    }

    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut SnapshotValue> {
        self.0.values_mut()
    }

    pub(crate) fn entry(
        &mut self,
        key: String,
    ) -> std::collections::btree_map::Entry<'_, String, SnapshotValue> {
        self.0.entry(key)
    }
}

impl IntoIterator for Snapshot {
    type Item = (String, SnapshotValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, SnapshotValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<(String, SnapshotValue)> for Snapshot {
    fn from_iter<T: IntoIterator<Item = (String, SnapshotValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
