//! In-memory results keyed by volume index.
//!
//! One coarse mutex guards the map. Writers replace whole entries, so a
//! reader sees either the old entry or the new one, never a mix. Snapshots
//! copy the map under the lock and serialize outside it.

use crate::error::{AppResult, PipelineError};
use crate::volume::VolumeIndex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

/// Key under which lookups report whether an entry exists.
pub const FOUND_KEY: &str = "foundResults";

/// Result payload for one volume: flat JSON fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultEntry(Map<String, Value>);

impl ResultEntry {
    /// An entry without fields.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a field, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Adds or replaces a field.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Field value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the entry has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The underlying field map.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for ResultEntry {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Thread-safe map from volume index to [`ResultEntry`].
#[derive(Debug, Default)]
pub struct ResultsStore {
    entries: Mutex<BTreeMap<VolumeIndex, ResultEntry>>,
}

impl ResultsStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<VolumeIndex, ResultEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or replaces the entry for `index`.
    pub fn put(&self, index: VolumeIndex, entry: ResultEntry) {
        self.lock().insert(index, entry);
    }

    /// Entry for `index`, if any.
    pub fn get(&self, index: VolumeIndex) -> Option<ResultEntry> {
        self.lock().get(&index).cloned()
    }

    /// Query answer for `index`: `{"foundResults": true, ...fields}` or
    /// `{"foundResults": false}`.
    pub fn lookup(&self, index: VolumeIndex) -> Value {
        Self::found_response(self.get(index))
    }

    /// Wraps an optional entry into the query answer.
    pub fn found_response(entry: Option<ResultEntry>) -> Value {
        let mut response = Map::new();
        match entry {
            Some(entry) => {
                response.insert(FOUND_KEY.to_string(), Value::Bool(true));
                for (k, v) in entry.0 {
                    if k != FOUND_KEY {
                        response.insert(k, v);
                    }
                }
            }
            None => {
                response.insert(FOUND_KEY.to_string(), Value::Bool(false));
            }
        }
        Value::Object(response)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Indices with entries, ascending.
    pub fn indices(&self) -> Vec<VolumeIndex> {
        self.lock().keys().copied().collect()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Point-in-time copy of all entries.
    pub fn entries(&self) -> BTreeMap<VolumeIndex, ResultEntry> {
        self.lock().clone()
    }

    /// Writes all entries as pretty JSON keyed by index string.
    ///
    /// The document goes to a temporary sibling first and is renamed into
    /// place, so `path` never holds a partial snapshot.
    pub fn snapshot(&self, path: &Path) -> AppResult<()> {
        let copy = self.entries();
        let document: BTreeMap<String, &ResultEntry> =
            copy.iter().map(|(k, v)| (k.to_string(), v)).collect();
        let json = serde_json::to_string_pretty(&document)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;

        info!(path = %path.display(), entries = copy.len(), "results snapshot written");
        Ok(())
    }

    /// Rebuilds a store from a snapshot file.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let document: BTreeMap<String, ResultEntry> = serde_json::from_str(&text)?;
        let mut entries = BTreeMap::new();
        for (key, entry) in document {
            let index: VolumeIndex = key.parse().map_err(|_| {
                PipelineError::Protocol(format!(
                    "snapshot key '{key}' is not a volume index"
                ))
            })?;
            entries.insert(index, entry);
        }
        Ok(Self {
            entries: Mutex::new(entries),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn put_then_get_returns_last_write() {
        let store = ResultsStore::new();
        store.put(1, ResultEntry::new().with("testResult", 1.0));
        store.put(1, ResultEntry::new().with("testResult", 2.0));

        assert_eq!(store.get(1).unwrap().get("testResult"), Some(&json!(2.0)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn lookup_reports_found_flag() {
        let store = ResultsStore::new();
        store.put(0, ResultEntry::new().with("testResult", 1000.1));

        assert_eq!(
            store.lookup(0),
            json!({"foundResults": true, "testResult": 1000.1})
        );
        assert_eq!(store.lookup(99), json!({"foundResults": false}));
    }

    #[test]
    fn entry_cannot_spoof_found_flag() {
        let store = ResultsStore::new();
        store.put(0, ResultEntry::new().with(FOUND_KEY, false));
        assert_eq!(store.lookup(0), json!({"foundResults": true}));
    }

    #[test]
    fn clear_empties_the_store() {
        let store = ResultsStore::new();
        store.put(3, ResultEntry::new());
        store.clear();
        assert!(store.is_empty());
        assert!(store.get(3).is_none());
    }

    #[test]
    fn snapshot_is_keyed_by_index_string() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("results.json");
        let store = ResultsStore::new();
        store.put(2, ResultEntry::new().with("meanSignal", 10.5));
        store.put(10, ResultEntry::new().with("meanSignal", 11.0));

        store.snapshot(&path).unwrap();

        let value: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value, json!({"2": {"meanSignal": 10.5}, "10": {"meanSignal": 11.0}}));
        let reloaded = ResultsStore::load(&path).unwrap();
        assert_eq!(reloaded.indices(), vec![2, 10]);
        assert_eq!(reloaded.entries(), store.entries());
    }

    #[test]
    fn load_rejects_non_numeric_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.json");
        std::fs::write(&path, r#"{"first": {}}"#).unwrap();
        assert!(ResultsStore::load(&path).is_err());
    }
}
