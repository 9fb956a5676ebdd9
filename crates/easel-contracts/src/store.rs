use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

/// String key/value storage in the shape of browser local storage.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage quota exceeded: writing '{key}' needs {required} bytes, capacity is {capacity}")]
    QuotaExceeded {
        key: String,
        required: usize,
        capacity: usize,
    },
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("storage file {} holds a JSON {found}, not an object of entries", path.display())]
    NotAnObject { path: PathBuf, found: &'static str },
}

/// Bytes a set of entries occupies against a capacity: every key plus every value.
fn footprint<'a>(entries: impl Iterator<Item = (&'a str, &'a str)>) -> usize {
    entries.map(|(key, value)| key.len() + value.len()).sum()
}

fn check_capacity(
    capacity: Option<usize>,
    key: &str,
    value: &str,
    others: usize,
) -> Result<(), StoreError> {
    let Some(capacity) = capacity else {
        return Ok(());
    };
    let required = others + key.len() + value.len();
    if required > capacity {
        return Err(StoreError::QuotaExceeded {
            key: key.to_string(),
            required,
            capacity,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, String>,
    capacity: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity: Some(capacity),
        }
    }

    /// Seeds an entry without a capacity check.
    pub fn with_entry(mut self, key: &str, value: &str) -> Self {
        self.entries.insert(key.to_string(), value.to_string());
        self
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let others = footprint(
            self.entries
                .iter()
                .filter(|(existing, _)| existing.as_str() != key)
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        check_capacity(self.capacity, key, value, others)?;
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.keys().cloned().collect())
    }
}

/// A JSON object file mapping keys to string values.
///
/// The file is re-read on every call so separate instances see each other's writes,
/// and written through a sibling temp file so a crash never leaves it half-written.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
    capacity: Option<usize>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            capacity: None,
        }
    }

    pub fn with_capacity(mut self, capacity: Option<usize>) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entries(&self) -> Result<Map<String, Value>, StoreError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(err) => return Err(err.into()),
        };
        if raw.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&raw)? {
            Value::Object(entries) => Ok(entries),
            other => Err(StoreError::NotAnObject {
                path: self.path.clone(),
                found: match other {
                    Value::Array(_) => "array",
                    Value::String(_) => "string",
                    Value::Number(_) => "number",
                    Value::Bool(_) => "bool",
                    _ => "null",
                },
            }),
        }
    }

    fn write_entries(&self, entries: &Map<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, serde_json::to_string_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Local storage only holds strings; anything else found in the file is handed back as JSON text.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read_entries()?.get(key).map(value_text))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.read_entries()?;
        let texts = entries
            .iter()
            .filter(|(existing, _)| existing.as_str() != key)
            .map(|(k, v)| (k.clone(), value_text(v)))
            .collect::<Vec<(String, String)>>();
        let others = footprint(texts.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        check_capacity(self.capacity, key, value, others)?;
        entries.insert(key.to_string(), Value::String(value.to_string()));
        self.write_entries(&entries)
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.read_entries()?;
        if entries.remove(key).is_some() {
            self.write_entries(&entries)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.read_entries()?.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::{FileStore, KeyValueStore, MemoryStore, StoreError};

    #[test]
    fn file_store_basic() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut store = FileStore::new(temp.path().join("nested").join("storage.json"));
        assert_eq!(store.get("key")?, None);
        store.set("key", "value")?;
        assert_eq!(store.get("key")?, Some("value".to_string()));
        store.remove("key")?;
        assert_eq!(store.get("key")?, None);
        Ok(())
    }

    #[test]
    fn file_store_refreshes_between_instances() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("storage.json");
        let mut store_a = FileStore::new(&path);
        let mut store_b = FileStore::new(&path);

        store_a.set("a", "1")?;
        store_b.set("b", "2")?;
        assert_eq!(store_a.get("b")?, Some("2".to_string()));
        assert_eq!(store_b.get("a")?, Some("1".to_string()));
        assert_eq!(store_a.keys()?, vec!["a".to_string(), "b".to_string()]);
        Ok(())
    }

    #[test]
    fn file_store_returns_non_string_values_as_json_text() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("storage.json");
        std::fs::write(&path, r#"{"generated-images": ["https://x.test/a"]}"#)?;
        let store = FileStore::new(&path);
        assert_eq!(
            store.get("generated-images")?,
            Some(r#"["https://x.test/a"]"#.to_string())
        );
        Ok(())
    }

    #[test]
    fn file_store_rejects_writes_over_capacity() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("storage.json");
        let mut store = FileStore::new(&path).with_capacity(Some(16));
        store.set("k", "0123456789")?;

        let err = store.set("other", "0123456789").err();
        assert!(matches!(err, Some(StoreError::QuotaExceeded { .. })));
        assert_eq!(store.get("other")?, None);

        // Replacing an entry only counts the new value.
        store.set("k", "abcdefghijklmn")?;
        assert_eq!(store.get("k")?, Some("abcdefghijklmn".to_string()));
        Ok(())
    }

    #[test]
    fn unreadable_file_surfaces_json_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("storage.json");
        std::fs::write(&path, "{broken")?;
        let store = FileStore::new(&path);
        assert!(matches!(store.get("key"), Err(StoreError::Json(_))));
        Ok(())
    }

    #[test]
    fn non_object_file_is_refused_and_left_intact() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("storage.json");
        std::fs::write(&path, r#"["keep", "me"]"#)?;
        let mut store = FileStore::new(&path);

        assert!(matches!(
            store.get("key"),
            Err(StoreError::NotAnObject { found: "array", .. })
        ));
        assert!(store.set("key", "value").is_err());
        assert_eq!(std::fs::read_to_string(&path)?, r#"["keep", "me"]"#);
        Ok(())
    }

    #[test]
    fn memory_store_capacity_counts_keys_and_values() -> anyhow::Result<()> {
        let mut store = MemoryStore::with_capacity(8);
        store.set("ab", "cdef")?;
        assert!(store.set("gh", "ij").is_err());
        store.remove("ab")?;
        store.set("gh", "ij")?;
        assert_eq!(store.keys()?, vec!["gh".to_string()]);
        Ok(())
    }
}
