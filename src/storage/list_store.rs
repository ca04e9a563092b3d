//! Load-all / save-all persistence for rule lists and settings.

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Durable list of items. Saves replace the whole list; the last save wins.
pub trait ListStore<T>: Send + Sync {
    fn load_all(&self) -> anyhow::Result<Vec<T>>;
    fn save_all(&self, items: &[T]) -> anyhow::Result<()>;
}

/// Load a list, logging and falling back to empty on failure
pub fn load_or_empty<T>(store: &dyn ListStore<T>, what: &str) -> Vec<T> {
    match store.load_all() {
        Ok(items) => items,
        Err(err) => {
            tracing::warn!("Failed to load {}: {:#}; starting empty", what, err);
            Vec::new()
        }
    }
}

/// Save a list, logging failures. In-memory state is never rolled back.
pub fn save_logged<T>(store: &dyn ListStore<T>, items: &[T], what: &str) {
    if let Err(err) = store.save_all(items) {
        tracing::warn!("Failed to persist {}: {:#}", what, err);
    }
}

/// Pretty JSON array stored in a single file
pub struct JsonFileStore<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }
}

impl<T> ListStore<T> for JsonFileStore<T>
where
    T: Serialize + DeserializeOwned,
{
    fn load_all(&self) -> anyhow::Result<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {:?}", self.path))?;
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&data).with_context(|| format!("decoding {:?}", self.path))
    }

    fn save_all(&self, items: &[T]) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(items)?;
        write_atomically(&self.path, json.as_bytes())
    }
}

/// Write to a sibling temp file, then rename over the target
pub(crate) fn write_atomically(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).with_context(|| format!("creating directory {:?}", dir))?;
        }
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp).with_context(|| format!("creating {:?}", tmp))?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("replacing {:?}", path))?;
    Ok(())
}

/// Volatile store, used when no storage directory is configured and in tests
pub struct MemoryListStore<T> {
    items: Mutex<Vec<T>>,
}

impl<T> MemoryListStore<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }
}

impl<T> Default for MemoryListStore<T> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<T: Clone + Send> ListStore<T> for MemoryListStore<T> {
    fn load_all(&self) -> anyhow::Result<Vec<T>> {
        Ok(self
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save_all(&self, items: &[T]) -> anyhow::Result<()> {
        *self.items.lock().unwrap_or_else(PoisonError::into_inner) = items.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MapRule;
    use tempfile::tempdir;

    #[test]
    fn json_store_round_trips_and_replaces() {
        let dir = tempdir().expect("temp dir");
        let store = JsonFileStore::<MapRule>::new(dir.path().join("rules").join("map_rules.json"));

        assert!(store.load_all().unwrap().is_empty());

        let a = MapRule::new("a.com", "/x").unwrap();
        let b = MapRule::new("b.com", "/y").unwrap();
        store.save_all(&[a.clone(), b]).unwrap();
        store.save_all(&[a.clone()]).unwrap();

        assert_eq!(store.load_all().unwrap(), vec![a]);
    }

    #[test]
    fn corrupt_file_loads_as_empty() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("map_rules.json");
        fs::write(&path, "{ not json").unwrap();

        let store = JsonFileStore::<MapRule>::new(&path);
        assert!(store.load_all().is_err());
        assert!(load_or_empty(&store, "map rules").is_empty());
    }
}
