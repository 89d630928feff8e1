//! Pluggable key-value storage.
//!
//! The core persists three kinds of data through this interface: serialized
//! group states (keyed by group id), key package custody entries (keyed by
//! reference) and the invite inbox namespaces (keyed by event or rumor id).
//! Backends serialize their own concurrent writes; last-writer-wins is
//! acceptable because each group facade writes only its own key.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::{Error, Result};

/// A string-keyed byte store.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    /// All keys, in unspecified order.
    fn keys(&self) -> Result<Vec<String>>;

    /// All entries. Default implementation reads key by key.
    fn entries(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for key in self.keys()? {
            if let Some(value) = self.get(&key)? {
                out.push((key, value));
            }
        }
        Ok(out)
    }
}

/// In-memory store used in tests and as a default backend.
#[derive(Default)]
pub struct MemoryKvStore {
    cells: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let cells = self
            .cells
            .read()
            .map_err(|_| Error::Storage("store lock poisoned".into()))?;
        Ok(cells.get(key).cloned())
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut cells = self
            .cells
            .write()
            .map_err(|_| Error::Storage("store lock poisoned".into()))?;
        cells.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut cells = self
            .cells
            .write()
            .map_err(|_| Error::Storage("store lock poisoned".into()))?;
        cells.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let cells = self
            .cells
            .read()
            .map_err(|_| Error::Storage("store lock poisoned".into()))?;
        Ok(cells.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let store = MemoryKvStore::new();
        assert_eq!(store.get("a").unwrap(), None);

        store.set("a", vec![1, 2, 3]).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(vec![1, 2, 3]));

        store.set("a", vec![4]).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(vec![4]));

        store.remove("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn test_keys_and_entries() {
        let store = MemoryKvStore::new();
        store.set("b", vec![2]).unwrap();
        store.set("a", vec![1]).unwrap();

        let mut keys = store.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

        let entries = store.entries().unwrap();
        assert_eq!(entries.len(), 2);
    }
}
