//! Durable mapping of in-flight batch IDs to item metadata.
//!
//! Every submitted batch job is recorded here *before* polling begins, so
//! a crash between submission and upsert loses nothing: the resume
//! protocol replays the store at startup. Entries persist until the
//! batch's results have been upserted at an acceptable success rate (or
//! the batch is small enough to write off; see the retention rule in the
//! batch driver).
//!
//! The file is rewritten whole on every mutation. Coarse, but mutations
//! are rare (one per submitted or retired batch) and the entries are
//! metadata-only — content bodies are never persisted.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::models::ItemMeta;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntry {
    pub items: Vec<ItemMeta>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

pub struct BatchStateStore {
    path: PathBuf,
    entries: HashMap<String, BatchEntry>,
}

impl BatchStateStore {
    /// Load the store, or start empty when the file does not exist yet.
    /// A present-but-unparseable file is fatal: silently discarding it
    /// would orphan submitted batches.
    pub fn load(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read batch state: {}", path.display()))?;
            serde_json::from_str(&data)
                .with_context(|| format!("corrupt batch state file: {}", path.display()))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// Record a submitted batch. Persists before returning.
    pub fn insert(&mut self, batch_id: &str, items: Vec<ItemMeta>) -> Result<()> {
        self.entries.insert(
            batch_id.to_string(),
            BatchEntry {
                items,
                created_at: Utc::now(),
            },
        );
        self.save()
    }

    /// Retire a batch. Persists before returning; removing an unknown ID
    /// is a no-op.
    pub fn remove(&mut self, batch_id: &str) -> Result<()> {
        if self.entries.remove(batch_id).is_some() {
            self.save()?;
        }
        Ok(())
    }

    pub fn get(&self, batch_id: &str) -> Option<&BatchEntry> {
        self.entries.get(batch_id)
    }

    pub fn batch_ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, data)
            .with_context(|| format!("failed to write batch state: {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{item_id_from_hash, sha1_hex};
    use tempfile::TempDir;

    fn meta(content: &str, repo: &str) -> ItemMeta {
        let hash = sha1_hex(content);
        ItemMeta {
            id: item_id_from_hash(&hash).unwrap(),
            repo: repo.to_string(),
            content_hash: hash,
        }
    }

    #[test]
    fn starts_empty_without_a_file() {
        let tmp = TempDir::new().unwrap();
        let store = BatchStateStore::load(&tmp.path().join("batch-state.json")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn survives_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("batch-state.json");

        let mut store = BatchStateStore::load(&path).unwrap();
        store
            .insert("batch_abc", vec![meta("# readme", "foo/bar")])
            .unwrap();
        store
            .insert("batch_def", vec![meta("# other", "baz/qux")])
            .unwrap();

        let reloaded = BatchStateStore::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        let entry = reloaded.get("batch_abc").unwrap();
        assert_eq!(entry.items.len(), 1);
        assert_eq!(entry.items[0].repo, "foo/bar");
    }

    #[test]
    fn remove_persists() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("batch-state.json");

        let mut store = BatchStateStore::load(&path).unwrap();
        store.insert("batch_abc", vec![meta("x y z", "a/b")]).unwrap();
        store.remove("batch_abc").unwrap();
        store.remove("never_existed").unwrap();

        let reloaded = BatchStateStore::load(&path).unwrap();
        assert!(reloaded.is_empty());
    }

    #[test]
    fn corrupt_file_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("batch-state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(BatchStateStore::load(&path).is_err());
    }
}
