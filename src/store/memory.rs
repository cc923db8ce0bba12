//! In-memory vector store for tests.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

use super::{Point, VectorStore};

/// Map-backed store with the same dedup-by-ID semantics as the real
/// backend: upserting an existing ID overwrites, so a multiset of items
/// collapses to one point per distinct content hash.
#[derive(Default)]
pub struct MemoryStore {
    points: Mutex<HashMap<Uuid, Point>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Uuid) -> Option<Point> {
        self.points.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn ensure_collection(&self) -> Result<()> {
        Ok(())
    }

    async fn existing_ids(&self) -> Result<HashSet<Uuid>> {
        Ok(self.points.lock().unwrap().keys().copied().collect())
    }

    async fn upsert(&self, points: &[Point], _wait: bool) -> Result<()> {
        let mut map = self.points.lock().unwrap();
        for point in points {
            map.insert(point.id, point.clone());
        }
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.points.lock().unwrap().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{item_id_from_hash, sha1_hex};
    use crate::store::PointPayload;

    fn point(content: &str, repo: &str) -> Point {
        let hash = sha1_hex(content);
        Point {
            id: item_id_from_hash(&hash).unwrap(),
            vector: vec![0.1, 0.2],
            payload: PointPayload {
                repo_name: repo.to_string(),
                content_hash: hash,
            },
        }
    }

    #[tokio::test]
    async fn multiset_collapses_to_distinct_hashes() {
        let store = MemoryStore::new();
        // Three items, two distinct contents: identical bytes share an ID.
        let points = vec![
            point("# readme one", "a/x"),
            point("# readme one", "b/y"),
            point("# readme two", "c/z"),
        ];
        store.upsert(&points, false).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);

        let ids = store.existing_ids().await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&points[0].id));
        assert!(ids.contains(&points[2].id));
    }
}
