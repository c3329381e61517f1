//! Dependency inference cache (§4.2 step 6, §6.4).
//!
//! Keyed by a digest of the task set plus the ambiguous pair list. On a
//! cache hit within `cache_ttl_hours` the Inferer skips the Oracle pass
//! entirely; on Oracle failure the Inferer may still ask for a stale
//! entry rather than degrading all the way to pattern-only.

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::JsonStore;
use crate::model::DependencyEdge;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEdges {
    pub edges: Vec<DependencyEdge>,
    pub computed_at: DateTime<Utc>,
}

pub struct DependencyCache {
    store: JsonStore<CachedEdges>,
}

impl DependencyCache {
    pub fn open(data_dir: impl AsRef<Path>, fsync: bool) -> Self {
        Self {
            store: JsonStore::new(data_dir.as_ref().join("dependency_cache.json"), fsync),
        }
    }

    /// Compute the cache key per §4.2 step 6: an MD5 digest over the
    /// sorted `task_id:name:hash(description)` triples concatenated with
    /// the sorted ambiguous-pair id list.
    pub fn key(tasks: &[(&str, &str, &str)], pairs: &[(String, String)]) -> String {
        let mut task_parts: Vec<String> = tasks
            .iter()
            .map(|(id, name, description)| {
                let desc_hash = md5::compute(description.as_bytes());
                format!("{id}:{name}:{desc_hash:x}")
            })
            .collect();
        task_parts.sort();

        let mut pair_parts: Vec<String> = pairs.iter().map(|(a, b)| format!("{a}|{b}")).collect();
        pair_parts.sort();

        let joined = format!("{}++{}", task_parts.join(","), pair_parts.join(","));
        format!("{:x}", md5::compute(joined.as_bytes()))
    }

    /// Return cached edges if present and within `ttl_hours`.
    pub async fn get_fresh(&self, key: &str, ttl_hours: i64) -> Result<Option<Vec<DependencyEdge>>> {
        let Some(entry) = self.store.get(key).await? else {
            return Ok(None);
        };
        let age = Utc::now() - entry.computed_at;
        if age <= Duration::hours(ttl_hours) {
            Ok(Some(entry.edges))
        } else {
            Ok(None)
        }
    }

    /// Return cached edges regardless of age, used as the fallback when
    /// the Oracle is unavailable and a stale answer beats pattern-only.
    pub async fn get_stale(&self, key: &str) -> Result<Option<Vec<DependencyEdge>>> {
        Ok(self.store.get(key).await?.map(|entry| entry.edges))
    }

    pub async fn put(&self, key: &str, edges: Vec<DependencyEdge>) -> Result<()> {
        self.store
            .save(
                key,
                CachedEdges {
                    edges,
                    computed_at: Utc::now(),
                },
            )
            .await
    }
}
