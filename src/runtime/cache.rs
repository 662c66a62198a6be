use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use tracing::debug;

use crate::error::RuntimeError;

const CACHE_DIR: &str = "task_cache";

#[serde_as]
#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    #[serde_as(as = "serde_with::TimestampMilliSeconds<i64>")]
    stored_at: DateTime<Utc>,
    value: serde_json::Value,
}

/// Disk-backed task result cache keyed by an input fingerprint.
/// Fetch tasks default to a 24h TTL; writes are never cached.
pub struct TaskCache {
    base: PathBuf,
}

impl TaskCache {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            base: state_dir.join(CACHE_DIR),
        }
    }

    /// Fingerprint over a task's inputs; identical inputs hit the same
    /// cache slot.
    pub fn fingerprint(parts: &[&str]) -> String {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update(b"\x1f");
        }
        hasher.finalize().to_hex()[..32].to_string()
    }

    fn entry_path(&self, task: &str, fingerprint: &str) -> PathBuf {
        self.base.join(task).join(format!("{fingerprint}.json"))
    }

    pub fn get(
        &self,
        task: &str,
        fingerprint: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Option<serde_json::Value> {
        let path = self.entry_path(task, fingerprint);
        let raw = fs::read_to_string(&path).ok()?;
        let entry: CacheEntry = serde_json::from_str(&raw).ok()?;

        let age = (now - entry.stored_at).to_std().unwrap_or(Duration::MAX);
        if age > ttl {
            debug!(task, fingerprint, "cache entry expired");
            return None;
        }
        debug!(task, fingerprint, "cache hit");
        Some(entry.value)
    }

    pub fn put(
        &self,
        task: &str,
        fingerprint: &str,
        value: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), RuntimeError> {
        let path = self.entry_path(task, fingerprint);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let entry = CacheEntry {
            stored_at: now,
            value: value.clone(),
        };
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string(&entry)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_within_ttl_miss_after() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TaskCache::new(dir.path());
        let fp = TaskCache::fingerprint(&["nse_cm_bhavcopy", "2024-01-02"]);
        let stored = Utc::now();

        cache
            .put("fetch_bhavcopy", &fp, &serde_json::json!({"path": "/tmp/x.csv"}), stored)
            .unwrap();

        let hit = cache.get("fetch_bhavcopy", &fp, Duration::from_secs(3600), stored);
        assert!(hit.is_some());

        let later = stored + chrono::Duration::hours(25);
        let miss = cache.get("fetch_bhavcopy", &fp, Duration::from_secs(24 * 3600), later);
        assert!(miss.is_none());
    }

    #[test]
    fn fingerprints_differ_per_input() {
        let a = TaskCache::fingerprint(&["source", "2024-01-02"]);
        let b = TaskCache::fingerprint(&["source", "2024-01-03"]);
        assert_ne!(a, b);
    }
}
