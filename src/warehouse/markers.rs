use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::WarehouseError;

const MARKERS_DIR: &str = "load_markers";

/// Idempotency marker store:
/// `<state>/load_markers/<table>/<partition>/<source_hash>`.
///
/// A marker's presence means the `(table, partition, source)` triple was
/// already submitted; replays are skipped unless forced.
pub struct MarkerStore {
    base: PathBuf,
}

impl MarkerStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            base: state_dir.join(MARKERS_DIR),
        }
    }

    fn marker_path(&self, table: &str, partition: &str, source_hash: &str) -> PathBuf {
        self.base.join(table).join(partition).join(source_hash)
    }

    pub fn exists(&self, table: &str, partition: &str, source_hash: &str) -> bool {
        self.marker_path(table, partition, source_hash).exists()
    }

    pub fn record(
        &self,
        table: &str,
        partition: &str,
        source_hash: &str,
        loaded_at: DateTime<Utc>,
        rows: u64,
    ) -> Result<(), WarehouseError> {
        let path = self.marker_path(table, partition, source_hash);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, format!("{}\n{rows}\n", loaded_at.to_rfc3339()))?;
        debug!(table, partition, source_hash, rows, "load marker recorded");
        Ok(())
    }

    pub fn clear(
        &self,
        table: &str,
        partition: &str,
        source_hash: &str,
    ) -> Result<(), WarehouseError> {
        let path = self.marker_path(table, partition, source_hash);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Stable fingerprint of a load input. For files this hashes the path and
/// length; in-memory batches hash their identity spine.
pub fn source_hash(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    hasher.finalize().to_hex()[..24].to_string()
}
