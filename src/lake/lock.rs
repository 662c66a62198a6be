use std::{fs, path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use tracing::warn;

use crate::error::LakeError;

const LOCK_FILE: &str = ".lock";

#[serde_as]
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,

    #[serde_as(as = "serde_with::TimestampMilliSeconds<i64>")]
    acquired_at: DateTime<Utc>,
}

/// Advisory per-dataset lock for coalesce and retention.
///
/// A lockfile carries the owner pid and acquisition time; locks older
/// than the staleness window are presumed orphaned (crashed owner) and
/// reclaimed. Released on drop.
pub struct DatasetLock {
    path: PathBuf,
    dataset: String,
}

impl DatasetLock {
    pub fn acquire(
        dataset_dir: &PathBuf,
        dataset: &str,
        stale_after: Duration,
    ) -> Result<Self, LakeError> {
        fs::create_dir_all(dataset_dir)?;
        let path = dataset_dir.join(LOCK_FILE);

        if let Ok(raw) = fs::read_to_string(&path) {
            if let Ok(info) = serde_json::from_str::<LockInfo>(&raw) {
                let age = Utc::now() - info.acquired_at;
                if age.to_std().unwrap_or(Duration::MAX) < stale_after {
                    return Err(LakeError::Locked {
                        dataset: dataset.to_string(),
                        pid: info.pid,
                        since: info.acquired_at.to_rfc3339(),
                    });
                }
                warn!(dataset, stale_pid = info.pid, "reclaiming stale dataset lock");
            }
            fs::remove_file(&path)?;
        }

        let info = LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        fs::write(
            &path,
            serde_json::to_string(&info).map_err(|e| LakeError::BadPartition(e.to_string()))?,
        )?;

        Ok(Self {
            path,
            dataset: dataset.to_string(),
        })
    }
}

impl Drop for DatasetLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(dataset = %self.dataset, error = %e, "failed to release dataset lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_refused_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let dataset_dir = dir.path().to_path_buf();

        let lock = DatasetLock::acquire(&dataset_dir, "equity_ohlc", Duration::from_secs(60))
            .unwrap();
        let err = DatasetLock::acquire(&dataset_dir, "equity_ohlc", Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, LakeError::Locked { .. }));

        drop(lock);
        assert!(
            DatasetLock::acquire(&dataset_dir, "equity_ohlc", Duration::from_secs(60)).is_ok()
        );
    }

    #[test]
    fn stale_locks_are_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let dataset_dir = dir.path().to_path_buf();

        let lock =
            DatasetLock::acquire(&dataset_dir, "equity_ohlc", Duration::from_secs(60)).unwrap();
        // Leak the lockfile as a crashed process would.
        std::mem::forget(lock);

        assert!(DatasetLock::acquire(&dataset_dir, "equity_ohlc", Duration::ZERO).is_ok());
    }
}
