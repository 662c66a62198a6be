use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use strum_macros::{Display, EnumString};

use crate::{error::RuntimeError, runtime::TaskReport};

const RUNS_DIR: &str = "runs";

#[derive(
    Copy, Clone, Debug, Display, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    Cancelled,
}

/// Persistent record of one flow run; the checkpoint always carries the
/// terminal state of every task.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub flow: String,
    pub params: serde_json::Value,

    #[serde_as(as = "serde_with::TimestampMilliSeconds<i64>")]
    pub started_at: DateTime<Utc>,

    #[serde_as(as = "serde_with::TimestampMilliSeconds<i64>")]
    pub ended_at: DateTime<Utc>,

    pub status: RunStatus,
    pub tasks: Vec<TaskReport>,
}

pub fn runs_dir(state_dir: &Path) -> PathBuf {
    state_dir.join(RUNS_DIR)
}

/// Writes `<state>/runs/<run_id>.json` atomically.
pub fn persist(state_dir: &Path, record: &RunRecord) -> Result<PathBuf, RuntimeError> {
    let dir = runs_dir(state_dir);
    fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{}.json", record.run_id));
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(record)?)?;
    fs::rename(&tmp, &path)?;
    Ok(path)
}

/// All checkpoints, oldest first. Unparseable files are skipped, not
/// fatal: a reader must tolerate a writer mid-rename.
pub fn load_all(state_dir: &Path) -> Result<Vec<RunRecord>, RuntimeError> {
    let dir = runs_dir(state_dir);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut records: Vec<RunRecord> = fs::read_dir(&dir)?
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            if path.extension().is_some_and(|e| e == "json") {
                serde_json::from_str(&fs::read_to_string(path).ok()?).ok()
            } else {
                None
            }
        })
        .collect();
    records.sort_by_key(|r| r.started_at);
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{TaskMetrics, TaskStatus};

    fn record(run_id: &str, started_at: DateTime<Utc>) -> RunRecord {
        RunRecord {
            run_id: run_id.to_string(),
            flow: "eod_ingest".to_string(),
            params: serde_json::json!({"date": "2024-01-02"}),
            started_at,
            ended_at: started_at + chrono::Duration::seconds(42),
            status: RunStatus::Success,
            tasks: vec![TaskReport {
                name: "fetch_bhavcopy".to_string(),
                status: TaskStatus::Success,
                attempts: 1,
                duration_seconds: 1.5,
                error: None,
                metrics: TaskMetrics {
                    rows_in: 0,
                    rows_out: 2500,
                    bytes_out: 1024,
                },
            }],
        }
    }

    #[test]
    fn persist_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        persist(dir.path(), &record("run_b", now)).unwrap();
        persist(dir.path(), &record("run_a", now - chrono::Duration::hours(1))).unwrap();

        let records = load_all(dir.path()).unwrap();
        assert_eq!(records.len(), 2);
        // Oldest first.
        assert_eq!(records[0].run_id, "run_a");
        assert_eq!(records[1].tasks[0].metrics.rows_out, 2500);
    }

    #[test]
    fn corrupt_checkpoints_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        persist(dir.path(), &record("run_a", Utc::now())).unwrap();
        fs::write(runs_dir(dir.path()).join("torn.json"), "{\"run_id\": ").unwrap();

        assert_eq!(load_all(dir.path()).unwrap().len(), 1);
    }
}
