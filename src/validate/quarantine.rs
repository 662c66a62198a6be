use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::error::ValidationError;

pub const AUDIT_LOG_FILE: &str = "audit_log.jsonl";

/// One line of the append-only quarantine audit log.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    #[serde_as(as = "serde_with::TimestampMilliSeconds<i64>")]
    pub timestamp: DateTime<Utc>,
    pub schema: String,
    pub quarantine_file: String,
    pub failed_rows: usize,
    pub total_rows: usize,
    pub rules_applied: Vec<String>,
    pub failure_rate: f64,
}

/// Collects failing rows chunk by chunk into a timestamped CSV and
/// appends one audit record when the run closes. Nothing is created for
/// fully clean batches.
pub struct QuarantineWriter {
    dir: PathBuf,
    schema: String,
    file_path: PathBuf,
    rows_written: usize,
}

impl QuarantineWriter {
    pub fn new(dir: &Path, schema: &str, now: DateTime<Utc>) -> Self {
        let file_name = format!("{schema}_failures_{}.csv", now.format("%Y%m%dT%H%M%S"));
        Self {
            dir: dir.to_path_buf(),
            schema: schema.to_string(),
            file_path: dir.join(file_name),
            rows_written: 0,
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    /// Appends the masked rows of one chunk. The header goes out with the
    /// first non-empty chunk only.
    pub fn quarantine_rows(
        &mut self,
        chunk: &DataFrame,
        mask: &[bool],
    ) -> Result<(), ValidationError> {
        let indexes: Vec<u32> = mask
            .iter()
            .enumerate()
            .filter_map(|(i, flag)| flag.then_some(i as u32))
            .collect();
        if indexes.is_empty() {
            return Ok(());
        }

        fs::create_dir_all(&self.dir)?;
        let index_ca = UInt32Chunked::from_vec("idx".into(), indexes);
        let mut failing = chunk.take(&index_ca)?;

        let include_header = self.rows_written == 0;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        let mut writer = BufWriter::new(file);
        CsvWriter::new(&mut writer)
            .include_header(include_header)
            .finish(&mut failing)?;
        writer.flush()?;

        self.rows_written += failing.height();
        Ok(())
    }

    /// Appends the audit record; call once after the last chunk.
    pub fn close(
        self,
        total_rows: usize,
        rules_applied: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<AuditRecord>, ValidationError> {
        if self.rows_written == 0 {
            return Ok(None);
        }

        let record = AuditRecord {
            timestamp: now,
            schema: self.schema.clone(),
            quarantine_file: self.file_path.display().to_string(),
            failed_rows: self.rows_written,
            total_rows,
            rules_applied,
            failure_rate: self.rows_written as f64 / total_rows.max(1) as f64,
        };
        append_audit_record(&self.dir, &record)?;
        Ok(Some(record))
    }
}

/// Line-buffered append; readers tolerate a partial final line.
pub fn append_audit_record(dir: &Path, record: &AuditRecord) -> Result<(), ValidationError> {
    fs::create_dir_all(dir)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(AUDIT_LOG_FILE))?;
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    file.flush()?;
    Ok(())
}

/// Reads every complete line of the audit log. A torn final line (writer
/// mid-append) is skipped rather than failing the reader.
pub fn read_audit_log(dir: &Path) -> Result<Vec<AuditRecord>, ValidationError> {
    let path = dir.join(AUDIT_LOG_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(&path)?;
    Ok(raw
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

/// Row count of a quarantine CSV, for audit verification.
pub fn quarantine_row_count(path: &Path) -> Result<usize, ValidationError> {
    let file = File::open(path)?;
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .into_reader_with_file_handle(file)
        .finish()?;
    Ok(df.height())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quarantine_accumulates_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let mut writer = QuarantineWriter::new(dir.path(), "equity_ohlc", now);

        let chunk = df![
            "symbol" => ["A", "B", "C"],
            "close" => [1.0, 2.0, 3.0],
        ]
        .unwrap();
        writer.quarantine_rows(&chunk, &[true, false, true]).unwrap();
        writer.quarantine_rows(&chunk, &[false, true, false]).unwrap();
        assert_eq!(writer.rows_written(), 3);

        let path = writer.file_path().to_path_buf();
        let record = writer
            .close(6, vec!["ohlc_high_low".to_string()], now)
            .unwrap()
            .unwrap();
        assert_eq!(record.failed_rows, 3);
        assert!((record.failure_rate - 0.5).abs() < 1e-9);

        // The audit record's file exists and its row count matches.
        assert_eq!(quarantine_row_count(&path).unwrap(), 3);
    }

    #[test]
    fn clean_batches_leave_no_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let writer = QuarantineWriter::new(dir.path(), "equity_ohlc", now);
        let record = writer.close(100, vec![], now).unwrap();
        assert!(record.is_none());
        assert!(read_audit_log(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn audit_log_is_append_only_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        for i in 0..3 {
            append_audit_record(
                dir.path(),
                &AuditRecord {
                    timestamp: now,
                    schema: format!("schema_{i}"),
                    quarantine_file: format!("file_{i}.csv"),
                    failed_rows: i,
                    total_rows: 100,
                    rules_applied: vec![],
                    failure_rate: i as f64 / 100.0,
                },
            )
            .unwrap();
        }

        let records = read_audit_log(dir.path()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].schema, "schema_2");
    }

    #[test]
    fn torn_final_line_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        append_audit_record(
            dir.path(),
            &AuditRecord {
                timestamp: Utc::now(),
                schema: "equity_ohlc".to_string(),
                quarantine_file: "q.csv".to_string(),
                failed_rows: 1,
                total_rows: 10,
                rules_applied: vec![],
                failure_rate: 0.1,
            },
        )
        .unwrap();

        // Simulate a writer that died mid-line.
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(AUDIT_LOG_FILE))
            .unwrap();
        file.write_all(b"{\"timestamp\": 17").unwrap();

        let records = read_audit_log(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
    }
}
