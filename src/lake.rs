pub mod coalesce;
pub mod lock;
pub mod metadata;
pub mod retention;

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing::{debug, info};

use crate::{
    datasets::{Dataset, Layer},
    error::LakeError,
    parse::date_from_epoch_days,
};

/// Default targets of the file-size policy, in bytes.
pub const TARGET_FILE_BYTES: u64 = 128 * 1024 * 1024;
pub const MIN_FILE_BYTES: u64 = 10 * 1024 * 1024;

#[derive(
    Copy, Clone, Debug, Default, Display, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Snappy,
    Zstd,
}

impl Compression {
    fn parquet(&self) -> ParquetCompression {
        match self {
            Compression::Snappy => ParquetCompression::Snappy,
            Compression::Zstd => ParquetCompression::Zstd(None),
        }
    }
}

// ================================================================================================
// Lake
// ================================================================================================

/// Partitioned parquet lake under a local base directory:
/// `<base>/<layer>/<dataset>/<k1>=<v1>/…/part-<seq>.parquet`.
///
/// Every file lands via write-temp-then-rename, so concurrent readers
/// never observe a partial part file.
pub struct Lake {
    base: PathBuf,
    max_rows_per_file: usize,
}

impl Lake {
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            max_rows_per_file: 1_000_000,
        }
    }

    pub fn with_max_rows_per_file(mut self, max_rows: usize) -> Self {
        self.max_rows_per_file = max_rows.max(1);
        self
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn dataset_dir(&self, layer: Layer, dataset: Dataset) -> PathBuf {
        self.base.join(layer.to_string()).join(dataset.to_string())
    }

    /// Writes one batch into its Hive partitions and refreshes the
    /// dataset metadata. Returns the dataset directory.
    #[tracing::instrument(skip(self, batch), fields(%layer, %dataset, rows = batch.height()))]
    pub fn write(
        &self,
        batch: &DataFrame,
        layer: Layer,
        dataset: Dataset,
        compression: Compression,
    ) -> Result<PathBuf, LakeError> {
        let dataset_dir = self.dataset_dir(layer, dataset);
        let partitions = partition_paths(batch, dataset)?;

        // Group row indexes per partition path, preserving order.
        let mut groups: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for (row, path) in partitions.iter().enumerate() {
            groups.entry(path.clone()).or_default().push(row as u32);
        }

        // Partition key columns never enter the file body.
        let body_columns: Vec<String> = batch
            .get_column_names()
            .iter()
            .map(|name| name.to_string())
            .filter(|name| !dataset.partition_keys().contains(&name.as_str()))
            .collect();

        let mut written = 0usize;
        for (partition, rows) in groups {
            let partition_dir = dataset_dir.join(&partition);
            fs::create_dir_all(&partition_dir)?;

            for rows in rows.chunks(self.max_rows_per_file) {
                let index = UInt32Chunked::from_vec("idx".into(), rows.to_vec());
                let mut part = batch.take(&index)?.select(body_columns.iter().cloned())?;

                let seq = next_part_seq(&partition_dir)?;
                let final_path = partition_dir.join(format!("part-{seq}.parquet"));
                let tmp_path = partition_dir.join(format!("part-{seq}.parquet.tmp"));

                let mut file = fs::File::create(&tmp_path)?;
                ParquetWriter::new(&mut file)
                    .with_compression(compression.parquet())
                    .with_statistics(StatisticsOptions::full())
                    .finish(&mut part)?;
                fs::rename(&tmp_path, &final_path)?;

                metadata::record_file(&dataset_dir, &partition, seq, &part)?;
                written += part.height();
                debug!(path = %final_path.display(), rows = part.height(), "part written");
            }
        }

        info!(rows = written, dir = %dataset_dir.display(), "batch materialized");
        Ok(dataset_dir)
    }

    /// Reads every part of one dataset layer back into a single frame,
    /// reconstructing non-derived partition key columns (e.g.
    /// `exchange`) from the Hive path. `None` when nothing is
    /// materialized yet.
    pub fn read(&self, layer: Layer, dataset: Dataset) -> Result<Option<DataFrame>, LakeError> {
        let dataset_dir = self.dataset_dir(layer, dataset);
        let mut merged: Option<DataFrame> = None;
        for partition in partition_dirs(&dataset_dir)? {
            let relative = partition
                .strip_prefix(&dataset_dir)
                .map_err(|_| LakeError::BadPartition(partition.display().to_string()))?
                .to_string_lossy()
                .replace('\\', "/");

            let mut frame: Option<DataFrame> = None;
            for file in part_files(&partition)? {
                let df = ParquetReader::new(fs::File::open(file)?).finish()?;
                frame = Some(match frame {
                    Some(acc) => acc.vstack(&df)?,
                    None => df,
                });
            }
            let Some(mut frame) = frame else {
                continue;
            };

            for segment in relative.split('/') {
                let Some((key, value)) = segment.split_once('=') else {
                    continue;
                };
                if matches!(key, "year" | "month" | "day" | "quarter") {
                    continue;
                }
                frame.with_column(Series::new(
                    PlSmallStr::from_str(key),
                    vec![value.to_string(); frame.height()],
                ))?;
            }

            merged = Some(match merged {
                Some(acc) => acc.vstack(&frame)?,
                None => frame,
            });
        }
        Ok(merged)
    }

    /// Replaces a dataset layer's contents with `batch`. The new parts
    /// are published first, then the superseded parts are unlinked, so
    /// concurrent readers never observe an empty dataset. Used by
    /// current-state reference tables (symbol master), where each merged
    /// snapshot supersedes the whole table.
    pub fn rewrite(
        &self,
        batch: &DataFrame,
        layer: Layer,
        dataset: Dataset,
        compression: Compression,
    ) -> Result<PathBuf, LakeError> {
        let dataset_dir = self.dataset_dir(layer, dataset);
        let mut superseded = Vec::new();
        for partition in partition_dirs(&dataset_dir)? {
            superseded.extend(part_files(&partition)?);
        }

        let dir = self.write(batch, layer, dataset, compression)?;

        let mut forgotten = Vec::new();
        for file in &superseded {
            fs::remove_file(file)?;
            if let Ok(relative) = file.strip_prefix(&dataset_dir) {
                forgotten.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
        metadata::forget_files(&dataset_dir, &forgotten)?;
        Ok(dir)
    }

    /// Removes stale `.tmp` leftovers from a crashed writer. Files
    /// younger than `min_age` may still be mid-write and are left alone.
    pub fn gc_temp_files(&self, min_age: Duration) -> Result<usize, LakeError> {
        let mut removed = 0;
        if !self.base.exists() {
            return Ok(0);
        }
        let mut stack = vec![self.base.clone()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().is_some_and(|e| e == "tmp") {
                    let age = entry
                        .metadata()?
                        .modified()?
                        .elapsed()
                        .unwrap_or(Duration::ZERO);
                    if age >= min_age {
                        fs::remove_file(&path)?;
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }
}

/// Relative Hive path for each row, e.g. `year=2024/month=01/day=02`.
fn partition_paths(batch: &DataFrame, dataset: Dataset) -> Result<Vec<String>, LakeError> {
    let keys = dataset.partition_keys();
    let date_parts = keys.iter().any(|k| matches!(*k, "year" | "month" | "day" | "quarter"));

    let dates: Option<Vec<Option<(i32, u32, u32)>>> = if date_parts {
        let column = dataset.event_date_column();
        let dates = batch
            .column(column)
            .map_err(|_| LakeError::MissingPartitionColumn {
                dataset: dataset.to_string(),
                column: column.to_string(),
            })?
            .date()?;
        Some(
            dates
                .phys
                .into_iter()
                .map(|d| {
                    d.and_then(date_from_epoch_days).map(|d| {
                        use chrono::Datelike;
                        (d.year(), d.month(), d.day())
                    })
                })
                .collect(),
        )
    } else {
        None
    };

    let mut out = Vec::with_capacity(batch.height());
    for row in 0..batch.height() {
        let mut segments = Vec::with_capacity(keys.len());
        for key in keys {
            let segment = match *key {
                "year" | "month" | "day" | "quarter" => {
                    let (year, month, day) = dates
                        .as_ref()
                        .and_then(|d| d[row])
                        .ok_or_else(|| LakeError::MissingPartitionColumn {
                            dataset: dataset.to_string(),
                            column: dataset.event_date_column().to_string(),
                        })?;
                    match *key {
                        "year" => format!("year={year}"),
                        "month" => format!("month={month:02}"),
                        "day" => format!("day={day:02}"),
                        _ => format!("quarter={}", (month - 1) / 3 + 1),
                    }
                }
                column => {
                    let value = batch
                        .column(column)
                        .map_err(|_| LakeError::MissingPartitionColumn {
                            dataset: dataset.to_string(),
                            column: column.to_string(),
                        })?
                        .get(row)?;
                    match value {
                        AnyValue::Null => {
                            return Err(LakeError::MissingPartitionColumn {
                                dataset: dataset.to_string(),
                                column: column.to_string(),
                            });
                        }
                        AnyValue::String(s) => format!("{column}={s}"),
                        other => format!("{column}={other}"),
                    }
                }
            };
            segments.push(segment);
        }
        out.push(segments.join("/"));
    }
    Ok(out)
}

/// Next free `part-<seq>` number in a partition directory.
fn next_part_seq(partition_dir: &Path) -> Result<u32, LakeError> {
    let mut max: Option<u32> = None;
    for entry in fs::read_dir(partition_dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if let Some(seq) = name
            .strip_prefix("part-")
            .and_then(|rest| rest.split('.').next())
            .and_then(|digits| digits.parse::<u32>().ok())
        {
            max = Some(max.map_or(seq, |m| m.max(seq)));
        }
    }
    Ok(max.map_or(0, |m| m + 1))
}

/// Part files of one partition directory, ordered by sequence number.
pub(crate) fn part_files(partition_dir: &Path) -> Result<Vec<PathBuf>, LakeError> {
    let mut files: Vec<PathBuf> = fs::read_dir(partition_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .map(|n| n.to_string_lossy())
                .is_some_and(|n| n.starts_with("part-") && n.ends_with(".parquet"))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Leaf partition directories (those holding part files) under a dataset.
pub(crate) fn partition_dirs(dataset_dir: &Path) -> Result<Vec<PathBuf>, LakeError> {
    let mut out = Vec::new();
    if !dataset_dir.exists() {
        return Ok(out);
    }
    let mut stack = vec![dataset_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut has_parts = false;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if path
                .file_name()
                .map(|n| n.to_string_lossy())
                .is_some_and(|n| n.starts_with("part-"))
            {
                has_parts = true;
            }
        }
        if has_parts {
            out.push(dir);
        }
    }
    out.sort();
    Ok(out)
}
