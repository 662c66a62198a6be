use std::{fs, path::Path, time::Duration};

use polars::prelude::*;
use rayon::prelude::*;
use tracing::info;

use crate::{
    datasets::{Dataset, Layer},
    error::LakeError,
    lake::{Lake, lock::DatasetLock, metadata, part_files, partition_dirs},
};

/// Locks held longer than this are presumed orphaned (twice the longest
/// observed maintenance run).
const LOCK_STALE_AFTER: Duration = Duration::from_secs(4 * 3600);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CoalesceReport {
    pub partitions_examined: usize,
    pub files_merged: usize,
    pub files_written: usize,
}

/// Merges small part files within each partition of a dataset.
///
/// Files below `min_bytes` are grouped greedily up to `target_bytes` and
/// rewritten as one part; the merged file is renamed into place before
/// the originals are unlinked, so concurrent readers always see a
/// complete set. Idempotent: partitions with nothing under `min_bytes`
/// are untouched, so a rerun converges to a no-op.
pub fn coalesce(
    lake: &Lake,
    layer: Layer,
    dataset: Dataset,
    target_bytes: u64,
    min_bytes: u64,
    dry_run: bool,
) -> Result<CoalesceReport, LakeError> {
    let dataset_dir = lake.dataset_dir(layer, dataset);
    let _lock = DatasetLock::acquire(&dataset_dir, &dataset.to_string(), LOCK_STALE_AFTER)?;

    let partitions = partition_dirs(&dataset_dir)?;
    let reports: Vec<CoalesceReport> = partitions
        .par_iter()
        .map(|partition| coalesce_partition(&dataset_dir, partition, target_bytes, min_bytes, dry_run))
        .collect::<Result<_, _>>()?;

    let mut report = CoalesceReport {
        partitions_examined: partitions.len(),
        ..Default::default()
    };
    for r in reports {
        report.files_merged += r.files_merged;
        report.files_written += r.files_written;
    }
    info!(
        partitions = report.partitions_examined,
        merged = report.files_merged,
        written = report.files_written,
        dry_run,
        "coalesce finished"
    );
    Ok(report)
}

fn coalesce_partition(
    dataset_dir: &Path,
    partition_dir: &Path,
    target_bytes: u64,
    min_bytes: u64,
    dry_run: bool,
) -> Result<CoalesceReport, LakeError> {
    let mut report = CoalesceReport::default();

    let small: Vec<(std::path::PathBuf, u64)> = part_files(partition_dir)?
        .into_iter()
        .map(|path| {
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            (path, size)
        })
        .filter(|(_, size)| *size < min_bytes)
        .collect();

    // Greedy grouping by accumulated size.
    let mut groups: Vec<Vec<std::path::PathBuf>> = Vec::new();
    let mut current: Vec<std::path::PathBuf> = Vec::new();
    let mut current_bytes = 0u64;
    for (path, size) in small {
        if current_bytes + size > target_bytes && !current.is_empty() {
            groups.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(path);
    }
    if current.len() > 1 {
        groups.push(current);
    }
    groups.retain(|g| g.len() > 1);

    for group in groups {
        report.files_merged += group.len();
        report.files_written += 1;
        if dry_run {
            continue;
        }

        let mut merged: Option<DataFrame> = None;
        for path in &group {
            let df = ParquetReader::new(fs::File::open(path)?).finish()?;
            merged = Some(match merged {
                Some(acc) => acc.vstack(&df)?,
                None => df,
            });
        }
        let mut merged = merged.expect("group is non-empty");

        let seq = super::next_part_seq(partition_dir)?;
        let final_path = partition_dir.join(format!("part-{seq}.parquet"));
        let tmp_path = partition_dir.join(format!("part-{seq}.parquet.tmp"));
        let mut file = fs::File::create(&tmp_path)?;
        ParquetWriter::new(&mut file)
            .with_compression(ParquetCompression::Snappy)
            .with_statistics(StatisticsOptions::full())
            .finish(&mut merged)?;
        // Atomic publish first, then unlink the originals.
        fs::rename(&tmp_path, &final_path)?;

        let partition_rel = partition_dir
            .strip_prefix(dataset_dir)
            .map_err(|_| LakeError::BadPartition(partition_dir.display().to_string()))?
            .to_string_lossy()
            .replace('\\', "/");
        metadata::record_file(dataset_dir, &partition_rel, seq, &merged)?;

        let mut forgotten = Vec::new();
        for path in &group {
            fs::remove_file(path)?;
            if let Some(name) = path.file_name() {
                forgotten.push(format!("{partition_rel}/{}", name.to_string_lossy()));
            }
        }
        metadata::forget_files(dataset_dir, &forgotten)?;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::{lake::Compression, parse::date_column};

    fn seeded_lake(dir: &Path) -> Lake {
        let lake = Lake::new(dir);
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        for _ in 0..3 {
            let mut df = df![
                "symbol" => ["RELIANCE", "TCS"],
                "close" => [2610.45, 3704.9],
            ]
            .unwrap();
            df.with_column(date_column("trade_date", date, 2).unwrap())
                .unwrap();
            lake.write(&df, Layer::Raw, Dataset::EquityOhlc, Compression::Snappy)
                .unwrap();
        }
        lake
    }

    #[test]
    fn merges_small_parts_and_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let lake = seeded_lake(dir.path());
        let partition = lake
            .dataset_dir(Layer::Raw, Dataset::EquityOhlc)
            .join("year=2024/month=01/day=02");
        assert_eq!(part_files(&partition).unwrap().len(), 3);

        let report = coalesce(
            &lake,
            Layer::Raw,
            Dataset::EquityOhlc,
            crate::lake::TARGET_FILE_BYTES,
            crate::lake::MIN_FILE_BYTES,
            false,
        )
        .unwrap();
        assert_eq!(report.files_merged, 3);
        assert_eq!(report.files_written, 1);

        let files = part_files(&partition).unwrap();
        assert_eq!(files.len(), 1);
        let df = ParquetReader::new(fs::File::open(&files[0]).unwrap())
            .finish()
            .unwrap();
        assert_eq!(df.height(), 6);
    }

    #[test]
    fn dry_run_mutates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let lake = seeded_lake(dir.path());
        let partition = lake
            .dataset_dir(Layer::Raw, Dataset::EquityOhlc)
            .join("year=2024/month=01/day=02");

        let report = coalesce(
            &lake,
            Layer::Raw,
            Dataset::EquityOhlc,
            crate::lake::TARGET_FILE_BYTES,
            crate::lake::MIN_FILE_BYTES,
            true,
        )
        .unwrap();
        assert_eq!(report.files_written, 1);
        assert_eq!(part_files(&partition).unwrap().len(), 3);
    }

    #[test]
    fn rerun_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let lake = seeded_lake(dir.path());

        coalesce(
            &lake,
            Layer::Raw,
            Dataset::EquityOhlc,
            crate::lake::TARGET_FILE_BYTES,
            crate::lake::MIN_FILE_BYTES,
            false,
        )
        .unwrap();
        let second = coalesce(
            &lake,
            Layer::Raw,
            Dataset::EquityOhlc,
            crate::lake::TARGET_FILE_BYTES,
            crate::lake::MIN_FILE_BYTES,
            false,
        )
        .unwrap();
        assert_eq!(second.files_merged, 0);
        assert_eq!(second.files_written, 0);
    }
}
