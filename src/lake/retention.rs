use std::{fs, path::PathBuf, time::Duration};

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate};
use regex::Regex;
use tracing::info;

use crate::{
    datasets::{Dataset, Layer},
    error::LakeError,
    lake::{Lake, lock::DatasetLock, metadata, partition_dirs},
};

const LOCK_STALE_AFTER: Duration = Duration::from_secs(4 * 3600);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired: Vec<PathBuf>,
    pub deleted: usize,
}

/// Deletes partitions whose partition-key date is older than
/// `today - retention_days`. Age comes from the partition key, never from
/// file mtimes; partitions without a date key (e.g. `exchange=NSE`) are
/// never expired. `pattern` optionally narrows the affected partitions.
pub fn cleanup(
    lake: &Lake,
    layer: Layer,
    dataset: Dataset,
    retention_days: u32,
    pattern: Option<&Regex>,
    dry_run: bool,
    today: NaiveDate,
) -> Result<CleanupReport, LakeError> {
    let dataset_dir = lake.dataset_dir(layer, dataset);
    let _lock = DatasetLock::acquire(&dataset_dir, &dataset.to_string(), LOCK_STALE_AFTER)?;

    let cutoff = today - ChronoDuration::days(retention_days as i64);
    let mut report = CleanupReport::default();

    for partition in partition_dirs(&dataset_dir)? {
        let relative = partition
            .strip_prefix(&dataset_dir)
            .map_err(|_| LakeError::BadPartition(partition.display().to_string()))?
            .to_string_lossy()
            .replace('\\', "/");

        if pattern.is_some_and(|p| !p.is_match(&relative)) {
            continue;
        }
        let Some(latest) = partition_latest_date(&relative)? else {
            continue;
        };
        if latest >= cutoff {
            continue;
        }

        report.expired.push(partition.clone());
        if !dry_run {
            let forgotten: Vec<String> = metadata::load(&dataset_dir)?
                .files
                .keys()
                .filter(|k| k.starts_with(&format!("{relative}/")))
                .cloned()
                .collect();
            fs::remove_dir_all(&partition)?;
            metadata::forget_files(&dataset_dir, &forgotten)?;
            report.deleted += 1;
        }
    }

    info!(
        dataset = %dataset,
        expired = report.expired.len(),
        deleted = report.deleted,
        dry_run,
        "retention cleanup finished"
    );
    Ok(report)
}

/// Latest calendar date a partition can contain, from its key segments.
/// `year=2024` → Dec 31, `year=2024/month=02` → Feb 29, day-grained keys
/// are exact. `None` when no date key is present.
fn partition_latest_date(relative: &str) -> Result<Option<NaiveDate>, LakeError> {
    let mut year: Option<i32> = None;
    let mut month: Option<u32> = None;
    let mut day: Option<u32> = None;
    let mut quarter: Option<u32> = None;

    for segment in relative.split('/') {
        let Some((key, value)) = segment.split_once('=') else {
            continue;
        };
        let parse = |v: &str| {
            v.parse::<u32>()
                .map_err(|_| LakeError::BadPartition(relative.to_string()))
        };
        match key {
            "year" => year = Some(parse(value)? as i32),
            "month" => month = Some(parse(value)?),
            "day" => day = Some(parse(value)?),
            "quarter" => quarter = Some(parse(value)?),
            _ => {}
        }
    }

    let Some(year) = year else {
        return Ok(None);
    };

    let date = match (month, day, quarter) {
        (Some(m), Some(d), _) => NaiveDate::from_ymd_opt(year, m, d),
        (Some(m), None, _) => last_day_of_month(year, m),
        (None, None, Some(q)) if (1..=4).contains(&q) => last_day_of_month(year, q * 3),
        _ => NaiveDate::from_ymd_opt(year, 12, 31),
    };
    date.map(Some)
        .ok_or_else(|| LakeError::BadPartition(relative.to_string()))
}

fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1).map(|d| d.pred_opt().expect("not epoch"))
}
