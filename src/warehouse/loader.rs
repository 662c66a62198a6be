use std::{fs, path::PathBuf, sync::Arc};

use chrono::{Datelike, Utc};
use polars::prelude::*;
use tracing::{info, warn};

use crate::{
    datasets::Dataset,
    error::WarehouseError,
    warehouse::{
        WarehouseClient, ddl,
        markers::{MarkerStore, source_hash},
        rows::TableRows,
    },
};

/// Default insert chunk size, in rows.
pub const DEFAULT_CHUNK_ROWS: usize = 100_000;

/// What to load: columnar files from the lake, or a batch already in
/// memory.
pub enum LoadSource {
    /// A parquet file, or a directory whose `part-*.parquet` files are
    /// read recursively.
    Files(PathBuf),
    Batch(DataFrame),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    pub rows_loaded: u64,
    pub partition: String,

    /// True when an idempotency marker short-circuited the load.
    pub skipped: bool,
}

/// Idempotent batched loader for the warehouse.
pub struct Loader {
    client: Arc<dyn WarehouseClient>,
    markers: MarkerStore,
    chunk_rows: usize,
    verify: bool,
}

impl Loader {
    pub fn new(client: Arc<dyn WarehouseClient>, markers: MarkerStore) -> Self {
        Self {
            client,
            markers,
            chunk_rows: DEFAULT_CHUNK_ROWS,
            verify: false,
        }
    }

    pub fn with_chunk_rows(mut self, chunk_rows: usize) -> Self {
        self.chunk_rows = chunk_rows.max(1);
        self
    }

    /// After load, compare warehouse row counts with the source.
    pub fn with_verification(mut self) -> Self {
        self.verify = true;
        self
    }

    #[tracing::instrument(skip(self, source), fields(%dataset))]
    pub async fn load(
        &self,
        source: LoadSource,
        dataset: Dataset,
        force: bool,
    ) -> Result<LoadOutcome, WarehouseError> {
        let (batch, hash_parts) = self.materialize(source, dataset)?;
        if batch.height() == 0 {
            return Ok(LoadOutcome {
                rows_loaded: 0,
                partition: String::new(),
                skipped: false,
            });
        }

        let rows = TableRows::from_batch(dataset, &batch)?;
        let table = dataset.warehouse_table();
        let partition = partition_key(dataset, &batch)?;
        let hash_refs: Vec<&str> = hash_parts.iter().map(String::as_str).collect();
        let hash = source_hash(&hash_refs);

        if !force && self.markers.exists(table, &partition, &hash) {
            info!(table, partition, "idempotency marker present, load skipped");
            return Ok(LoadOutcome {
                rows_loaded: 0,
                partition,
                skipped: true,
            });
        }

        let mut loaded = 0u64;
        for chunk in rows.chunks(self.chunk_rows) {
            loaded += self.client.insert(table, &chunk).await?;
        }

        if self.verify {
            let predicate = ddl::partition_predicate(dataset, &partition);
            let actual = self.client.count(table, &predicate).await?;
            if actual < loaded {
                warn!(table, partition, expected = loaded, actual, "load verification failed");
                return Err(WarehouseError::LoadMismatch {
                    table: table.to_string(),
                    partition,
                    expected: loaded,
                    actual,
                });
            }
        }

        self.markers.record(table, &partition, &hash, Utc::now(), loaded)?;
        info!(table, partition, rows = loaded, "load complete");
        Ok(LoadOutcome {
            rows_loaded: loaded,
            partition,
            skipped: false,
        })
    }

    fn materialize(
        &self,
        source: LoadSource,
        dataset: Dataset,
    ) -> Result<(DataFrame, Vec<String>), WarehouseError> {
        match source {
            LoadSource::Batch(batch) => {
                let rows = batch.height().to_string();
                let spine = batch
                    .column("event_id")
                    .ok()
                    .and_then(|c| c.str().ok().and_then(|ca| ca.get(0)))
                    .unwrap_or_default()
                    .to_string();
                let parts = vec![dataset.warehouse_table().to_string(), rows, spine];
                Ok((batch, parts))
            }
            LoadSource::Files(path) => {
                let mut files = Vec::new();
                if path.is_dir() {
                    collect_parquet_files(&path, &mut files)?;
                } else {
                    files.push(path.clone());
                }
                files.sort();

                let mut merged: Option<DataFrame> = None;
                let mut bytes = 0u64;
                for file in &files {
                    bytes += fs::metadata(file).map(|m| m.len()).unwrap_or(0);
                    let df = ParquetReader::new(fs::File::open(file)?).finish()?;
                    merged = Some(match merged {
                        Some(acc) => acc.vstack(&df)?,
                        None => df,
                    });
                }
                let merged = merged.unwrap_or_else(DataFrame::empty);
                let parts = vec![path.display().to_string(), bytes.to_string()];
                Ok((merged, parts))
            }
        }
    }
}

fn collect_parquet_files(dir: &PathBuf, out: &mut Vec<PathBuf>) -> Result<(), WarehouseError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_parquet_files(&path, out)?;
        } else if path
            .file_name()
            .map(|n| n.to_string_lossy())
            .is_some_and(|n| n.starts_with("part-") && n.ends_with(".parquet"))
        {
            out.push(path);
        }
    }
    Ok(())
}

/// Warehouse partition key for one batch: `YYYYMM` for monthly tables,
/// `YYYY` for yearly ones, `fy<year>q<quarter>` for financials.
fn partition_key(dataset: Dataset, batch: &DataFrame) -> Result<String, WarehouseError> {
    let mismatch = |msg: String| WarehouseError::SchemaMismatch {
        table: dataset.warehouse_table().to_string(),
        msg,
    };

    if dataset == Dataset::QuarterlyFinancials {
        let year = batch
            .column("fiscal_year")
            .ok()
            .and_then(|c| c.i64().ok().and_then(|ca| ca.get(0)))
            .ok_or_else(|| mismatch("missing fiscal_year".to_string()))?;
        let quarter = batch
            .column("fiscal_quarter")
            .ok()
            .and_then(|c| c.i64().ok().and_then(|ca| ca.get(0)))
            .ok_or_else(|| mismatch("missing fiscal_quarter".to_string()))?;
        return Ok(format!("fy{year}q{quarter}"));
    }

    let column = dataset.event_date_column();
    let days = batch
        .column(column)
        .ok()
        .and_then(|c| c.date().ok().and_then(|ca| ca.phys.get(0)))
        .ok_or_else(|| mismatch(format!("missing partition date column '{column}'")))?;
    let date = crate::parse::date_from_epoch_days(days)
        .ok_or_else(|| mismatch(format!("out-of-range date in '{column}'")))?;

    match dataset {
        Dataset::EquityOhlc | Dataset::BulkDeals | Dataset::BlockDeals => {
            Ok(format!("{}{:02}", date.year(), date.month()))
        }
        _ => Ok(date.year().to_string()),
    }
}
