use std::{path::PathBuf, sync::Arc};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    datasets::{Dataset, Layer},
    error::ChampionResult,
    fetch::{Fetcher, SourceDescriptor, TradingDayOracle},
    flow::Flow,
    lake::{Compression, Lake},
    normalize::{self, NormalizeOptions},
    parse::{BulletinParser, calendar::TradingCalendar},
    runtime::{TaskContext, TaskOutcome, TaskSpec},
    validate::{ValidationResult, Validator},
    warehouse::loader::{LoadSource, Loader},
};

/// Result of ingesting one source for one logical date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSummary {
    pub source: String,
    pub date: NaiveDate,
    pub rows: usize,

    /// True when the remote authoritatively had no data (non-trading
    /// day) or the bulletin was empty.
    pub no_data: bool,

    pub pass_rate: f64,
    pub lake_dir: Option<PathBuf>,
    pub rows_loaded: u64,
}

/// One source's full materialization path:
/// fetch → parse → validate → lake (raw + normalized) → warehouse.
pub struct Pipeline {
    pub fetcher: Arc<Fetcher>,
    pub validator: Arc<Validator>,
    pub lake: Arc<Lake>,
    pub loader: Arc<Loader>,
    pub calendar: Option<Arc<TradingCalendar>>,
    pub normalize: NormalizeOptions,
    pub compression: Compression,
}

impl Pipeline {
    #[tracing::instrument(
        skip(self, descriptor, parser, ctx),
        fields(source = %descriptor.source, %date)
    )]
    pub async fn ingest(
        &self,
        descriptor: &SourceDescriptor,
        parser: &dyn BulletinParser,
        date: NaiveDate,
        ctx: &TaskContext,
    ) -> ChampionResult<IngestSummary> {
        let no_data = |rows| IngestSummary {
            source: descriptor.source.clone(),
            date,
            rows,
            no_data: true,
            pass_rate: 1.0,
            lake_dir: None,
            rows_loaded: 0,
        };

        let Some(local_path) = self.fetcher.fetch(descriptor, date, &ctx.cancel).await? else {
            info!("no bulletin for date, nothing to ingest");
            return Ok(no_data(0));
        };

        let Some(batch) = parser.parse(&local_path, date, ctx.now())? else {
            info!("bulletin was empty, nothing to ingest");
            return Ok(no_data(0));
        };
        let rows = batch.height();

        let dataset = parser.dataset();
        let trading_day = self
            .calendar
            .as_ref()
            .and_then(|c| c.is_trading_day(descriptor.exchange, date));
        let validation: ValidationResult = self.validator.validate(
            &batch,
            dataset.validation_schema(),
            ctx.now(),
            trading_day,
        )?;
        validation.ensure_passed(ctx.config.validation.fail_on_errors)?;

        // Raw is immutable history; normalized carries supersession
        // semantics. Reference datasets keep a single layer.
        let layers = dataset.layers();
        let mut lake_dir = None;
        if layers.contains(&Layer::Raw) {
            lake_dir = Some(
                self.lake
                    .write(&batch, Layer::Raw, dataset, self.compression)?,
            );
        }

        let queryable_layer = if layers.contains(&Layer::Normalized) {
            Layer::Normalized
        } else {
            Layer::Reference
        };
        let mut normalized = normalize::dedup_latest(&batch, dataset)?;
        match dataset {
            Dataset::EquityOhlc => {
                normalized = normalize::resolve_cross_listing(&normalized, &self.normalize)?;
                // Splits and bonuses already on file re-base any history
                // ingested after them, so backfills land pre-adjusted.
                if let Some(actions) =
                    self.lake.read(Layer::Normalized, Dataset::CorporateActions)?
                {
                    let actions =
                        normalize::dedup_latest(&actions, Dataset::CorporateActions)?;
                    normalized = normalize::apply_adjustments(&normalized, &actions)?;
                }
            }
            Dataset::SymbolMaster => {
                if let Some(existing) = self.lake.read(queryable_layer, Dataset::SymbolMaster)? {
                    normalized = normalize::scd2_merge(&existing, &normalized)?;
                }
            }
            _ => {}
        }

        // The master is a current-state table: each merged snapshot
        // supersedes it wholesale instead of appending parts.
        let normalized_dir = match dataset {
            Dataset::SymbolMaster => {
                self.lake
                    .rewrite(&normalized, queryable_layer, dataset, self.compression)?
            }
            _ => self
                .lake
                .write(&normalized, queryable_layer, dataset, self.compression)?,
        };
        lake_dir.get_or_insert(normalized_dir);

        let outcome = self
            .loader
            .load(LoadSource::Batch(normalized), dataset, false)
            .await?;

        Ok(IngestSummary {
            source: descriptor.source.clone(),
            date,
            rows,
            no_data: false,
            pass_rate: validation.pass_rate(),
            lake_dir,
            rows_loaded: outcome.rows_loaded,
        })
    }
}

/// Builds the daily EOD ingestion flow: one independent task per source.
/// Fetch tasks default to three retries; the flow's checkpoint carries a
/// summary per source.
pub fn eod_flow(
    pipeline: Arc<Pipeline>,
    sources: Vec<(SourceDescriptor, Arc<dyn BulletinParser>)>,
    date: NaiveDate,
) -> Flow {
    let mut flow = Flow::new("eod_ingest");
    for (descriptor, parser) in sources {
        let task_name = format!("ingest_{}", descriptor.source);
        let pipeline = pipeline.clone();
        flow = flow.task(
            TaskSpec::new(task_name).with_retries(3),
            &[],
            move |ctx, _inputs| {
                let pipeline = pipeline.clone();
                let descriptor = descriptor.clone();
                let parser = parser.clone();
                async move {
                    let summary = pipeline
                        .ingest(&descriptor, parser.as_ref(), date, &ctx)
                        .await?;
                    let rows = summary.rows as u64;
                    let loaded = summary.rows_loaded;
                    Ok(
                        TaskOutcome::new(serde_json::to_value(&summary).unwrap_or_default())
                            .with_rows(rows, loaded),
                    )
                }
            },
        );
    }
    flow
}
