use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use polars::prelude::*;

use crate::{
    datasets::Dataset,
    envelope::{EventTime, Stamper},
    error::ParseError,
    parse::{BulletinParser, ColumnKind, ColumnSpec, TableSpec, eod_event_time_ms, read_table},
};

const SHAREHOLDING_SPEC: TableSpec = TableSpec {
    dataset: "shareholding_pattern",
    columns: &[
        ColumnSpec::required("Symbol", "symbol", ColumnKind::Symbol),
        ColumnSpec::required("Period Ended", "period_end", ColumnKind::Date("%d-%b-%Y")),
        ColumnSpec::required("Category", "category", ColumnKind::Tag),
        ColumnSpec::required("No. of Shares", "shares_held", ColumnKind::Int64),
        ColumnSpec::required("% of Total Shares", "percent_held", ColumnKind::Float64),
    ],
};

/// Parser for quarterly shareholding-pattern disclosures, one row per
/// holder category (promoter, FII, DII, public).
pub struct ShareholdingParser {
    stamper: Stamper,
}

impl ShareholdingParser {
    pub fn new(stamper: Stamper) -> Self {
        Self { stamper }
    }
}

impl BulletinParser for ShareholdingParser {
    fn dataset(&self) -> Dataset {
        Dataset::ShareholdingPattern
    }

    fn parse(
        &self,
        path: &Path,
        date: NaiveDate,
        ingest_time: DateTime<Utc>,
    ) -> Result<Option<DataFrame>, ParseError> {
        let df = read_table(path, &SHAREHOLDING_SPEC)?;
        if df.height() == 0 {
            return Ok(None);
        }

        let stamped = self.stamper.stamp_batch(
            df,
            &["symbol", "period_end", "category"],
            EventTime::Constant(eod_event_time_ms(date)?),
            ingest_time,
        )?;
        Ok(Some(stamped))
    }
}
