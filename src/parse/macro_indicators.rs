use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use polars::prelude::*;

use crate::{
    datasets::Dataset,
    envelope::{EventTime, Stamper},
    error::ParseError,
    parse::{BulletinParser, ColumnKind, ColumnSpec, TableSpec, eod_event_time_ms, read_table},
};

const MACRO_SPEC: TableSpec = TableSpec {
    dataset: "macro_indicators",
    columns: &[
        ColumnSpec::required("Indicator", "indicator", ColumnKind::Tag),
        ColumnSpec::required("Date", "date", ColumnKind::Date("%Y-%m-%d")),
        ColumnSpec::required("Value", "value", ColumnKind::Float64),
        ColumnSpec::optional("Unit", "unit", ColumnKind::Tag),
    ],
};

/// Parser for macro indicator series (CPI, WPI, repo rate, FX reserves).
pub struct MacroIndicatorParser {
    stamper: Stamper,
}

impl MacroIndicatorParser {
    pub fn new(stamper: Stamper) -> Self {
        Self { stamper }
    }
}

impl BulletinParser for MacroIndicatorParser {
    fn dataset(&self) -> Dataset {
        Dataset::MacroIndicators
    }

    fn parse(
        &self,
        path: &Path,
        date: NaiveDate,
        ingest_time: DateTime<Utc>,
    ) -> Result<Option<DataFrame>, ParseError> {
        let df = read_table(path, &MACRO_SPEC)?;
        if df.height() == 0 {
            return Ok(None);
        }

        let stamped = self.stamper.stamp_batch(
            df,
            &["indicator", "date"],
            EventTime::Constant(eod_event_time_ms(date)?),
            ingest_time,
        )?;
        Ok(Some(stamped))
    }
}
