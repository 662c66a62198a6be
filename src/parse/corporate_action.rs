use std::{path::Path, sync::LazyLock};

use chrono::{DateTime, NaiveDate, Utc};
use polars::prelude::*;
use regex::Regex;

use crate::{
    datasets::{CorporateActionKind, Dataset},
    envelope::{EventTime, Stamper},
    error::ParseError,
    parse::{
        BulletinParser, ColumnKind, ColumnSpec, TableSpec, date_from_epoch_days,
        eod_event_time_ms, read_table,
    },
};

const CA_SPEC: TableSpec = TableSpec {
    dataset: "nse_corporate_actions",
    columns: &[
        ColumnSpec::required("SYMBOL", "symbol", ColumnKind::Symbol),
        ColumnSpec::optional("SERIES", "series", ColumnKind::Tag),
        ColumnSpec::optional("FACE VALUE", "face_value", ColumnKind::Float64),
        ColumnSpec::required("PURPOSE", "purpose", ColumnKind::String),
        ColumnSpec::required("EX-DATE", "ex_date", ColumnKind::Date("%d-%b-%Y")),
        ColumnSpec::optional("RECORD DATE", "record_date", ColumnKind::Date("%d-%b-%Y")),
    ],
};

// Purpose strings are free text; these cover the exchange's standard
// phrasings for ratio-bearing events.
static SPLIT_FROM_TO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)FROM\s*(?:RS\.?|RE\.?)\s*(\d+(?:\.\d+)?).*?TO\s*(?:RS\.?|RE\.?)\s*(\d+(?:\.\d+)?)")
        .expect("valid regex")
});
static RATIO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*:\s*(\d+)").expect("valid regex"));

/// Classifies a purpose string and derives its price adjustment factor.
///
/// Historical prices before the ex-date are divided by this factor, so it
/// is `1.0` for cash events (dividends) and `> 1` for splits and bonuses.
pub fn adjustment_factor(purpose: &str) -> (CorporateActionKind, f64) {
    let upper = purpose.to_uppercase();

    if upper.contains("SPLIT") || upper.contains("SUB-DIVISION") || upper.contains("SUBDIVISION") {
        if let Some(caps) = SPLIT_FROM_TO.captures(&upper) {
            let from: f64 = caps[1].parse().unwrap_or(1.0);
            let to: f64 = caps[2].parse().unwrap_or(1.0);
            if to > 0.0 && from > 0.0 {
                return (CorporateActionKind::Split, from / to);
            }
        }
        if let Some(caps) = RATIO.captures(&upper) {
            let a: f64 = caps[1].parse().unwrap_or(1.0);
            let b: f64 = caps[2].parse().unwrap_or(1.0);
            if a > 0.0 && b > 0.0 {
                return (CorporateActionKind::Split, b / a);
            }
        }
        return (CorporateActionKind::Split, 1.0);
    }

    if upper.contains("BONUS") {
        if let Some(caps) = RATIO.captures(&upper) {
            let a: f64 = caps[1].parse().unwrap_or(0.0);
            let b: f64 = caps[2].parse().unwrap_or(1.0);
            if a > 0.0 && b > 0.0 {
                // a new shares for every b held.
                return (CorporateActionKind::Bonus, (a + b) / b);
            }
        }
        return (CorporateActionKind::Bonus, 1.0);
    }

    if upper.contains("RIGHTS") {
        return (CorporateActionKind::Rights, 1.0);
    }
    if upper.contains("MERGER") || upper.contains("AMALGAMATION") || upper.contains("SCHEME") {
        return (CorporateActionKind::Merger, 1.0);
    }
    (CorporateActionKind::Dividend, 1.0)
}

/// Stable identity for one action: free-text purposes can repeat per
/// symbol and ex-date, so the id hashes all three.
pub fn ca_id(symbol: &str, ex_date: NaiveDate, purpose: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(symbol.as_bytes());
    hasher.update(b"|");
    hasher.update(ex_date.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(purpose.as_bytes());
    hasher.finalize().to_hex()[..16].to_string()
}

/// Parser for the NSE corporate-actions bulletin.
pub struct CorporateActionParser {
    stamper: Stamper,
}

impl CorporateActionParser {
    pub fn new(stamper: Stamper) -> Self {
        Self { stamper }
    }
}

impl BulletinParser for CorporateActionParser {
    fn dataset(&self) -> Dataset {
        Dataset::CorporateActions
    }

    fn parse(
        &self,
        path: &Path,
        date: NaiveDate,
        ingest_time: DateTime<Utc>,
    ) -> Result<Option<DataFrame>, ParseError> {
        let mut df = read_table(path, &CA_SPEC)?;
        if df.height() == 0 {
            return Ok(None);
        }

        let symbols = df.column("symbol")?.str()?.clone();
        let purposes = df.column("purpose")?.str()?.clone();
        let ex_dates = df.column("ex_date")?.date()?.clone();

        let mut kinds = Vec::with_capacity(df.height());
        let mut factors = Vec::with_capacity(df.height());
        let mut ids = Vec::with_capacity(df.height());
        for row in 0..df.height() {
            let symbol = symbols.get(row).ok_or_else(|| ParseError::Malformed {
                dataset: CA_SPEC.dataset.to_string(),
                column: "symbol".to_string(),
                msg: format!("null symbol at row {row}"),
            })?;
            let purpose = purposes.get(row).ok_or_else(|| ParseError::Malformed {
                dataset: CA_SPEC.dataset.to_string(),
                column: "purpose".to_string(),
                msg: format!("null purpose at row {row}"),
            })?;
            let ex_date = ex_dates
                .phys
                .get(row)
                .and_then(date_from_epoch_days)
                .ok_or_else(|| ParseError::Malformed {
                    dataset: CA_SPEC.dataset.to_string(),
                    column: "ex_date".to_string(),
                    msg: format!("null ex_date at row {row}"),
                })?;

            let (kind, factor) = adjustment_factor(purpose);
            kinds.push(kind.to_string());
            factors.push(factor);
            ids.push(ca_id(symbol, ex_date, purpose));
        }

        df.with_column(Series::new("ca_kind".into(), kinds))?;
        df.with_column(Series::new("adjustment_factor".into(), factors))?;
        df.with_column(Series::new("ca_id".into(), ids))?;

        let stamped = self.stamper.stamp_batch(
            df,
            &["symbol", "ex_date", "ca_id"],
            EventTime::Constant(eod_event_time_ms(date)?),
            ingest_time,
        )?;
        Ok(Some(stamped))
    }
}
