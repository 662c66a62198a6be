pub mod bhavcopy;
pub mod calendar;
pub mod corporate_action;
pub mod deals;
pub mod financials;
pub mod index_constituents;
pub mod macro_indicators;
pub mod shareholding;
pub mod symbol_master;

use std::{fs::File, path::Path};

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Asia::Kolkata;
use polars::prelude::*;

use crate::{datasets::Dataset, error::ParseError};

// ================================================================================================
// Column specifications
// ================================================================================================

/// Target type of one bulletin column. Readers never infer types; every
/// source column is declared here and coerced explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Trimmed, uppercased ticker/identifier string.
    Symbol,
    /// Trimmed string; empty coerces to null.
    String,
    /// Trimmed low-cardinality string (series, categories, flags).
    Tag,
    /// Calendar date parsed with the given strftime format.
    Date(&'static str),
    Int64,
    Float64,
}

/// One source column and its canonical identity.
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    /// Header as it appears in the bulletin.
    pub source: &'static str,
    /// Canonical name in the output batch.
    pub canonical: &'static str,
    pub kind: ColumnKind,
    pub required: bool,
}

impl ColumnSpec {
    pub const fn required(source: &'static str, canonical: &'static str, kind: ColumnKind) -> Self {
        Self {
            source,
            canonical,
            kind,
            required: true,
        }
    }

    pub const fn optional(source: &'static str, canonical: &'static str, kind: ColumnKind) -> Self {
        Self {
            source,
            canonical,
            kind,
            required: false,
        }
    }
}

/// Column map for one bulletin shape.
#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub dataset: &'static str,
    pub columns: &'static [ColumnSpec],
}

// ================================================================================================
// Parser seam
// ================================================================================================

/// Turns a staged bulletin into a canonical, envelope-stamped batch.
///
/// `Ok(None)` means a structurally valid but empty file. Schema drift and
/// malformed values fail; unknown extra columns are dropped silently.
pub trait BulletinParser: Send + Sync {
    fn dataset(&self) -> Dataset;

    fn parse(
        &self,
        path: &Path,
        date: NaiveDate,
        ingest_time: DateTime<Utc>,
    ) -> Result<Option<DataFrame>, ParseError>;
}

// ================================================================================================
// Typed CSV reading
// ================================================================================================

/// Reads a bulletin CSV against `spec`: header check, canonical renames,
/// trim/uppercase/null transforms, then per-column typed coercion.
pub fn read_table(path: &Path, spec: &TableSpec) -> Result<DataFrame, ParseError> {
    let file = File::open(path)?;
    let raw = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .into_reader_with_file_handle(file)
        .finish()?;

    project_table(raw, spec)
}

/// Same coercion pipeline for an already-materialized all-string frame
/// (chunked streaming readers hand frames in directly).
pub fn project_table(raw: DataFrame, spec: &TableSpec) -> Result<DataFrame, ParseError> {
    let found: Vec<String> = raw
        .get_column_names()
        .iter()
        .map(|name| name.trim().to_string())
        .collect();

    let missing: Vec<String> = spec
        .columns
        .iter()
        .filter(|c| c.required && !found.iter().any(|f| f == c.source))
        .map(|c| c.source.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(ParseError::Schema {
            dataset: spec.dataset.to_string(),
            expected: spec.columns.iter().map(|c| c.source.to_string()).collect(),
            found,
            missing,
        });
    }

    // Bulletin headers are often padded; address columns by trimmed name.
    let mut raw = raw;
    let trimmed_names: Vec<PlSmallStr> = raw
        .get_column_names()
        .iter()
        .map(|name| PlSmallStr::from_str(name.trim()))
        .collect();
    raw.set_column_names(trimmed_names.clone())?;

    let mut out: Vec<Column> = Vec::with_capacity(spec.columns.len());
    for column in spec.columns {
        let Some(series) = raw.column(column.source).ok() else {
            continue;
        };
        let coerced = coerce_column(series.as_materialized_series(), column, spec.dataset)?;
        out.push(coerced.into());
    }

    Ok(DataFrame::new(out)?)
}

fn coerce_column(
    series: &Series,
    column: &ColumnSpec,
    dataset: &str,
) -> Result<Series, ParseError> {
    let ca = series.str()?;
    let name = PlSmallStr::from_str(column.canonical);

    let cleaned: Vec<Option<String>> = ca
        .into_iter()
        .map(|opt| {
            opt.map(str::trim)
                .filter(|s| !s.is_empty() && *s != "-" && *s != "NA")
                .map(|s| match column.kind {
                    ColumnKind::Symbol => s.to_uppercase(),
                    _ => s.to_string(),
                })
        })
        .collect();

    let malformed = |row: usize, value: &str, want: &str| ParseError::Malformed {
        dataset: dataset.to_string(),
        column: column.canonical.to_string(),
        msg: format!("row {row}: '{value}' is not a valid {want}"),
    };

    let series = match column.kind {
        ColumnKind::Symbol | ColumnKind::String | ColumnKind::Tag => Series::new(name, cleaned),
        ColumnKind::Int64 => {
            let values: Vec<Option<i64>> = cleaned
                .iter()
                .enumerate()
                .map(|(row, opt)| {
                    opt.as_deref()
                        .map(|s| {
                            let plain = s.replace(',', "");
                            plain.parse::<i64>().map_err(|_| malformed(row, s, "int64"))
                        })
                        .transpose()
                })
                .collect::<Result<_, _>>()?;
            Series::new(name, values)
        }
        ColumnKind::Float64 => {
            let values: Vec<Option<f64>> = cleaned
                .iter()
                .enumerate()
                .map(|(row, opt)| {
                    opt.as_deref()
                        .map(|s| {
                            let plain = s.replace(',', "");
                            plain
                                .parse::<f64>()
                                .map_err(|_| malformed(row, s, "float64"))
                        })
                        .transpose()
                })
                .collect::<Result<_, _>>()?;
            Series::new(name, values)
        }
        ColumnKind::Date(fmt) => {
            let values: Vec<Option<i32>> = cleaned
                .iter()
                .enumerate()
                .map(|(row, opt)| {
                    opt.as_deref()
                        .map(|s| {
                            NaiveDate::parse_from_str(s, fmt)
                                .map(days_since_epoch)
                                .map_err(|_| malformed(row, s, &format!("date ({fmt})")))
                        })
                        .transpose()
                })
                .collect::<Result<_, _>>()?;
            Series::new(name, values).cast(&DataType::Date)?
        }
    };

    Ok(series)
}

/// Physical representation of polars `Date`.
pub fn days_since_epoch(date: NaiveDate) -> i32 {
    (date - NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch")).num_days() as i32
}

/// Inverse of [`days_since_epoch`].
pub fn date_from_epoch_days(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(1970, 1, 1)
        .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(days as i64)))
}

/// A `Date` column holding `date` in every row.
pub fn date_column(name: &str, date: NaiveDate, height: usize) -> Result<Series, ParseError> {
    Ok(Series::new(
        PlSmallStr::from_str(name),
        vec![days_since_epoch(date); height],
    )
    .cast(&DataType::Date)?)
}

// ================================================================================================
// Time helpers
// ================================================================================================

/// NSE/BSE cash-market close.
const MARKET_CLOSE_IST: (u32, u32) = (15, 30);

/// Logical event time of an EOD bulletin: market close on the trade date,
/// IST, expressed as UTC milliseconds.
pub fn eod_event_time_ms(date: NaiveDate) -> Result<i64, ParseError> {
    let (hour, minute) = MARKET_CLOSE_IST;
    ist_to_utc_ms(date, NaiveTime::from_hms_opt(hour, minute, 0).expect("valid wall time"))
}

pub fn ist_to_utc_ms(date: NaiveDate, time: NaiveTime) -> Result<i64, ParseError> {
    Kolkata
        .from_local_datetime(&date.and_time(time))
        .single()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
        .ok_or_else(|| ParseError::Timestamp {
            dataset: String::new(),
            msg: format!("ambiguous IST local time {date} {time}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: TableSpec = TableSpec {
        dataset: "test_table",
        columns: &[
            ColumnSpec::required("SYMBOL", "symbol", ColumnKind::Symbol),
            ColumnSpec::required("CLOSE", "close", ColumnKind::Float64),
            ColumnSpec::required("TIMESTAMP", "trade_date", ColumnKind::Date("%d-%b-%Y")),
            ColumnSpec::optional("TOTTRDQTY", "volume", ColumnKind::Int64),
            ColumnSpec::optional("REMARK", "remark", ColumnKind::String),
        ],
    };

    fn write_csv(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("input.csv");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn reads_and_coerces_known_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "SYMBOL,CLOSE,TIMESTAMP,TOTTRDQTY,REMARK,IGNORED\n\
             reliance ,2610.45,02-JAN-2024,\"1,234\",  ,x\n",
        );

        let df = read_table(&path, &SPEC).unwrap();
        assert_eq!(df.width(), 5, "unknown columns are dropped");
        assert_eq!(
            df.column("symbol").unwrap().str().unwrap().get(0).unwrap(),
            "RELIANCE"
        );
        assert_eq!(df.column("volume").unwrap().i64().unwrap().get(0), Some(1234));
        // Whitespace-only optional value coerces to null.
        assert_eq!(df.column("remark").unwrap().null_count(), 1);
        assert_eq!(df.column("trade_date").unwrap().dtype(), &DataType::Date);
    }

    #[test]
    fn missing_required_column_is_schema_drift() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "SYMBOL,CLOSE\nRELIANCE,2610.45\n");

        let err = read_table(&path, &SPEC).unwrap_err();
        match err {
            ParseError::Schema { missing, .. } => {
                assert_eq!(missing, vec!["TIMESTAMP".to_string()]);
            }
            other => panic!("expected schema drift, got {other:?}"),
        }
    }

    #[test]
    fn malformed_numeric_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "SYMBOL,CLOSE,TIMESTAMP\nRELIANCE,not-a-price,02-JAN-2024\n",
        );

        let err = read_table(&path, &SPEC).unwrap_err();
        assert!(matches!(err, ParseError::Malformed { .. }));
    }

    #[test]
    fn ist_close_converts_to_utc() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let ms = eod_event_time_ms(date).unwrap();
        // 15:30 IST == 10:00 UTC.
        let utc = DateTime::<Utc>::from_timestamp_millis(ms).unwrap();
        assert_eq!(utc.format("%Y-%m-%d %H:%M").to_string(), "2024-01-02 10:00");
    }
}
