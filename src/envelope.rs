use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::{datasets::envelope_cols, error::ParseError};

// ================================================================================================
// Schema version
// ================================================================================================

/// Version tag of the shape of a payload, rendered as `v<N>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaVersion(pub u32);

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl std::str::FromStr for SchemaVersion {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix('v').ok_or_else(|| ParseError::Malformed {
            dataset: String::new(),
            column: "schema_version".to_string(),
            msg: format!("'{s}' does not start with 'v'"),
        })?;
        Ok(SchemaVersion(digits.parse()?))
    }
}

// ================================================================================================
// Envelope
// ================================================================================================

/// The record envelope of §3: identity and provenance of one observation.
///
/// Batches carry these as columns; this struct is the single-record view
/// used by checkpoints and tests.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: String,

    #[serde_as(as = "serde_with::TimestampMilliSeconds<i64>")]
    pub event_time: DateTime<Utc>,

    #[serde_as(as = "serde_with::TimestampMilliSeconds<i64>")]
    pub ingest_time: DateTime<Utc>,

    pub source: String,
    pub schema_version: SchemaVersion,
    pub entity_id: String,
}

// ================================================================================================
// Stamper
// ================================================================================================

/// Where a batch's logical event time comes from.
#[derive(Debug, Clone, Copy)]
pub enum EventTime<'a> {
    /// An existing int64 UTC-millisecond column.
    Column(&'a str),

    /// One logical instant for the whole batch (EOD bulletins).
    Constant(i64),
}

/// Sole entry point for creating envelopes. No component fabricates the
/// columns inline.
#[derive(Debug, Clone)]
pub struct Stamper {
    source: String,
    schema_version: SchemaVersion,
}

impl Stamper {
    pub fn new(source: impl Into<String>, schema_version: SchemaVersion) -> Self {
        Self {
            source: source.into(),
            schema_version,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Deterministic event identity: identical inputs always hash to the
    /// same id.
    pub fn event_id(&self, entity_id: &str, event_time_ms: i64) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.source.as_bytes());
        hasher.update(b"|");
        hasher.update(entity_id.as_bytes());
        hasher.update(b"|");
        hasher.update(&event_time_ms.to_le_bytes());
        hasher.finalize().to_hex()[..32].to_string()
    }

    pub fn envelope(
        &self,
        entity_id: &str,
        event_time: DateTime<Utc>,
        ingest_time: DateTime<Utc>,
    ) -> Envelope {
        Envelope {
            event_id: self.event_id(entity_id, event_time.timestamp_millis()),
            event_time,
            ingest_time,
            source: self.source.clone(),
            schema_version: self.schema_version,
            entity_id: entity_id.to_string(),
        }
    }

    /// Stamps the six envelope columns onto `df`.
    ///
    /// `entity_cols` are joined with `:` into `entity_id`; they must be
    /// non-null for every row.
    pub fn stamp_batch(
        &self,
        df: DataFrame,
        entity_cols: &[&str],
        event_time: EventTime<'_>,
        ingest_time: DateTime<Utc>,
    ) -> Result<DataFrame, ParseError> {
        let height = df.height();
        let entity_ids = join_entity_columns(&df, entity_cols)?;

        let event_times: Vec<i64> = match event_time {
            EventTime::Constant(ms) => vec![ms; height],
            EventTime::Column(name) => {
                let ca = df.column(name)?.i64()?;
                ca.into_iter()
                    .map(|v| {
                        v.ok_or_else(|| ParseError::Timestamp {
                            dataset: self.source.clone(),
                            msg: format!("null event time in column '{name}'"),
                        })
                    })
                    .collect::<Result<_, _>>()?
            }
        };

        let event_ids: Vec<String> = entity_ids
            .iter()
            .zip(&event_times)
            .map(|(entity, ts)| self.event_id(entity, *ts))
            .collect();

        let ingest_ms = ingest_time.timestamp_millis();
        let mut df = df;
        df.with_column(Series::new(envelope_cols::EVENT_ID.into(), event_ids))?;
        df.with_column(Series::new(envelope_cols::EVENT_TIME.into(), event_times))?;
        df.with_column(Series::new(
            envelope_cols::INGEST_TIME.into(),
            vec![ingest_ms; height],
        ))?;
        df.with_column(Series::new(
            envelope_cols::SOURCE.into(),
            vec![self.source.clone(); height],
        ))?;
        df.with_column(Series::new(
            envelope_cols::SCHEMA_VERSION.into(),
            vec![self.schema_version.to_string(); height],
        ))?;
        df.with_column(Series::new(envelope_cols::ENTITY_ID.into(), entity_ids))?;
        Ok(df)
    }
}

fn join_entity_columns(df: &DataFrame, entity_cols: &[&str]) -> Result<Vec<String>, ParseError> {
    let columns: Vec<&Column> = entity_cols
        .iter()
        .map(|name| df.column(name).map_err(ParseError::from))
        .collect::<Result<_, _>>()?;

    let mut out = Vec::with_capacity(df.height());
    for row in 0..df.height() {
        let mut parts = Vec::with_capacity(columns.len());
        for (col, name) in columns.iter().zip(entity_cols) {
            let value = col.get(row)?;
            if matches!(value, AnyValue::Null) {
                return Err(ParseError::Malformed {
                    dataset: String::new(),
                    column: (*name).to_string(),
                    msg: format!("null identity value at row {row}"),
                });
            }
            parts.push(anyvalue_to_key(&value));
        }
        out.push(parts.join(":"));
    }
    Ok(out)
}

/// Key rendering must be stable across runs; strings are used verbatim,
/// dates as ISO, numbers in their canonical form.
fn anyvalue_to_key(value: &AnyValue) -> String {
    match value {
        AnyValue::String(s) => (*s).to_string(),
        AnyValue::StringOwned(s) => s.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn sample_df() -> DataFrame {
        df![
            "symbol" => ["RELIANCE", "TCS"],
            "instrument_id" => ["INE002A01018", "INE467B01029"],
            "trade_date" => ["2024-01-02", "2024-01-02"],
            "close" => [2610.45, 3704.90],
        ]
        .unwrap()
    }

    #[test]
    fn event_id_is_reproducible() {
        let stamper = Stamper::new("nse_cm_bhavcopy", SchemaVersion(1));
        let a = stamper.event_id("RELIANCE:INE002A01018:2024-01-02", 1704220200000);
        let b = stamper.event_id("RELIANCE:INE002A01018:2024-01-02", 1704220200000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        // Any input change moves the id.
        let c = stamper.event_id("RELIANCE:INE002A01018:2024-01-02", 1704220200001);
        assert_ne!(a, c);
    }

    #[test]
    fn stamp_batch_adds_all_envelope_columns() {
        let stamper = Stamper::new("nse_cm_bhavcopy", SchemaVersion(1));
        let ingest = Utc.with_ymd_and_hms(2024, 1, 2, 13, 0, 0).unwrap();
        let stamped = stamper
            .stamp_batch(
                sample_df(),
                &["symbol", "instrument_id", "trade_date"],
                EventTime::Constant(1704220200000),
                ingest,
            )
            .unwrap();

        for col in envelope_cols::ALL {
            assert!(stamped.column(col).is_ok(), "missing envelope column {col}");
        }
        let entity = stamped.column("entity_id").unwrap().str().unwrap();
        assert_eq!(entity.get(0).unwrap(), "RELIANCE:INE002A01018:2024-01-02");
    }

    #[test]
    fn null_identity_is_rejected() {
        let df = df![
            "symbol" => [Some("RELIANCE"), None],
            "trade_date" => ["2024-01-02", "2024-01-02"],
        ]
        .unwrap();
        let stamper = Stamper::new("nse_cm_bhavcopy", SchemaVersion(1));
        let err = stamper.stamp_batch(
            df,
            &["symbol", "trade_date"],
            EventTime::Constant(0),
            Utc::now(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn schema_version_round_trips() {
        let v: SchemaVersion = "v3".parse().unwrap();
        assert_eq!(v, SchemaVersion(3));
        assert_eq!(v.to_string(), "v3");
        assert!("3".parse::<SchemaVersion>().is_err());
    }
}
