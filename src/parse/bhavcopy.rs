use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use polars::prelude::*;

use crate::{
    datasets::{Dataset, ohlc_cols},
    envelope::{EventTime, Stamper},
    error::ParseError,
    parse::{
        BulletinParser, ColumnKind, ColumnSpec, TableSpec, date_column, eod_event_time_ms,
        read_table,
    },
};

// ================================================================================================
// NSE cash-market bhavcopy
// ================================================================================================

const NSE_SPEC: TableSpec = TableSpec {
    dataset: "nse_cm_bhavcopy",
    columns: &[
        ColumnSpec::required("SYMBOL", ohlc_cols::SYMBOL, ColumnKind::Symbol),
        ColumnSpec::required("SERIES", ohlc_cols::SERIES, ColumnKind::Tag),
        ColumnSpec::required("OPEN", ohlc_cols::OPEN, ColumnKind::Float64),
        ColumnSpec::required("HIGH", ohlc_cols::HIGH, ColumnKind::Float64),
        ColumnSpec::required("LOW", ohlc_cols::LOW, ColumnKind::Float64),
        ColumnSpec::required("CLOSE", ohlc_cols::CLOSE, ColumnKind::Float64),
        ColumnSpec::optional("PREVCLOSE", ohlc_cols::PREV_CLOSE, ColumnKind::Float64),
        ColumnSpec::required("TOTTRDQTY", ohlc_cols::VOLUME, ColumnKind::Int64),
        ColumnSpec::optional("TOTTRDVAL", ohlc_cols::TURNOVER, ColumnKind::Float64),
        ColumnSpec::required("TIMESTAMP", ohlc_cols::TRADE_DATE, ColumnKind::Date("%d-%b-%Y")),
        ColumnSpec::optional("TOTALTRADES", ohlc_cols::TRADES, ColumnKind::Int64),
        ColumnSpec::required("ISIN", ohlc_cols::ISIN, ColumnKind::Symbol),
    ],
};

/// Parser for the NSE cash-market daily bhavcopy.
///
/// The ISIN doubles as `instrument_id`: distinct securities trading under
/// one ticker carry distinct ISINs, which is what keeps them apart through
/// dedup.
pub struct NseBhavcopyParser {
    stamper: Stamper,
}

impl NseBhavcopyParser {
    pub fn new(stamper: Stamper) -> Self {
        Self { stamper }
    }
}

impl BulletinParser for NseBhavcopyParser {
    fn dataset(&self) -> Dataset {
        Dataset::EquityOhlc
    }

    fn parse(
        &self,
        path: &Path,
        date: NaiveDate,
        ingest_time: DateTime<Utc>,
    ) -> Result<Option<DataFrame>, ParseError> {
        let mut df = read_table(path, &NSE_SPEC)?;
        if df.height() == 0 {
            return Ok(None);
        }

        let instrument = df.column(ohlc_cols::ISIN)?.clone();
        df.with_column(
            instrument
                .as_materialized_series()
                .clone()
                .with_name(ohlc_cols::INSTRUMENT_ID.into()),
        )?;

        let stamped = self.stamper.stamp_batch(
            df,
            &[
                ohlc_cols::SYMBOL,
                ohlc_cols::INSTRUMENT_ID,
                ohlc_cols::TRADE_DATE,
            ],
            EventTime::Constant(eod_event_time_ms(date)?),
            ingest_time,
        )?;
        Ok(Some(stamped))
    }
}

// ================================================================================================
// BSE equity bhavcopy
// ================================================================================================

const BSE_SPEC: TableSpec = TableSpec {
    dataset: "bse_eq_bhavcopy",
    columns: &[
        ColumnSpec::required("SC_CODE", ohlc_cols::INSTRUMENT_ID, ColumnKind::Symbol),
        ColumnSpec::required("SC_NAME", ohlc_cols::SYMBOL, ColumnKind::Symbol),
        ColumnSpec::optional("SC_GROUP", ohlc_cols::SERIES, ColumnKind::Tag),
        ColumnSpec::required("OPEN", ohlc_cols::OPEN, ColumnKind::Float64),
        ColumnSpec::required("HIGH", ohlc_cols::HIGH, ColumnKind::Float64),
        ColumnSpec::required("LOW", ohlc_cols::LOW, ColumnKind::Float64),
        ColumnSpec::required("CLOSE", ohlc_cols::CLOSE, ColumnKind::Float64),
        ColumnSpec::optional("PREVCLOSE", ohlc_cols::PREV_CLOSE, ColumnKind::Float64),
        ColumnSpec::optional("NO_TRADES", ohlc_cols::TRADES, ColumnKind::Int64),
        ColumnSpec::required("NO_OF_SHRS", ohlc_cols::VOLUME, ColumnKind::Int64),
        ColumnSpec::optional("NET_TURNOV", ohlc_cols::TURNOVER, ColumnKind::Float64),
        ColumnSpec::optional("ISIN_CODE", ohlc_cols::ISIN, ColumnKind::Symbol),
    ],
};

/// Parser for the BSE equity bhavcopy. Headers are renamed to the
/// NSE-canonical set; the scrip code is the instrument identity and the
/// trade date comes from the logical date (the file itself carries none).
pub struct BseBhavcopyParser {
    stamper: Stamper,
}

impl BseBhavcopyParser {
    pub fn new(stamper: Stamper) -> Self {
        Self { stamper }
    }
}

impl BulletinParser for BseBhavcopyParser {
    fn dataset(&self) -> Dataset {
        Dataset::EquityOhlc
    }

    fn parse(
        &self,
        path: &Path,
        date: NaiveDate,
        ingest_time: DateTime<Utc>,
    ) -> Result<Option<DataFrame>, ParseError> {
        let mut df = read_table(path, &BSE_SPEC)?;
        if df.height() == 0 {
            return Ok(None);
        }

        let dates = date_column(ohlc_cols::TRADE_DATE, date, df.height())?;
        df.with_column(dates)?;

        let stamped = self.stamper.stamp_batch(
            df,
            &[
                ohlc_cols::SYMBOL,
                ohlc_cols::INSTRUMENT_ID,
                ohlc_cols::TRADE_DATE,
            ],
            EventTime::Constant(eod_event_time_ms(date)?),
            ingest_time,
        )?;
        Ok(Some(stamped))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::{datasets::envelope_cols, envelope::SchemaVersion};

    fn nse_parser() -> NseBhavcopyParser {
        NseBhavcopyParser::new(Stamper::new("nse_cm_bhavcopy", SchemaVersion(1)))
    }

    fn trade_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
    }

    fn ingest_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 13, 5, 0).unwrap()
    }

    const NSE_HEADER: &str =
        "SYMBOL,SERIES,OPEN,HIGH,LOW,CLOSE,LAST,PREVCLOSE,TOTTRDQTY,TOTTRDVAL,TIMESTAMP,TOTALTRADES,ISIN";

    #[test]
    fn nse_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cm020124bhav.csv");
        std::fs::write(
            &path,
            format!(
                "{NSE_HEADER}\n\
                 RELIANCE,EQ,2595.00,2615.80,2590.10,2610.45,2610.00,2600.30,4521098,11801234567.45,02-JAN-2024,198453,INE002A01018\n\
                 TCS,EQ,3690.00,3710.00,3680.25,3704.90,3705.00,3688.15,1204531,4459832101.20,02-JAN-2024,87123,INE467B01029\n"
            ),
        )
        .unwrap();

        let df = nse_parser()
            .parse(&path, trade_date(), ingest_time())
            .unwrap()
            .unwrap();

        assert_eq!(df.height(), 2);
        for col in envelope_cols::ALL {
            assert!(df.column(col).is_ok(), "missing {col}");
        }
        let instrument = df.column(ohlc_cols::INSTRUMENT_ID).unwrap().str().unwrap();
        assert_eq!(instrument.get(0).unwrap(), "INE002A01018");
    }

    #[test]
    fn nse_empty_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cm020124bhav.csv");
        std::fs::write(&path, format!("{NSE_HEADER}\n")).unwrap();

        let batch = nse_parser()
            .parse(&path, trade_date(), ingest_time())
            .unwrap();
        assert!(batch.is_none());
    }

    #[test]
    fn nse_schema_drift_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cm020124bhav.csv");
        std::fs::write(&path, "SYMBOL,OPEN\nRELIANCE,2595.00\n").unwrap();

        let err = nse_parser()
            .parse(&path, trade_date(), ingest_time())
            .unwrap_err();
        assert!(matches!(err, ParseError::Schema { .. }));
    }

    #[test]
    fn bse_headers_map_to_canonical_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("EQ020124.csv");
        std::fs::write(
            &path,
            "SC_CODE,SC_NAME,SC_GROUP,OPEN,HIGH,LOW,CLOSE,PREVCLOSE,NO_TRADES,NO_OF_SHRS,NET_TURNOV\n\
             500325,RELIANCE,A,2595.00,2615.80,2590.10,2610.45,2600.30,198453,4521098,11801234567.45\n",
        )
        .unwrap();

        let parser = BseBhavcopyParser::new(Stamper::new("bse_eq_bhavcopy", SchemaVersion(1)));
        let df = parser
            .parse(&path, trade_date(), ingest_time())
            .unwrap()
            .unwrap();

        for canonical in [
            ohlc_cols::SYMBOL,
            ohlc_cols::INSTRUMENT_ID,
            ohlc_cols::OPEN,
            ohlc_cols::CLOSE,
            ohlc_cols::VOLUME,
            ohlc_cols::TRADE_DATE,
        ] {
            assert!(df.column(canonical).is_ok(), "missing {canonical}");
        }
        let instrument = df.column(ohlc_cols::INSTRUMENT_ID).unwrap().str().unwrap();
        assert_eq!(instrument.get(0).unwrap(), "500325");
    }
}
