use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use polars::prelude::*;

use crate::{
    datasets::{Dataset, Exchange},
    envelope::{EventTime, Stamper},
    error::ParseError,
    parse::{
        BulletinParser, ColumnKind, ColumnSpec, TableSpec, date_column, eod_event_time_ms,
        read_table,
    },
};

const MASTER_SPEC: TableSpec = TableSpec {
    dataset: "symbol_master",
    columns: &[
        ColumnSpec::required("SYMBOL", "symbol", ColumnKind::Symbol),
        ColumnSpec::required("NAME OF COMPANY", "company_name", ColumnKind::String),
        ColumnSpec::required("SERIES", "series", ColumnKind::Tag),
        ColumnSpec::optional("DATE OF LISTING", "listing_date", ColumnKind::Date("%d-%b-%Y")),
        ColumnSpec::optional("PAID UP VALUE", "paid_up_value", ColumnKind::Float64),
        ColumnSpec::optional("MARKET LOT", "market_lot", ColumnKind::Int64),
        ColumnSpec::required("ISIN NUMBER", "isin", ColumnKind::Symbol),
        ColumnSpec::optional("FACE VALUE", "face_value", ColumnKind::Float64),
    ],
};

/// Parser for the listed-securities master.
///
/// Each snapshot row opens an SCD-2 interval: `valid_from` is the logical
/// date and `valid_to` starts null. Interval closure for changed
/// attributes happens in the normalizer, where the previous version is
/// available.
pub struct SymbolMasterParser {
    stamper: Stamper,
    exchange: Exchange,
}

impl SymbolMasterParser {
    pub fn new(stamper: Stamper, exchange: Exchange) -> Self {
        Self { stamper, exchange }
    }
}

impl BulletinParser for SymbolMasterParser {
    fn dataset(&self) -> Dataset {
        Dataset::SymbolMaster
    }

    fn parse(
        &self,
        path: &Path,
        date: NaiveDate,
        ingest_time: DateTime<Utc>,
    ) -> Result<Option<DataFrame>, ParseError> {
        let mut df = read_table(path, &MASTER_SPEC)?;
        if df.height() == 0 {
            return Ok(None);
        }

        df.with_column(Series::new(
            "exchange".into(),
            vec![self.exchange.to_string(); df.height()],
        ))?;
        df.with_column(date_column("valid_from", date, df.height())?)?;
        // Open interval until a later snapshot closes it.
        df.with_column(
            Series::new("valid_to".into(), vec![None::<i32>; df.height()])
                .cast(&DataType::Date)?,
        )?;

        let stamped = self.stamper.stamp_batch(
            df,
            &["symbol", "exchange", "valid_from"],
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
    use crate::envelope::SchemaVersion;

    #[test]
    fn opens_scd2_intervals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("EQUITY_L.csv");
        std::fs::write(
            &path,
            "SYMBOL,NAME OF COMPANY, SERIES, DATE OF LISTING, PAID UP VALUE, MARKET LOT, ISIN NUMBER, FACE VALUE\n\
             RELIANCE,Reliance Industries Limited,EQ,29-NOV-1995,10,1,INE002A01018,10\n",
        )
        .unwrap();

        let parser = SymbolMasterParser::new(
            Stamper::new("nse_symbol_master", SchemaVersion(1)),
            Exchange::Nse,
        );
        let df = parser
            .parse(
                &path,
                NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                Utc.with_ymd_and_hms(2024, 1, 2, 13, 0, 0).unwrap(),
            )
            .unwrap()
            .unwrap();

        assert_eq!(df.column("valid_from").unwrap().null_count(), 0);
        assert_eq!(df.column("valid_to").unwrap().null_count(), 1);
        assert_eq!(
            df.column("exchange").unwrap().str().unwrap().get(0),
            Some("NSE")
        );
    }
}
