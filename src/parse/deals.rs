use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use polars::prelude::*;

use crate::{
    datasets::{Dataset, DealKind},
    envelope::{EventTime, Stamper},
    error::ParseError,
    parse::{BulletinParser, ColumnKind, ColumnSpec, TableSpec, eod_event_time_ms, read_table},
};

const DEALS_SPEC: TableSpec = TableSpec {
    dataset: "deals",
    columns: &[
        ColumnSpec::required("Date", "trade_date", ColumnKind::Date("%d-%b-%Y")),
        ColumnSpec::required("Symbol", "symbol", ColumnKind::Symbol),
        ColumnSpec::optional("Security Name", "security_name", ColumnKind::String),
        ColumnSpec::required("Client Name", "client_name", ColumnKind::String),
        ColumnSpec::required("Buy/Sell", "side", ColumnKind::Tag),
        ColumnSpec::required("Quantity Traded", "quantity", ColumnKind::Int64),
        ColumnSpec::required("Trade Price / Wght. Avg. Price", "price", ColumnKind::Float64),
        ColumnSpec::optional("ISIN", "isin", ColumnKind::Symbol),
        ColumnSpec::optional("Remarks", "remarks", ColumnKind::String),
    ],
};

/// Parser for bulk- and block-deal bulletins; the two files share a shape
/// and differ only in the dataset they land in.
pub struct DealsParser {
    stamper: Stamper,
    kind: DealKind,
}

impl DealsParser {
    pub fn new(stamper: Stamper, kind: DealKind) -> Self {
        Self { stamper, kind }
    }
}

impl BulletinParser for DealsParser {
    fn dataset(&self) -> Dataset {
        match self.kind {
            DealKind::Bulk => Dataset::BulkDeals,
            DealKind::Block => Dataset::BlockDeals,
        }
    }

    fn parse(
        &self,
        path: &Path,
        date: NaiveDate,
        ingest_time: DateTime<Utc>,
    ) -> Result<Option<DataFrame>, ParseError> {
        let mut df = read_table(path, &DEALS_SPEC)?;
        if df.height() == 0 {
            return Ok(None);
        }

        // Deal bulletins predate ISIN columns; fall back to the ticker so
        // the identity tuple stays non-null.
        let instrument: Vec<Option<String>> = match df.column("isin").ok() {
            Some(isin) => {
                let isin = isin.str()?;
                let symbols = df.column("symbol")?.str()?;
                isin.into_iter()
                    .zip(symbols)
                    .map(|(i, s)| i.or(s).map(str::to_string))
                    .collect()
            }
            None => df
                .column("symbol")?
                .str()?
                .into_iter()
                .map(|s| s.map(str::to_string))
                .collect(),
        };
        df.with_column(Series::new("instrument_id".into(), instrument))?;

        df.with_column(Series::new(
            "deal_kind".into(),
            vec![self.kind.to_string(); df.height()],
        ))?;

        let stamped = self.stamper.stamp_batch(
            df,
            &["symbol", "instrument_id", "trade_date", "client_name"],
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
    fn bulk_deals_parse_with_instrument_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bulk.csv");
        std::fs::write(
            &path,
            "Date,Symbol,Security Name,Client Name,Buy/Sell,Quantity Traded,Trade Price / Wght. Avg. Price,Remarks\n\
             02-JAN-2024,SUZLON,Suzlon Energy Limited,GRAVITON RESEARCH CAPITAL LLP,BUY,\"12,04,531\",38.55,\n\
             02-JAN-2024,SUZLON,Suzlon Energy Limited,GRAVITON RESEARCH CAPITAL LLP,SELL,\"11,98,210\",38.60,\n",
        )
        .unwrap();

        let parser = DealsParser::new(
            Stamper::new("nse_bulk_deals", SchemaVersion(1)),
            DealKind::Bulk,
        );
        let df = parser
            .parse(
                &path,
                NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                Utc.with_ymd_and_hms(2024, 1, 2, 13, 0, 0).unwrap(),
            )
            .unwrap()
            .unwrap();

        assert_eq!(df.height(), 2);
        assert_eq!(
            df.column("instrument_id").unwrap().str().unwrap().get(0),
            Some("SUZLON")
        );
        assert_eq!(df.column("quantity").unwrap().i64().unwrap().get(0), Some(1204531));
        assert_eq!(
            df.column("deal_kind").unwrap().str().unwrap().get(0),
            Some("BULK")
        );
    }
}
