use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use polars::prelude::*;

use crate::{
    datasets::{Dataset, IndexAction},
    envelope::{EventTime, Stamper},
    error::ParseError,
    parse::{
        BulletinParser, ColumnKind, ColumnSpec, TableSpec, date_column, eod_event_time_ms,
        read_table,
    },
};

const CONSTITUENTS_SPEC: TableSpec = TableSpec {
    dataset: "nse_index_constituents",
    columns: &[
        ColumnSpec::required("Index Name", "index_name", ColumnKind::String),
        ColumnSpec::required("Symbol", "symbol", ColumnKind::Symbol),
        ColumnSpec::optional("Series", "series", ColumnKind::Tag),
        ColumnSpec::optional("ISIN Code", "isin", ColumnKind::Symbol),
        ColumnSpec::optional("Action", "action", ColumnKind::Tag),
    ],
};

/// Parser for index membership bulletins.
///
/// Snapshot files carry no action column; every row is stamped
/// `REBALANCE` and the normalizer derives ADD/REMOVE by diffing against
/// the previous snapshot.
pub struct IndexConstituentsParser {
    stamper: Stamper,
}

impl IndexConstituentsParser {
    pub fn new(stamper: Stamper) -> Self {
        Self { stamper }
    }
}

impl BulletinParser for IndexConstituentsParser {
    fn dataset(&self) -> Dataset {
        Dataset::IndexConstituents
    }

    fn parse(
        &self,
        path: &Path,
        date: NaiveDate,
        ingest_time: DateTime<Utc>,
    ) -> Result<Option<DataFrame>, ParseError> {
        let mut df = read_table(path, &CONSTITUENTS_SPEC)?;
        if df.height() == 0 {
            return Ok(None);
        }

        df.with_column(date_column("effective_date", date, df.height())?)?;

        // Default missing/blank actions to REBALANCE.
        let actions: Vec<String> = match df.column("action").ok() {
            Some(col) => col
                .str()?
                .into_iter()
                .map(|opt| match opt {
                    Some(a) => a.to_uppercase(),
                    None => IndexAction::Rebalance.to_string(),
                })
                .collect(),
            None => vec![IndexAction::Rebalance.to_string(); df.height()],
        };
        df.with_column(Series::new("action".into(), actions))?;

        let stamped = self.stamper.stamp_batch(
            df,
            &["index_name", "symbol", "effective_date"],
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
    fn snapshot_defaults_to_rebalance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ind_nifty50list.csv");
        std::fs::write(
            &path,
            "Index Name,Symbol,Series,ISIN Code\n\
             NIFTY 50,RELIANCE,EQ,INE002A01018\n\
             NIFTY 50,TCS,EQ,INE467B01029\n",
        )
        .unwrap();

        let parser = IndexConstituentsParser::new(Stamper::new(
            "nse_index_constituents",
            SchemaVersion(1),
        ));
        let df = parser
            .parse(
                &path,
                NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                Utc.with_ymd_and_hms(2024, 1, 2, 13, 0, 0).unwrap(),
            )
            .unwrap()
            .unwrap();

        let actions = df.column("action").unwrap().str().unwrap();
        assert!(actions.into_iter().all(|a| a == Some("REBALANCE")));
        assert_eq!(df.column("effective_date").unwrap().dtype(), &DataType::Date);
    }
}
