mod common;

use champion::{
    datasets::{Dataset, Layer},
    envelope::{SchemaVersion, Stamper},
    parse::{
        bhavcopy::NseBhavcopyParser, corporate_action::CorporateActionParser,
        date_from_epoch_days, symbol_master::SymbolMasterParser,
    },
};
use chrono::NaiveDate;
use common::{
    Scripted, ca_descriptor, ca_url, harness, nse_descriptor, nse_url, symbol_master_csv,
    symbol_master_descriptor, symbol_master_url,
};
use polars::prelude::*;

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

const BHAV_HEADER: &str =
    "SYMBOL,SERIES,OPEN,HIGH,LOW,CLOSE,LAST,PREVCLOSE,TOTTRDQTY,TOTTRDVAL,TIMESTAMP,TOTALTRADES,ISIN";

#[tokio::test]
async fn stock_split_rebases_history_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), false);

    // The 1:5 split on ex-date 2024-03-15 is published first.
    h.transport.push(
        &ca_url(day(2024, 3, 14)),
        Scripted::OwnedBody(
            "SYMBOL,SERIES,FACE VALUE,PURPOSE,EX-DATE,RECORD DATE\n\
             TATASTEEL,EQ,10,STOCK SPLIT 1:5,15-MAR-2024,16-MAR-2024\n"
                .into(),
        ),
    );
    let ca_parser =
        CorporateActionParser::new(Stamper::new("nse_corporate_actions", SchemaVersion(1)));
    let ca_summary = h
        .pipeline
        .ingest(&ca_descriptor(), &ca_parser, day(2024, 3, 14), &h.ctx)
        .await
        .unwrap();
    assert_eq!(ca_summary.rows, 1);

    // A backfill of the pre-split session lands after the split is
    // known: its prices come out divided by 5.
    h.transport.push(
        &nse_url(day(2024, 3, 14)),
        Scripted::OwnedBody(format!(
            "{BHAV_HEADER}\n\
             TATASTEEL,EQ,495.00,505.00,490.00,500.00,500.00,498.00,1000,497500.00,14-MAR-2024,100,INE081A01020\n"
        )
        .into_bytes()),
    );
    let ohlc_parser = NseBhavcopyParser::new(Stamper::new("nse_cm_bhavcopy", SchemaVersion(1)));
    h.pipeline
        .ingest(&nse_descriptor(), &ohlc_parser, day(2024, 3, 14), &h.ctx)
        .await
        .unwrap();

    // The ex-date session itself is already quoted post-split and must
    // stay untouched.
    h.transport.push(
        &nse_url(day(2024, 3, 15)),
        Scripted::OwnedBody(format!(
            "{BHAV_HEADER}\n\
             TATASTEEL,EQ,101.00,105.00,99.00,104.00,104.00,100.00,1000,103000.00,15-MAR-2024,100,INE081A01020\n"
        )
        .into_bytes()),
    );
    h.pipeline
        .ingest(&nse_descriptor(), &ohlc_parser, day(2024, 3, 15), &h.ctx)
        .await
        .unwrap();

    // Normalized lake layer: the pre-split partition holds adjusted
    // prices.
    let pre_split = h
        .config
        .lake_base
        .join("normalized/equity_ohlc/year=2024/month=03/day=14/part-0.parquet");
    let df = ParquetReader::new(std::fs::File::open(pre_split).unwrap())
        .finish()
        .unwrap();
    let close = df.column("close").unwrap().f64().unwrap().get(0).unwrap();
    assert_eq!(close, 100.0, "500 / 5 after the 1:5 split");
    assert_eq!(df.column("high").unwrap().f64().unwrap().get(0), Some(101.0));
    assert_eq!(df.column("low").unwrap().f64().unwrap().get(0), Some(98.0));

    // Warehouse view agrees on both sides of the ex-date.
    let rows = h.warehouse.ohlc.lock().unwrap();
    let pre = rows
        .iter()
        .find(|r| r.trade_date == day(2024, 3, 14))
        .expect("pre-split row loaded");
    let post = rows
        .iter()
        .find(|r| r.trade_date == day(2024, 3, 15))
        .expect("ex-date row loaded");
    assert_eq!(pre.close_price, 100.0);
    assert_eq!(post.close_price, 104.0);

    // Day-over-day continuity across the ex-date holds after
    // adjustment.
    let move_across_split = (post.close_price - pre.close_price) / pre.close_price;
    assert!(move_across_split.abs() <= 0.20);
}

#[tokio::test]
async fn symbol_master_snapshots_close_scd2_intervals() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), false);
    let parser = SymbolMasterParser::new(
        Stamper::new("nse_symbol_master", SchemaVersion(1)),
        champion::datasets::Exchange::Nse,
    );

    // January snapshot opens two intervals.
    h.transport.push(
        &symbol_master_url(day(2024, 1, 2)),
        Scripted::OwnedBody(
            symbol_master_csv(&[
                ("RELIANCE", "INE002A01018"),
                ("TCS", "INE467B01029"),
            ])
            .into_bytes(),
        ),
    );
    let first = h
        .pipeline
        .ingest(&symbol_master_descriptor(), &parser, day(2024, 1, 2), &h.ctx)
        .await
        .unwrap();
    assert_eq!(first.rows_loaded, 2);

    // June snapshot: RELIANCE re-identifies under a new ISIN, TCS is
    // unchanged.
    h.transport.push(
        &symbol_master_url(day(2024, 6, 3)),
        Scripted::OwnedBody(
            symbol_master_csv(&[
                ("RELIANCE", "INE002A01099"),
                ("TCS", "INE467B01029"),
            ])
            .into_bytes(),
        ),
    );
    h.pipeline
        .ingest(&symbol_master_descriptor(), &parser, day(2024, 6, 3), &h.ctx)
        .await
        .unwrap();

    // The reference table now carries three versions: the closed
    // RELIANCE interval, its successor, and the untouched TCS row.
    let master = h
        .pipeline
        .lake
        .read(Layer::Reference, Dataset::SymbolMaster)
        .unwrap()
        .expect("reference table materialized");
    assert_eq!(master.height(), 3);

    let symbols = master.column("symbol").unwrap().str().unwrap();
    let isins = master.column("isin").unwrap().str().unwrap();
    let valid_to = master.column("valid_to").unwrap().date().unwrap();

    let mut closed_reliance = None;
    let mut open_reliance = None;
    let mut tcs_versions = 0;
    for row in 0..master.height() {
        match symbols.get(row) {
            Some("RELIANCE") => match valid_to.get(row) {
                Some(days) => closed_reliance = Some((isins.get(row).unwrap().to_string(), days)),
                None => open_reliance = Some(isins.get(row).unwrap().to_string()),
            },
            Some("TCS") => {
                tcs_versions += 1;
                assert!(valid_to.get(row).is_none(), "unchanged row stays open");
            }
            other => panic!("unexpected symbol {other:?}"),
        }
    }

    let (closed_isin, closed_at) = closed_reliance.expect("old interval closed");
    assert_eq!(closed_isin, "INE002A01018");
    assert_eq!(date_from_epoch_days(closed_at), Some(day(2024, 6, 3)));
    assert_eq!(open_reliance.as_deref(), Some("INE002A01099"));
    assert_eq!(tcs_versions, 1);
}
