use std::collections::{HashMap, HashSet};

use polars::prelude::*;

use crate::{
    datasets::{Dataset, Exchange, IndexAction, envelope_cols, ohlc_cols},
    error::ParseError,
    parse::{date_from_epoch_days, days_since_epoch},
};

/// Policies the normalizer applies beyond plain dedup.
#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    /// Winner for the same ISIN listed on several exchanges. NSE first by
    /// default; configurable per deployment.
    pub exchange_priority: Vec<Exchange>,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            exchange_priority: vec![Exchange::Nse, Exchange::Bse],
        }
    }
}

// ================================================================================================
// Dedup / supersession
// ================================================================================================

/// Collapses rows sharing the full dedup key, keeping the greatest
/// `ingest_time`. Late corrections supersede; distinct instruments under
/// one ticker survive because the key includes `instrument_id`.
pub fn dedup_latest(batch: &DataFrame, dataset: Dataset) -> Result<DataFrame, ParseError> {
    let mut subset: Vec<String> = dataset
        .identity_key()
        .iter()
        .map(|k| k.to_string())
        .collect();
    subset.retain(|k| batch.column(k).is_ok());
    if subset.is_empty() {
        return Ok(batch.clone());
    }

    let sorted = batch.sort(
        [envelope_cols::INGEST_TIME],
        SortMultipleOptions::default().with_order_descending(true),
    )?;
    Ok(sorted.unique_stable(Some(&subset), UniqueKeepStrategy::First, None)?)
}

// ================================================================================================
// Cross-exchange resolution
// ================================================================================================

/// Resolves the same ISIN appearing on both exchanges for one trade
/// date, keeping the highest-priority exchange's row. Rows without an
/// ISIN are never dropped.
pub fn resolve_cross_listing(
    batch: &DataFrame,
    options: &NormalizeOptions,
) -> Result<DataFrame, ParseError> {
    let Ok(isins) = batch.column(ohlc_cols::ISIN) else {
        return Ok(batch.clone());
    };
    let isins = isins.str()?.clone();
    let sources = batch.column(envelope_cols::SOURCE)?.str()?.clone();
    let dates = batch.column(ohlc_cols::TRADE_DATE)?.date()?.clone();

    let rank_of = |source: &str| -> usize {
        options
            .exchange_priority
            .iter()
            .position(|e| source.to_uppercase().starts_with(&e.to_string()))
            .unwrap_or(options.exchange_priority.len())
    };

    // Best rank per (isin, trade_date).
    let mut best: HashMap<(String, i32), usize> = HashMap::new();
    for row in 0..batch.height() {
        let (Some(isin), Some(source), Some(date)) =
            (isins.get(row), sources.get(row), dates.phys.get(row))
        else {
            continue;
        };
        let rank = rank_of(source);
        best.entry((isin.to_string(), date))
            .and_modify(|r| *r = (*r).min(rank))
            .or_insert(rank);
    }

    let keep: Vec<u32> = (0..batch.height())
        .filter(|&row| {
            match (isins.get(row), sources.get(row), dates.phys.get(row)) {
                (Some(isin), Some(source), Some(date)) => {
                    best[&(isin.to_string(), date)] == rank_of(source)
                }
                _ => true,
            }
        })
        .map(|row| row as u32)
        .collect();

    let index = UInt32Chunked::from_vec("idx".into(), keep);
    Ok(batch.take(&index)?)
}

// ================================================================================================
// Corporate-action price adjustment
// ================================================================================================

/// Divides historical prices by the cumulative adjustment factor of all
/// actions with a later ex-date, giving a continuous adjusted series.
///
/// `actions` must carry `symbol`, `ex_date`, `adjustment_factor`.
pub fn apply_adjustments(
    ohlc: &DataFrame,
    actions: &DataFrame,
) -> Result<DataFrame, ParseError> {
    let action_symbols = actions.column("symbol")?.str()?.clone();
    let ex_dates = actions.column("ex_date")?.date()?.clone();
    let factors = actions.column("adjustment_factor")?.f64()?.clone();

    let mut by_symbol: HashMap<String, Vec<(i32, f64)>> = HashMap::new();
    for row in 0..actions.height() {
        let (Some(symbol), Some(ex_date), Some(factor)) = (
            action_symbols.get(row),
            ex_dates.phys.get(row),
            factors.get(row),
        ) else {
            continue;
        };
        if factor > 0.0 && factor != 1.0 {
            by_symbol
                .entry(symbol.to_string())
                .or_default()
                .push((ex_date, factor));
        }
    }
    if by_symbol.is_empty() {
        return Ok(ohlc.clone());
    }

    let symbols = ohlc.column(ohlc_cols::SYMBOL)?.str()?.clone();
    let trade_dates = ohlc.column(ohlc_cols::TRADE_DATE)?.date()?.clone();

    // Cumulative divisor per row: product of factors strictly after the
    // trade date.
    let divisors: Vec<f64> = (0..ohlc.height())
        .map(|row| {
            match (symbols.get(row), trade_dates.phys.get(row)) {
                (Some(symbol), Some(date)) => by_symbol
                    .get(symbol)
                    .map(|events| {
                        events
                            .iter()
                            .filter(|(ex_date, _)| *ex_date > date)
                            .map(|(_, factor)| factor)
                            .product()
                    })
                    .unwrap_or(1.0),
                _ => 1.0,
            }
        })
        .collect();

    let mut out = ohlc.clone();
    for name in [
        ohlc_cols::OPEN,
        ohlc_cols::HIGH,
        ohlc_cols::LOW,
        ohlc_cols::CLOSE,
        ohlc_cols::PREV_CLOSE,
    ] {
        let Ok(column) = ohlc.column(name) else {
            continue;
        };
        let prices = column.f64()?;
        let adjusted: Vec<Option<f64>> = prices
            .into_iter()
            .zip(&divisors)
            .map(|(price, divisor)| price.map(|p| p / divisor))
            .collect();
        out.with_column(Series::new(PlSmallStr::from_str(name), adjusted))?;
    }
    Ok(out)
}

// ================================================================================================
// Symbol master SCD-2
// ================================================================================================

const SCD_TRACKED: [&str; 4] = ["isin", "company_name", "series", "face_value"];

/// Merges a fresh master snapshot into the existing SCD-2 table.
///
/// Open rows whose tracked attributes changed are closed at the
/// snapshot's `valid_from`; changed and brand-new symbols contribute a
/// new open version. Unchanged symbols pass through untouched, so
/// re-running a snapshot is a no-op.
pub fn scd2_merge(existing: &DataFrame, snapshot: &DataFrame) -> Result<DataFrame, ParseError> {
    let snap_height = snapshot.height();
    let snap_key = row_keys(snapshot)?;
    let snap_fingerprint = attribute_fingerprints(snapshot);
    let snap_valid_from = snapshot.column("valid_from")?.date()?.clone();

    if existing.height() == 0 {
        return Ok(snapshot.clone());
    }
    let exist_key = row_keys(existing)?;
    let exist_fingerprint = attribute_fingerprints(existing);
    let exist_valid_to = existing.column("valid_to")?.date()?.clone();

    // Latest open version per key in the existing table.
    let mut open_rows: HashMap<&str, usize> = HashMap::new();
    for (row, key) in exist_key.iter().enumerate() {
        if exist_valid_to.phys.get(row).is_none() {
            open_rows.insert(key.as_str(), row);
        }
    }

    let mut changed_keys: HashSet<String> = HashSet::new();
    let mut fresh_rows: Vec<u32> = Vec::new();
    for row in 0..snap_height {
        match open_rows.get(snap_key[row].as_str()) {
            Some(&open_row) if exist_fingerprint[open_row] == snap_fingerprint[row] => {}
            _ => {
                changed_keys.insert(snap_key[row].clone());
                fresh_rows.push(row as u32);
            }
        }
    }

    // Close open intervals for changed keys.
    let closing_date: HashMap<String, i32> = (0..snap_height)
        .filter_map(|row| {
            snap_valid_from
                .phys
                .get(row)
                .map(|d| (snap_key[row].clone(), d))
        })
        .collect();
    let closed: Vec<Option<i32>> = (0..existing.height())
        .map(|row| {
            let current = exist_valid_to.phys.get(row);
            if current.is_none()
                && changed_keys.contains(&exist_key[row])
                && open_rows.get(exist_key[row].as_str()) == Some(&row)
            {
                closing_date.get(&exist_key[row]).copied()
            } else {
                current
            }
        })
        .collect();

    let mut out = existing.clone();
    out.with_column(Series::new("valid_to".into(), closed).cast(&DataType::Date)?)?;

    if fresh_rows.is_empty() {
        return Ok(out);
    }
    let index = UInt32Chunked::from_vec("idx".into(), fresh_rows);
    let additions = snapshot.take(&index)?;
    Ok(out.vstack(&additions.select(out.get_column_names_str())?)?)
}

fn row_keys(df: &DataFrame) -> Result<Vec<String>, ParseError> {
    let symbols = df.column("symbol")?.str()?.clone();
    let exchanges = df.column("exchange")?.str()?.clone();
    Ok((0..df.height())
        .map(|row| {
            format!(
                "{}|{}",
                symbols.get(row).unwrap_or_default(),
                exchanges.get(row).unwrap_or_default()
            )
        })
        .collect())
}

fn attribute_fingerprints(df: &DataFrame) -> Vec<String> {
    (0..df.height())
        .map(|row| {
            SCD_TRACKED
                .iter()
                .map(|name| {
                    df.column(name)
                        .ok()
                        .and_then(|c| c.get(row).ok())
                        .map(|v| v.to_string())
                        .unwrap_or_default()
                })
                .collect::<Vec<_>>()
                .join("\u{1}")
        })
        .collect()
}

// ================================================================================================
// Index membership diff
// ================================================================================================

/// Derives ADD/REMOVE actions by comparing consecutive membership
/// snapshots of one index. Symbols in both snapshots keep REBALANCE.
pub fn diff_membership(
    previous: &DataFrame,
    current: &DataFrame,
    effective_date: chrono::NaiveDate,
) -> Result<DataFrame, ParseError> {
    let prev_symbols: HashSet<String> = previous
        .column("symbol")?
        .str()?
        .into_iter()
        .flatten()
        .map(str::to_string)
        .collect();
    let curr_symbols_ca = current.column("symbol")?.str()?.clone();
    let curr_symbols: HashSet<String> = curr_symbols_ca
        .into_iter()
        .flatten()
        .map(str::to_string)
        .collect();
    let index_names = current.column("index_name")?.str()?.clone();
    let index_name = index_names.get(0).unwrap_or_default().to_string();

    let mut symbols = Vec::new();
    let mut actions = Vec::new();
    for symbol in curr_symbols.iter() {
        symbols.push(symbol.clone());
        actions.push(if prev_symbols.contains(symbol) {
            IndexAction::Rebalance.to_string()
        } else {
            IndexAction::Add.to_string()
        });
    }
    for symbol in prev_symbols.difference(&curr_symbols) {
        symbols.push(symbol.clone());
        actions.push(IndexAction::Remove.to_string());
    }

    let height = symbols.len();
    let mut df = DataFrame::new(vec![
        Series::new("index_name".into(), vec![index_name; height]).into(),
        Series::new("symbol".into(), symbols).into(),
        Series::new("action".into(), actions).into(),
    ])?;
    df.with_column(
        Series::new(
            "effective_date".into(),
            vec![days_since_epoch(effective_date); height],
        )
        .cast(&DataType::Date)?,
    )?;
    df.sort_in_place(["symbol"], SortMultipleOptions::default())?;
    Ok(df)
}

// ================================================================================================
// Helpers
// ================================================================================================

/// Latest trade date present in a normalized batch; drives freshness
/// checks in reporting.
pub fn latest_event_date(
    batch: &DataFrame,
    dataset: Dataset,
) -> Result<Option<chrono::NaiveDate>, ParseError> {
    let column = dataset.event_date_column();
    let Ok(dates) = batch.column(column) else {
        return Ok(None);
    };
    Ok(dates
        .date()?
        .phys
        .into_iter()
        .flatten()
        .max()
        .and_then(date_from_epoch_days))
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::parse::date_column;

    fn ohlc_with_ingest(ingest_times: &[i64]) -> DataFrame {
        let n = ingest_times.len();
        let mut df = df![
            "symbol" => vec!["RELIANCE"; n],
            "instrument_id" => vec!["INE002A01018"; n],
            "close" => (0..n).map(|i| 2600.0 + i as f64).collect::<Vec<_>>(),
            envelope_cols::INGEST_TIME => ingest_times.to_vec(),
        ]
        .unwrap();
        df.with_column(
            date_column("trade_date", NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), n).unwrap(),
        )
        .unwrap();
        df
    }

    #[test]
    fn later_ingest_time_supersedes() {
        let batch = ohlc_with_ingest(&[1_000, 2_000]);
        let out = dedup_latest(&batch, Dataset::EquityOhlc).unwrap();
        assert_eq!(out.height(), 1);
        // The row with ingest_time 2000 carried close 2601.0.
        assert_eq!(out.column("close").unwrap().f64().unwrap().get(0), Some(2601.0));
    }

    #[test]
    fn distinct_instruments_survive_dedup() {
        let mut batch = ohlc_with_ingest(&[1_000, 1_000]);
        batch
            .with_column(Series::new(
                "instrument_id".into(),
                ["INE148I01020", "INE148I08221"],
            ))
            .unwrap();
        let out = dedup_latest(&batch, Dataset::EquityOhlc).unwrap();
        assert_eq!(out.height(), 2);
    }

    #[test]
    fn nse_wins_cross_listing_by_default() {
        let n = 2;
        let mut batch = df![
            "symbol" => ["RELIANCE", "RELIANCE"],
            "isin" => ["INE002A01018", "INE002A01018"],
            "close" => [2610.45, 2611.0],
            envelope_cols::SOURCE => ["nse_cm_bhavcopy", "bse_eq_bhavcopy"],
        ]
        .unwrap();
        batch
            .with_column(
                date_column("trade_date", NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), n)
                    .unwrap(),
            )
            .unwrap();

        let out = resolve_cross_listing(&batch, &NormalizeOptions::default()).unwrap();
        assert_eq!(out.height(), 1);
        assert_eq!(
            out.column(envelope_cols::SOURCE).unwrap().str().unwrap().get(0),
            Some("nse_cm_bhavcopy")
        );
    }

    #[test]
    fn split_adjusts_prices_before_ex_date_only() {
        let mut ohlc = df![
            "symbol" => ["TATASTEEL", "TATASTEEL"],
            "close" => [500.0, 104.0],
        ]
        .unwrap();
        // First row trades before the split, second after.
        let dates = [
            days_since_epoch(NaiveDate::from_ymd_opt(2024, 3, 14).unwrap()),
            days_since_epoch(NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()),
        ];
        ohlc.with_column(
            Series::new("trade_date".into(), dates.to_vec())
                .cast(&DataType::Date)
                .unwrap(),
        )
        .unwrap();

        let mut actions = df![
            "symbol" => ["TATASTEEL"],
            "adjustment_factor" => [5.0],
        ]
        .unwrap();
        actions
            .with_column(
                date_column("ex_date", NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(), 1).unwrap(),
            )
            .unwrap();

        let out = apply_adjustments(&ohlc, &actions).unwrap();
        let closes = out.column("close").unwrap().f64().unwrap();
        assert_eq!(closes.get(0), Some(100.0), "pre-split price divided by 5");
        assert_eq!(closes.get(1), Some(104.0), "post-split price untouched");

        // Day-over-day move across the split is now 4%, within bounds.
        let continuity = (104.0 - 100.0f64) / 100.0;
        assert!(continuity.abs() <= 0.20);
    }

    fn master_row(symbol: &str, isin: &str, from: NaiveDate, to: Option<NaiveDate>) -> DataFrame {
        let mut df = df![
            "symbol" => [symbol],
            "exchange" => ["NSE"],
            "isin" => [isin],
            "company_name" => [format!("{symbol} Ltd")],
            "series" => ["EQ"],
            "face_value" => [10.0],
        ]
        .unwrap();
        df.with_column(date_column("valid_from", from, 1).unwrap()).unwrap();
        df.with_column(
            Series::new("valid_to".into(), vec![to.map(days_since_epoch)])
                .cast(&DataType::Date)
                .unwrap(),
        )
        .unwrap();
        df
    }

    #[test]
    fn scd2_closes_changed_and_keeps_unchanged() {
        let jan = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let jun = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();

        let existing = master_row("RELIANCE", "INE002A01018", jan, None)
            .vstack(&master_row("TCS", "INE467B01029", jan, None))
            .unwrap();
        // RELIANCE changes ISIN; TCS is unchanged.
        let snapshot = master_row("RELIANCE", "INE002A01099", jun, None)
            .vstack(&master_row("TCS", "INE467B01029", jun, None))
            .unwrap();

        let merged = scd2_merge(&existing, &snapshot).unwrap();
        assert_eq!(merged.height(), 3, "one closed + one unchanged + one new");

        let symbols = merged.column("symbol").unwrap().str().unwrap();
        let valid_to = merged.column("valid_to").unwrap().date().unwrap();
        let mut reliance_versions = 0;
        for row in 0..merged.height() {
            if symbols.get(row) == Some("RELIANCE") {
                reliance_versions += 1;
            }
        }
        assert_eq!(reliance_versions, 2);
        // Exactly one interval is closed.
        assert_eq!(
            (0..merged.height()).filter(|&r| valid_to.get(r).is_some()).count(),
            1
        );

        // Idempotence: merging the same snapshot again changes nothing.
        let again = scd2_merge(&merged, &snapshot).unwrap();
        assert_eq!(again.height(), 3);
    }

    #[test]
    fn membership_diff_classifies_adds_and_removes() {
        let previous = df![
            "index_name" => ["NIFTY 50", "NIFTY 50"],
            "symbol" => ["RELIANCE", "HDFC"],
        ]
        .unwrap();
        let current = df![
            "index_name" => ["NIFTY 50", "NIFTY 50"],
            "symbol" => ["RELIANCE", "LTIM"],
        ]
        .unwrap();

        let diff = diff_membership(
            &previous,
            &current,
            NaiveDate::from_ymd_opt(2024, 3, 28).unwrap(),
        )
        .unwrap();

        let by_symbol: HashMap<String, String> = {
            let symbols = diff.column("symbol").unwrap().str().unwrap();
            let actions = diff.column("action").unwrap().str().unwrap();
            (0..diff.height())
                .map(|r| {
                    (
                        symbols.get(r).unwrap().to_string(),
                        actions.get(r).unwrap().to_string(),
                    )
                })
                .collect()
        };
        assert_eq!(by_symbol["RELIANCE"], "REBALANCE");
        assert_eq!(by_symbol["LTIM"], "ADD");
        assert_eq!(by_symbol["HDFC"], "REMOVE");
    }
}
