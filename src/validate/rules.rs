use std::collections::HashSet;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use polars::prelude::*;
use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    config::ValidationConfig,
    datasets::{envelope_cols, ohlc_cols},
    error::ValidationError,
    parse::days_since_epoch,
    validate::{Severity, Violation, structural::TableRules},
};

/// Future-dated `event_time` allowance for EOD batches, in milliseconds.
const CLOCK_SKEW_TOLERANCE_MS: i64 = 5 * 60 * 1000;

/// Candidate columns for `date_range_sanity`, one per dataset family.
const EVENT_DATE_COLUMNS: [&str; 6] = [
    "trade_date",
    "ex_date",
    "effective_date",
    "date",
    "valid_from",
    "period_end",
];

/// Context shared by every rule application in one validation run.
pub struct RuleContext<'a> {
    pub rules: &'a TableRules,
    pub options: &'a ValidationConfig,
    pub now: DateTime<Utc>,

    /// Whether the batch's logical date was a declared trading day, when
    /// the calendar has coverage.
    pub trading_day: Option<bool>,

    /// Severity of `trading_day_completeness`; deployments may promote it.
    pub completeness_severity: Severity,
}

/// Cross-chunk state. Dedup keys must be remembered across the whole
/// batch, not per chunk.
#[derive(Default)]
pub struct EngineState {
    pub seen_keys: HashSet<String>,
}

// ================================================================================================
// Built-in rules
// ================================================================================================

/// The built-in business rules, all applied unless a schema disables them
/// by name.
#[derive(
    Copy, Clone, Debug, Display, EnumString, EnumIter, PartialEq, Eq, Hash,
)]
#[strum(serialize_all = "snake_case")]
pub enum BuiltinRule {
    OhlcHighLow,
    OhlcCloseInRange,
    OhlcOpenInRange,
    VolumeConsistency,
    TurnoverConsistency,
    PriceReasonableness,
    PriceContinuityPostCa,
    DuplicateDetection,
    DataFreshness,
    TimestampValidation,
    MissingCritical,
    NonNegativePrice,
    NonNegativeVolume,
    DateRangeSanity,
    TradingDayCompleteness,
}

impl BuiltinRule {
    pub fn severity(&self, ctx: &RuleContext) -> Severity {
        match self {
            BuiltinRule::OhlcHighLow
            | BuiltinRule::OhlcCloseInRange
            | BuiltinRule::OhlcOpenInRange
            | BuiltinRule::DuplicateDetection
            | BuiltinRule::TimestampValidation
            | BuiltinRule::MissingCritical
            | BuiltinRule::NonNegativePrice
            | BuiltinRule::NonNegativeVolume
            | BuiltinRule::DateRangeSanity => Severity::Critical,
            BuiltinRule::VolumeConsistency
            | BuiltinRule::TurnoverConsistency
            | BuiltinRule::PriceReasonableness
            | BuiltinRule::PriceContinuityPostCa
            | BuiltinRule::DataFreshness => Severity::Warning,
            BuiltinRule::TradingDayCompleteness => ctx.completeness_severity,
        }
    }

    /// Applies the rule to one chunk. Rules whose columns are absent
    /// return no violations; numeric comparisons carry explicit
    /// tolerances.
    pub fn apply(
        &self,
        chunk: &DataFrame,
        offset: usize,
        ctx: &RuleContext,
        state: &mut EngineState,
    ) -> Result<Vec<Violation>, ValidationError> {
        let severity = self.severity(ctx);
        let mut out = Vec::new();

        match self {
            BuiltinRule::OhlcHighLow => {
                if let (Some(high), Some(low)) = (f64s(chunk, ohlc_cols::HIGH), f64s(chunk, ohlc_cols::LOW)) {
                    self.push(&mut out, severity, offset, zip2(&high, &low, |h, l| h < l), |row| {
                        format!("high < low at row {row}")
                    });
                }
            }
            BuiltinRule::OhlcCloseInRange => {
                if let (Some(close), Some(high), Some(low)) = (
                    f64s(chunk, ohlc_cols::CLOSE),
                    f64s(chunk, ohlc_cols::HIGH),
                    f64s(chunk, ohlc_cols::LOW),
                ) {
                    let mask = zip3(&close, &high, &low, |c, h, l| c < l || c > h);
                    self.push(&mut out, severity, offset, mask, |row| {
                        format!("close outside [low, high] at row {row}")
                    });
                }
            }
            BuiltinRule::OhlcOpenInRange => {
                if let (Some(open), Some(high), Some(low)) = (
                    f64s(chunk, ohlc_cols::OPEN),
                    f64s(chunk, ohlc_cols::HIGH),
                    f64s(chunk, ohlc_cols::LOW),
                ) {
                    let mask = zip3(&open, &high, &low, |o, h, l| o < l || o > h);
                    self.push(&mut out, severity, offset, mask, |row| {
                        format!("open outside [low, high] at row {row}")
                    });
                }
            }
            BuiltinRule::VolumeConsistency => {
                if let (Some(volume), Some(trades)) =
                    (i64s(chunk, ohlc_cols::VOLUME), i64s(chunk, ohlc_cols::TRADES))
                {
                    let mask: Vec<bool> = volume
                        .iter()
                        .zip(&trades)
                        .map(|(v, t)| match (v, t) {
                            (Some(v), Some(t)) => (*v == 0) != (*t == 0),
                            _ => false,
                        })
                        .collect();
                    self.push(&mut out, severity, offset, mask, |row| {
                        format!("volume and trade count disagree at row {row}")
                    });
                }
            }
            BuiltinRule::TurnoverConsistency => {
                if let (Some(turnover), Some(volume), Some(high), Some(low)) = (
                    f64s(chunk, ohlc_cols::TURNOVER),
                    i64s(chunk, ohlc_cols::VOLUME),
                    f64s(chunk, ohlc_cols::HIGH),
                    f64s(chunk, ohlc_cols::LOW),
                ) {
                    // Turnover must sit inside the day's price envelope,
                    // with a 10% band for weighted-average effects.
                    let tolerance = 0.10;
                    let mask: Vec<bool> = (0..turnover.len())
                        .map(|i| {
                            match (turnover[i], volume[i], high[i], low[i]) {
                                (Some(t), Some(v), Some(h), Some(l)) if v > 0 => {
                                    let v = v as f64;
                                    t < v * l * (1.0 - tolerance) || t > v * h * (1.0 + tolerance)
                                }
                                _ => false,
                            }
                        })
                        .collect();
                    self.push(&mut out, severity, offset, mask, |row| {
                        format!("turnover outside volume × price envelope at row {row}")
                    });
                }
            }
            BuiltinRule::PriceReasonableness => {
                if let (Some(close), Some(prev)) = (
                    f64s(chunk, ohlc_cols::CLOSE),
                    f64s(chunk, ohlc_cols::PREV_CLOSE),
                ) {
                    let limit = ctx.options.max_price_move_pct / 100.0;
                    let mask = zip2(&close, &prev, move |c, p| {
                        p > 0.0 && ((c - p) / p).abs() > limit
                    });
                    self.push(&mut out, severity, offset, mask, |row| {
                        format!("move vs prev_close beyond limit at row {row}")
                    });
                }
            }
            BuiltinRule::PriceContinuityPostCa => {
                if let (Some(close), Some(prev), Some(factor)) = (
                    f64s(chunk, ohlc_cols::CLOSE),
                    f64s(chunk, ohlc_cols::PREV_CLOSE),
                    f64s(chunk, "adjustment_factor"),
                ) {
                    let limit = ctx.options.max_price_move_pct / 100.0;
                    let mask: Vec<bool> = (0..close.len())
                        .map(|i| match (close[i], prev[i], factor[i]) {
                            (Some(c), Some(p), Some(f)) if p > 0.0 && f > 0.0 => {
                                let adjusted_prev = p / f;
                                adjusted_prev > 0.0 && ((c - adjusted_prev) / adjusted_prev).abs() > limit
                            }
                            _ => false,
                        })
                        .collect();
                    self.push(&mut out, severity, offset, mask, |row| {
                        format!("price not continuous across corporate action at row {row}")
                    });
                }
            }
            BuiltinRule::DuplicateDetection => {
                let key_columns: Vec<_> = ctx
                    .rules
                    .key
                    .iter()
                    .filter_map(|k| chunk.column(k).ok())
                    .collect();
                if key_columns.len() == ctx.rules.key.len() && !key_columns.is_empty() {
                    let mut mask = vec![false; chunk.height()];
                    for (i, flag) in mask.iter_mut().enumerate() {
                        let key = key_columns
                            .iter()
                            .map(|c| c.get(i).map(|v| v.to_string()).unwrap_or_default())
                            .collect::<Vec<_>>()
                            .join("\u{1}");
                        *flag = !state.seen_keys.insert(key);
                    }
                    self.push(&mut out, severity, offset, mask, |row| {
                        format!("duplicate dedup key at row {row}")
                    });
                }
            }
            BuiltinRule::DataFreshness => {
                if let (Some(event), Some(ingest)) = (
                    i64s(chunk, envelope_cols::EVENT_TIME),
                    i64s(chunk, envelope_cols::INGEST_TIME),
                ) {
                    let max_ms = ctx.options.max_staleness_hours * 3_600_000;
                    let mask: Vec<bool> = event
                        .iter()
                        .zip(&ingest)
                        .map(|(e, i)| match (e, i) {
                            (Some(e), Some(i)) => i - e > max_ms,
                            _ => false,
                        })
                        .collect();
                    self.push(&mut out, severity, offset, mask, |row| {
                        format!("record staler than allowed at row {row}")
                    });
                }
            }
            BuiltinRule::TimestampValidation => {
                if let (Some(event), Some(ingest)) = (
                    i64s(chunk, envelope_cols::EVENT_TIME),
                    i64s(chunk, envelope_cols::INGEST_TIME),
                ) {
                    let tolerance_ms = CLOCK_SKEW_TOLERANCE_MS;
                    let mask: Vec<bool> = event
                        .iter()
                        .zip(&ingest)
                        .map(|(e, i)| match (e, i) {
                            (Some(e), Some(i)) => *e < 0 || e - i > tolerance_ms,
                            _ => true,
                        })
                        .collect();
                    self.push(&mut out, severity, offset, mask, |row| {
                        format!("event time negative or in the future at row {row}")
                    });
                }
            }
            BuiltinRule::MissingCritical => {
                for column_rule in ctx.rules.columns.iter().filter(|c| c.critical) {
                    if let Ok(column) = chunk.column(&column_rule.name) {
                        if column.null_count() == 0 {
                            continue;
                        }
                        let mask: Vec<bool> = column
                            .is_null()
                            .into_iter()
                            .map(|v| v == Some(true))
                            .collect();
                        let name = column_rule.name.clone();
                        self.push(&mut out, severity, offset, mask, move |row| {
                            format!("critical field '{name}' missing at row {row}")
                        });
                    }
                }
            }
            BuiltinRule::NonNegativePrice => {
                for name in [
                    ohlc_cols::OPEN,
                    ohlc_cols::HIGH,
                    ohlc_cols::LOW,
                    ohlc_cols::CLOSE,
                    ohlc_cols::PREV_CLOSE,
                ] {
                    if let Some(prices) = f64s(chunk, name) {
                        let mask: Vec<bool> =
                            prices.iter().map(|p| p.is_some_and(|p| p < 0.0)).collect();
                        self.push(&mut out, severity, offset, mask, move |row| {
                            format!("negative {name} at row {row}")
                        });
                    }
                }
            }
            BuiltinRule::NonNegativeVolume => {
                if let Some(volume) = i64s(chunk, ohlc_cols::VOLUME) {
                    let mask: Vec<bool> =
                        volume.iter().map(|v| v.is_some_and(|v| v < 0)).collect();
                    self.push(&mut out, severity, offset, mask, |row| {
                        format!("negative volume at row {row}")
                    });
                }
            }
            BuiltinRule::DateRangeSanity => {
                let floor = NaiveDate::from_ymd_opt(1990, 1, 1).expect("valid date");
                let ceiling = ctx.now.date_naive() + Duration::days(1);
                for name in EVENT_DATE_COLUMNS {
                    let Ok(column) = chunk.column(name) else {
                        continue;
                    };
                    let Ok(dates) = column.date() else {
                        continue;
                    };
                    let floor_days = days_since_epoch(floor);
                    let ceiling_days = days_since_epoch(ceiling);
                    let mask: Vec<bool> = dates
                        .phys
                        .into_iter()
                        .map(|d| d.is_some_and(|d| d < floor_days || d > ceiling_days))
                        .collect();
                    self.push(&mut out, severity, offset, mask, move |row| {
                        format!("{name} outside sane range at row {row}")
                    });
                    break;
                }
            }
            BuiltinRule::TradingDayCompleteness => {
                if ctx.trading_day == Some(true) {
                    if let Some(volume) = i64s(chunk, ohlc_cols::VOLUME) {
                        let mask: Vec<bool> =
                            volume.iter().map(|v| v.is_some_and(|v| v == 0)).collect();
                        self.push(&mut out, severity, offset, mask, |row| {
                            format!("zero volume on a declared trading day at row {row}")
                        });
                    }
                }
            }
        }

        Ok(out)
    }

    fn push(
        &self,
        out: &mut Vec<Violation>,
        severity: Severity,
        offset: usize,
        mask: Vec<bool>,
        message: impl Fn(usize) -> String,
    ) {
        let rule = self.to_string();
        for (i, flag) in mask.iter().enumerate() {
            if *flag {
                out.push(Violation {
                    rule: rule.clone(),
                    severity,
                    row: offset + i,
                    message: message(offset + i),
                });
            }
        }
    }
}

// Dedup-by-iteration helpers; nulls never violate a numeric rule.

fn f64s(df: &DataFrame, name: &str) -> Option<Vec<Option<f64>>> {
    let column = df.column(name).ok()?;
    let ca = column.f64().ok()?;
    Some(ca.into_iter().collect())
}

fn i64s(df: &DataFrame, name: &str) -> Option<Vec<Option<i64>>> {
    let column = df.column(name).ok()?;
    let ca = column.i64().ok()?;
    Some(ca.into_iter().collect())
}

fn zip2(
    a: &[Option<f64>],
    b: &[Option<f64>],
    violated: impl Fn(f64, f64) -> bool,
) -> Vec<bool> {
    a.iter()
        .zip(b)
        .map(|(x, y)| match (x, y) {
            (Some(x), Some(y)) => violated(*x, *y),
            _ => false,
        })
        .collect()
}

fn zip3(
    a: &[Option<f64>],
    b: &[Option<f64>],
    c: &[Option<f64>],
    violated: impl Fn(f64, f64, f64) -> bool,
) -> Vec<bool> {
    (0..a.len())
        .map(|i| match (a[i], b[i], c[i]) {
            (Some(x), Some(y), Some(z)) => violated(x, y, z),
            _ => false,
        })
        .collect()
}
