use chrono::{DateTime, NaiveDate, Utc};
use clickhouse::Row;
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    datasets::{Dataset, envelope_cols},
    error::WarehouseError,
    parse::date_from_epoch_days,
};

/// Column name map applied when loading canonical batches into the
/// warehouse: canonical names on the left, NSE-style table columns on
/// the right. `from_batch` resolves every renamed OHLC field through
/// this map, so the map is the single place the rename lives.
pub const OHLC_COLUMN_MAP: [(&str, &str); 7] = [
    ("open", "open_price"),
    ("high", "high_price"),
    ("low", "low_price"),
    ("close", "close_price"),
    ("volume", "tottrdqty"),
    ("turnover", "tottrdval"),
    ("trades", "total_trades"),
];

/// Canonical batch column feeding one warehouse column; identity for
/// unmapped names.
fn ohlc_source_column(warehouse_column: &'static str) -> &'static str {
    OHLC_COLUMN_MAP
        .iter()
        .find(|(_, mapped)| *mapped == warehouse_column)
        .map_or(warehouse_column, |(canonical, _)| canonical)
}

/// Envelope values shared by every table row. RowBinary has no nesting,
/// so each row struct inlines these five fields; this is only the
/// carrier between extraction and construction.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeFields {
    pub event_id: String,
    pub event_time: DateTime<Utc>,
    pub ingest_time: DateTime<Utc>,
    pub source: String,
    pub schema_version: String,
}

// ================================================================================================
// Row types
// ================================================================================================

#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub struct OhlcRow {
    pub symbol: String,
    pub instrument_id: String,
    pub series: Option<String>,
    pub isin: Option<String>,

    #[serde(with = "clickhouse::serde::chrono::date")]
    pub trade_date: NaiveDate,

    pub open_price: Option<f64>,
    pub high_price: Option<f64>,
    pub low_price: Option<f64>,
    pub close_price: f64,
    pub prev_close: Option<f64>,
    pub tottrdqty: i64,
    pub tottrdval: Option<f64>,
    pub total_trades: Option<i64>,

    pub event_id: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub event_time: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub ingest_time: DateTime<Utc>,
    pub source: String,
    pub schema_version: String,
}

#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub struct CorporateActionRow {
    pub symbol: String,

    #[serde(with = "clickhouse::serde::chrono::date")]
    pub ex_date: NaiveDate,

    pub ca_id: String,
    pub ca_kind: String,
    pub purpose: Option<String>,

    #[serde(with = "clickhouse::serde::chrono::date::option")]
    pub record_date: Option<NaiveDate>,

    pub adjustment_factor: f64,

    pub event_id: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub event_time: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub ingest_time: DateTime<Utc>,
    pub source: String,
    pub schema_version: String,
}

#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub struct IndexConstituentRow {
    pub index_name: String,
    pub symbol: String,

    #[serde(with = "clickhouse::serde::chrono::date")]
    pub effective_date: NaiveDate,

    pub action: String,
    pub isin: Option<String>,

    pub event_id: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub event_time: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub ingest_time: DateTime<Utc>,
    pub source: String,
    pub schema_version: String,
}

#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub struct TradingCalendarRow {
    pub exchange: String,

    #[serde(with = "clickhouse::serde::chrono::date")]
    pub date: NaiveDate,

    pub day_type: String,
    pub note: Option<String>,

    pub event_id: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub event_time: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub ingest_time: DateTime<Utc>,
    pub source: String,
    pub schema_version: String,
}

#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub struct SymbolMasterRow {
    pub symbol: String,
    pub exchange: String,

    #[serde(with = "clickhouse::serde::chrono::date")]
    pub valid_from: NaiveDate,

    #[serde(with = "clickhouse::serde::chrono::date::option")]
    pub valid_to: Option<NaiveDate>,

    pub isin: Option<String>,
    pub company_name: Option<String>,
    pub series: Option<String>,
    pub face_value: Option<f64>,

    pub event_id: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub event_time: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub ingest_time: DateTime<Utc>,
    pub source: String,
    pub schema_version: String,
}

#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub struct DealRow {
    pub symbol: String,
    pub instrument_id: String,

    #[serde(with = "clickhouse::serde::chrono::date")]
    pub trade_date: NaiveDate,

    pub client_name: String,
    pub side: String,
    pub quantity: i64,
    pub price: f64,

    pub event_id: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub event_time: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub ingest_time: DateTime<Utc>,
    pub source: String,
    pub schema_version: String,
}

#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub struct FinancialsRow {
    pub symbol: String,
    pub fiscal_year: i64,
    pub fiscal_quarter: i64,

    #[serde(with = "clickhouse::serde::chrono::date")]
    pub period_end: NaiveDate,

    pub revenue: Option<f64>,
    pub net_profit: Option<f64>,
    pub eps_basic: Option<f64>,
    pub total_income: Option<f64>,
    pub total_expenses: Option<f64>,
    pub profit_before_tax: Option<f64>,
    pub tax_expense: Option<f64>,

    pub event_id: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub event_time: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub ingest_time: DateTime<Utc>,
    pub source: String,
    pub schema_version: String,
}

#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub struct ShareholdingRow {
    pub symbol: String,

    #[serde(with = "clickhouse::serde::chrono::date")]
    pub period_end: NaiveDate,

    pub category: String,
    pub shares_held: Option<i64>,
    pub percent_held: Option<f64>,

    pub event_id: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub event_time: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub ingest_time: DateTime<Utc>,
    pub source: String,
    pub schema_version: String,
}

#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub struct MacroIndicatorRow {
    pub indicator: String,

    #[serde(with = "clickhouse::serde::chrono::date")]
    pub date: NaiveDate,

    pub value: f64,
    pub unit: Option<String>,

    pub event_id: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub event_time: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub ingest_time: DateTime<Utc>,
    pub source: String,
    pub schema_version: String,
}

// ================================================================================================
// TableRows
// ================================================================================================

/// One homogeneous set of typed rows headed for a warehouse table.
#[derive(Debug, Clone, PartialEq)]
pub enum TableRows {
    Ohlc(Vec<OhlcRow>),
    CorporateActions(Vec<CorporateActionRow>),
    IndexConstituents(Vec<IndexConstituentRow>),
    TradingCalendar(Vec<TradingCalendarRow>),
    SymbolMaster(Vec<SymbolMasterRow>),
    Deals(Vec<DealRow>),
    Financials(Vec<FinancialsRow>),
    Shareholding(Vec<ShareholdingRow>),
    MacroIndicators(Vec<MacroIndicatorRow>),
}

macro_rules! per_variant {
    ($self:expr, |$rows:ident| $body:expr) => {
        match $self {
            TableRows::Ohlc($rows) => $body,
            TableRows::CorporateActions($rows) => $body,
            TableRows::IndexConstituents($rows) => $body,
            TableRows::TradingCalendar($rows) => $body,
            TableRows::SymbolMaster($rows) => $body,
            TableRows::Deals($rows) => $body,
            TableRows::Financials($rows) => $body,
            TableRows::Shareholding($rows) => $body,
            TableRows::MacroIndicators($rows) => $body,
        }
    };
}

macro_rules! chunk_variant {
    ($rows:expr, $chunk_rows:expr, $variant:path) => {
        $rows
            .chunks($chunk_rows)
            .map(|c| $variant(c.to_vec()))
            .collect()
    };
}

impl TableRows {
    pub fn len(&self) -> usize {
        per_variant!(self, |rows| rows.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Splits into insert-sized chunks, preserving order.
    pub fn chunks(&self, chunk_rows: usize) -> Vec<TableRows> {
        let n = chunk_rows.max(1);
        match self {
            TableRows::Ohlc(rows) => chunk_variant!(rows, n, TableRows::Ohlc),
            TableRows::CorporateActions(rows) => {
                chunk_variant!(rows, n, TableRows::CorporateActions)
            }
            TableRows::IndexConstituents(rows) => {
                chunk_variant!(rows, n, TableRows::IndexConstituents)
            }
            TableRows::TradingCalendar(rows) => {
                chunk_variant!(rows, n, TableRows::TradingCalendar)
            }
            TableRows::SymbolMaster(rows) => chunk_variant!(rows, n, TableRows::SymbolMaster),
            TableRows::Deals(rows) => chunk_variant!(rows, n, TableRows::Deals),
            TableRows::Financials(rows) => chunk_variant!(rows, n, TableRows::Financials),
            TableRows::Shareholding(rows) => chunk_variant!(rows, n, TableRows::Shareholding),
            TableRows::MacroIndicators(rows) => {
                chunk_variant!(rows, n, TableRows::MacroIndicators)
            }
        }
    }

    /// Converts a canonical batch to typed rows, applying the per-table
    /// column name map and coercing dates and UTC timestamps.
    pub fn from_batch(dataset: Dataset, batch: &DataFrame) -> Result<TableRows, WarehouseError> {
        let view = BatchView {
            df: batch,
            table: dataset.warehouse_table(),
        };
        let rows = match dataset {
            Dataset::EquityOhlc => TableRows::Ohlc(
                (0..batch.height())
                    .map(|row| {
                        let env = view.envelope(row)?;
                        Ok(OhlcRow {
                            symbol: view.str_req("symbol", row)?,
                            instrument_id: view.str_req("instrument_id", row)?,
                            series: view.str_opt("series", row),
                            isin: view.str_opt("isin", row),
                            trade_date: view.date_req("trade_date", row)?,
                            open_price: view.f64_opt(ohlc_source_column("open_price"), row),
                            high_price: view.f64_opt(ohlc_source_column("high_price"), row),
                            low_price: view.f64_opt(ohlc_source_column("low_price"), row),
                            close_price: view.f64_req(ohlc_source_column("close_price"), row)?,
                            prev_close: view.f64_opt("prev_close", row),
                            tottrdqty: view.i64_req(ohlc_source_column("tottrdqty"), row)?,
                            tottrdval: view.f64_opt(ohlc_source_column("tottrdval"), row),
                            total_trades: view.i64_opt(ohlc_source_column("total_trades"), row),
                            event_id: env.event_id,
                            event_time: env.event_time,
                            ingest_time: env.ingest_time,
                            source: env.source,
                            schema_version: env.schema_version,
                        })
                    })
                    .collect::<Result<_, WarehouseError>>()?,
            ),
            Dataset::CorporateActions => TableRows::CorporateActions(
                (0..batch.height())
                    .map(|row| {
                        let env = view.envelope(row)?;
                        Ok(CorporateActionRow {
                            symbol: view.str_req("symbol", row)?,
                            ex_date: view.date_req("ex_date", row)?,
                            ca_id: view.str_req("ca_id", row)?,
                            ca_kind: view.str_req("ca_kind", row)?,
                            purpose: view.str_opt("purpose", row),
                            record_date: view.date_opt("record_date", row),
                            adjustment_factor: view.f64_req("adjustment_factor", row)?,
                            event_id: env.event_id,
                            event_time: env.event_time,
                            ingest_time: env.ingest_time,
                            source: env.source,
                            schema_version: env.schema_version,
                        })
                    })
                    .collect::<Result<_, WarehouseError>>()?,
            ),
            Dataset::IndexConstituents => TableRows::IndexConstituents(
                (0..batch.height())
                    .map(|row| {
                        let env = view.envelope(row)?;
                        Ok(IndexConstituentRow {
                            index_name: view.str_req("index_name", row)?,
                            symbol: view.str_req("symbol", row)?,
                            effective_date: view.date_req("effective_date", row)?,
                            action: view.str_req("action", row)?,
                            isin: view.str_opt("isin", row),
                            event_id: env.event_id,
                            event_time: env.event_time,
                            ingest_time: env.ingest_time,
                            source: env.source,
                            schema_version: env.schema_version,
                        })
                    })
                    .collect::<Result<_, WarehouseError>>()?,
            ),
            Dataset::TradingCalendar => TableRows::TradingCalendar(
                (0..batch.height())
                    .map(|row| {
                        let env = view.envelope(row)?;
                        Ok(TradingCalendarRow {
                            exchange: view.str_req("exchange", row)?,
                            date: view.date_req("date", row)?,
                            day_type: view.str_req("day_type", row)?,
                            note: view.str_opt("note", row),
                            event_id: env.event_id,
                            event_time: env.event_time,
                            ingest_time: env.ingest_time,
                            source: env.source,
                            schema_version: env.schema_version,
                        })
                    })
                    .collect::<Result<_, WarehouseError>>()?,
            ),
            Dataset::SymbolMaster => TableRows::SymbolMaster(
                (0..batch.height())
                    .map(|row| {
                        let env = view.envelope(row)?;
                        Ok(SymbolMasterRow {
                            symbol: view.str_req("symbol", row)?,
                            exchange: view.str_req("exchange", row)?,
                            valid_from: view.date_req("valid_from", row)?,
                            valid_to: view.date_opt("valid_to", row),
                            isin: view.str_opt("isin", row),
                            company_name: view.str_opt("company_name", row),
                            series: view.str_opt("series", row),
                            face_value: view.f64_opt("face_value", row),
                            event_id: env.event_id,
                            event_time: env.event_time,
                            ingest_time: env.ingest_time,
                            source: env.source,
                            schema_version: env.schema_version,
                        })
                    })
                    .collect::<Result<_, WarehouseError>>()?,
            ),
            Dataset::BulkDeals | Dataset::BlockDeals => TableRows::Deals(
                (0..batch.height())
                    .map(|row| {
                        let env = view.envelope(row)?;
                        Ok(DealRow {
                            symbol: view.str_req("symbol", row)?,
                            instrument_id: view.str_req("instrument_id", row)?,
                            trade_date: view.date_req("trade_date", row)?,
                            client_name: view.str_req("client_name", row)?,
                            side: view.str_req("side", row)?,
                            quantity: view.i64_req("quantity", row)?,
                            price: view.f64_req("price", row)?,
                            event_id: env.event_id,
                            event_time: env.event_time,
                            ingest_time: env.ingest_time,
                            source: env.source,
                            schema_version: env.schema_version,
                        })
                    })
                    .collect::<Result<_, WarehouseError>>()?,
            ),
            Dataset::QuarterlyFinancials => TableRows::Financials(
                (0..batch.height())
                    .map(|row| {
                        let env = view.envelope(row)?;
                        Ok(FinancialsRow {
                            symbol: view.str_req("symbol", row)?,
                            fiscal_year: view.i64_req("fiscal_year", row)?,
                            fiscal_quarter: view.i64_req("fiscal_quarter", row)?,
                            period_end: view.date_req("period_end", row)?,
                            revenue: view.f64_opt("revenue", row),
                            net_profit: view.f64_opt("net_profit", row),
                            eps_basic: view.f64_opt("eps_basic", row),
                            total_income: view.f64_opt("total_income", row),
                            total_expenses: view.f64_opt("total_expenses", row),
                            profit_before_tax: view.f64_opt("profit_before_tax", row),
                            tax_expense: view.f64_opt("tax_expense", row),
                            event_id: env.event_id,
                            event_time: env.event_time,
                            ingest_time: env.ingest_time,
                            source: env.source,
                            schema_version: env.schema_version,
                        })
                    })
                    .collect::<Result<_, WarehouseError>>()?,
            ),
            Dataset::ShareholdingPattern => TableRows::Shareholding(
                (0..batch.height())
                    .map(|row| {
                        let env = view.envelope(row)?;
                        Ok(ShareholdingRow {
                            symbol: view.str_req("symbol", row)?,
                            period_end: view.date_req("period_end", row)?,
                            category: view.str_req("category", row)?,
                            shares_held: view.i64_opt("shares_held", row),
                            percent_held: view.f64_opt("percent_held", row),
                            event_id: env.event_id,
                            event_time: env.event_time,
                            ingest_time: env.ingest_time,
                            source: env.source,
                            schema_version: env.schema_version,
                        })
                    })
                    .collect::<Result<_, WarehouseError>>()?,
            ),
            Dataset::MacroIndicators => TableRows::MacroIndicators(
                (0..batch.height())
                    .map(|row| {
                        let env = view.envelope(row)?;
                        Ok(MacroIndicatorRow {
                            indicator: view.str_req("indicator", row)?,
                            date: view.date_req("date", row)?,
                            value: view.f64_req("value", row)?,
                            unit: view.str_opt("unit", row),
                            event_id: env.event_id,
                            event_time: env.event_time,
                            ingest_time: env.ingest_time,
                            source: env.source,
                            schema_version: env.schema_version,
                        })
                    })
                    .collect::<Result<_, WarehouseError>>()?,
            ),
        };
        Ok(rows)
    }

    /// Greatest `ingest_time` in the set; drives idempotency hashing.
    pub fn max_ingest_time(&self) -> Option<DateTime<Utc>> {
        per_variant!(self, |rows| rows.iter().map(|r| r.ingest_time).max())
    }
}

// ================================================================================================
// Column access
// ================================================================================================

struct BatchView<'a> {
    df: &'a DataFrame,
    table: &'a str,
}

impl BatchView<'_> {
    fn mismatch(&self, msg: String) -> WarehouseError {
        WarehouseError::SchemaMismatch {
            table: self.table.to_string(),
            msg,
        }
    }

    fn str_req(&self, name: &str, row: usize) -> Result<String, WarehouseError> {
        self.str_opt(name, row)
            .ok_or_else(|| self.mismatch(format!("null or missing '{name}' at row {row}")))
    }

    fn str_opt(&self, name: &str, row: usize) -> Option<String> {
        self.df
            .column(name)
            .ok()
            .and_then(|c| c.str().ok())
            .and_then(|ca| ca.get(row))
            .map(str::to_string)
    }

    fn f64_req(&self, name: &str, row: usize) -> Result<f64, WarehouseError> {
        self.f64_opt(name, row)
            .ok_or_else(|| self.mismatch(format!("null or missing '{name}' at row {row}")))
    }

    fn f64_opt(&self, name: &str, row: usize) -> Option<f64> {
        self.df
            .column(name)
            .ok()
            .and_then(|c| c.f64().ok())
            .and_then(|ca| ca.get(row))
    }

    fn i64_req(&self, name: &str, row: usize) -> Result<i64, WarehouseError> {
        self.i64_opt(name, row)
            .ok_or_else(|| self.mismatch(format!("null or missing '{name}' at row {row}")))
    }

    fn i64_opt(&self, name: &str, row: usize) -> Option<i64> {
        self.df
            .column(name)
            .ok()
            .and_then(|c| c.i64().ok())
            .and_then(|ca| ca.get(row))
    }

    fn date_req(&self, name: &str, row: usize) -> Result<NaiveDate, WarehouseError> {
        self.date_opt(name, row)
            .ok_or_else(|| self.mismatch(format!("null or missing '{name}' at row {row}")))
    }

    fn date_opt(&self, name: &str, row: usize) -> Option<NaiveDate> {
        self.df
            .column(name)
            .ok()
            .and_then(|c| c.date().ok().map(|ca| ca.phys.get(row)))
            .flatten()
            .and_then(date_from_epoch_days)
    }

    fn ms_req(&self, name: &str, row: usize) -> Result<DateTime<Utc>, WarehouseError> {
        self.i64_req(name, row).and_then(|ms| {
            DateTime::<Utc>::from_timestamp_millis(ms)
                .ok_or_else(|| self.mismatch(format!("'{name}' out of range at row {row}")))
        })
    }

    fn envelope(&self, row: usize) -> Result<EnvelopeFields, WarehouseError> {
        Ok(EnvelopeFields {
            event_id: self.str_req(envelope_cols::EVENT_ID, row)?,
            event_time: self.ms_req(envelope_cols::EVENT_TIME, row)?,
            ingest_time: self.ms_req(envelope_cols::INGEST_TIME, row)?,
            source: self.str_req(envelope_cols::SOURCE, row)?,
            schema_version: self.str_req(envelope_cols::SCHEMA_VERSION, row)?,
        })
    }
}
