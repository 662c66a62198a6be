use strum::IntoEnumIterator;

use crate::datasets::{Dataset, Layer};

/// ReplacingMergeTree DDL for every warehouse table.
///
/// Conventions shared by all tables:
/// - the replacing version is `ingest_time`, so replays dedup at merge,
/// - sort keys carry the full identity plus the instrument disambiguator,
/// - TTL follows the layer's retention tier,
/// - low-cardinality tags use `LowCardinality(String)`.
pub fn all_tables() -> Vec<String> {
    Dataset::iter().map(create_table).collect()
}

pub fn create_table(dataset: Dataset) -> String {
    let table = dataset.warehouse_table();
    let (columns, partition_by, order_by, ttl_column) = match dataset {
        Dataset::EquityOhlc => (
            r#"
    symbol              LowCardinality(String),
    instrument_id       String,
    series              LowCardinality(Nullable(String)),
    isin                Nullable(String),
    trade_date          Date,
    open_price          Nullable(Float64),
    high_price          Nullable(Float64),
    low_price           Nullable(Float64),
    close_price         Float64,
    prev_close          Nullable(Float64),
    tottrdqty           Int64,
    tottrdval           Nullable(Float64),
    total_trades        Nullable(Int64)"#,
            "toYYYYMM(trade_date)",
            "(symbol, instrument_id, trade_date)",
            "trade_date",
        ),
        Dataset::CorporateActions => (
            r#"
    symbol              LowCardinality(String),
    ex_date             Date,
    ca_id               String,
    ca_kind             LowCardinality(String),
    purpose             Nullable(String),
    record_date         Nullable(Date),
    adjustment_factor   Float64"#,
            "toYear(ex_date)",
            "(symbol, ex_date, ca_id)",
            "ex_date",
        ),
        Dataset::IndexConstituents => (
            r#"
    index_name          LowCardinality(String),
    symbol              LowCardinality(String),
    effective_date      Date,
    action              LowCardinality(String),
    isin                Nullable(String)"#,
            "toYear(effective_date)",
            "(index_name, symbol, effective_date)",
            "effective_date",
        ),
        Dataset::TradingCalendar => (
            r#"
    exchange            LowCardinality(String),
    date                Date,
    day_type            LowCardinality(String),
    note                Nullable(String)"#,
            "toYear(date)",
            "(exchange, date)",
            "date",
        ),
        Dataset::SymbolMaster => (
            r#"
    symbol              LowCardinality(String),
    exchange            LowCardinality(String),
    valid_from          Date,
    valid_to            Nullable(Date),
    isin                Nullable(String),
    company_name        Nullable(String),
    series              LowCardinality(Nullable(String)),
    face_value          Nullable(Float64)"#,
            "toYear(valid_from)",
            "(symbol, exchange, valid_from)",
            "valid_from",
        ),
        Dataset::BulkDeals | Dataset::BlockDeals => (
            r#"
    symbol              LowCardinality(String),
    instrument_id       String,
    trade_date          Date,
    client_name         String,
    side                LowCardinality(String),
    quantity            Int64,
    price               Float64"#,
            "toYYYYMM(trade_date)",
            "(symbol, instrument_id, trade_date, client_name)",
            "trade_date",
        ),
        Dataset::QuarterlyFinancials => (
            r#"
    symbol              LowCardinality(String),
    fiscal_year         Int64,
    fiscal_quarter      Int64,
    period_end          Date,
    revenue             Nullable(Float64),
    net_profit          Nullable(Float64),
    eps_basic           Nullable(Float64),
    total_income        Nullable(Float64),
    total_expenses      Nullable(Float64),
    profit_before_tax   Nullable(Float64),
    tax_expense         Nullable(Float64)"#,
            "(symbol, fiscal_year, fiscal_quarter)",
            "(symbol, fiscal_year, fiscal_quarter)",
            "period_end",
        ),
        Dataset::ShareholdingPattern => (
            r#"
    symbol              LowCardinality(String),
    period_end          Date,
    category            LowCardinality(String),
    shares_held         Nullable(Int64),
    percent_held        Nullable(Float64)"#,
            "toYear(period_end)",
            "(symbol, period_end, category)",
            "period_end",
        ),
        Dataset::MacroIndicators => (
            r#"
    indicator           LowCardinality(String),
    date                Date,
    value               Float64,
    unit                LowCardinality(Nullable(String))"#,
            "toYear(date)",
            "(indicator, date)",
            "date",
        ),
    };

    let retention_years = retention_years(dataset);
    format!(
        r#"CREATE TABLE IF NOT EXISTS {table} ({columns},
    event_id            String,
    event_time          DateTime64(3, 'UTC'),
    ingest_time         DateTime64(3, 'UTC'),
    source              LowCardinality(String),
    schema_version      LowCardinality(String)
) ENGINE = ReplacingMergeTree(ingest_time)
PARTITION BY {partition_by}
ORDER BY {order_by}
TTL {ttl_column} + INTERVAL {retention_years} YEAR DELETE
"#
    )
}

fn retention_years(dataset: Dataset) -> u32 {
    // The warehouse table holds the dataset's widest-retention layer.
    let days = dataset
        .layers()
        .iter()
        .filter_map(Layer::retention_days)
        .max()
        .unwrap_or(5 * 365);
    days.div_ceil(365)
}

/// Verification predicate limiting a count to one loaded partition.
pub fn partition_predicate(dataset: Dataset, partition_key: &str) -> String {
    match dataset {
        Dataset::EquityOhlc | Dataset::BulkDeals | Dataset::BlockDeals => {
            format!(
                "toYYYYMM({}) = {partition_key}",
                dataset.event_date_column()
            )
        }
        Dataset::QuarterlyFinancials => {
            // Composite partition rendered as fy<year>q<quarter>.
            let (year, quarter) = partition_key
                .strip_prefix("fy")
                .and_then(|rest| rest.split_once('q'))
                .unwrap_or(("0", "0"));
            format!("fiscal_year = {year} AND fiscal_quarter = {quarter}")
        }
        _ => format!(
            "toYear({}) = {partition_key}",
            dataset.event_date_column()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_dataset_has_ddl() {
        let statements = all_tables();
        assert_eq!(statements.len(), 10);
        for statement in &statements {
            assert!(statement.contains("ReplacingMergeTree(ingest_time)"));
            assert!(statement.contains("TTL"));
            assert!(statement.contains("CREATE TABLE IF NOT EXISTS"));
        }
    }

    #[test]
    fn ohlc_sort_key_disambiguates_instruments() {
        let ddl = create_table(Dataset::EquityOhlc);
        assert!(ddl.contains("ORDER BY (symbol, instrument_id, trade_date)"));
        assert!(ddl.contains("PARTITION BY toYYYYMM(trade_date)"));
        assert!(ddl.contains("INTERVAL 5 YEAR DELETE"));
    }

    #[test]
    fn reference_tables_keep_ten_years() {
        let ddl = create_table(Dataset::SymbolMaster);
        assert!(ddl.contains("INTERVAL 10 YEAR DELETE"));
    }

    #[test]
    fn financials_predicate_parses_composite_key() {
        let predicate = partition_predicate(Dataset::QuarterlyFinancials, "fy2024q3");
        assert_eq!(predicate, "fiscal_year = 2024 AND fiscal_quarter = 3");
    }
}
