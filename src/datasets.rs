use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

// ================================================================================================
// Envelope column names
// ================================================================================================

/// Columns stamped onto every canonical batch. Only `envelope::Stamper`
/// writes them.
pub mod envelope_cols {
    pub const EVENT_ID: &str = "event_id";
    pub const EVENT_TIME: &str = "event_time";
    pub const INGEST_TIME: &str = "ingest_time";
    pub const SOURCE: &str = "source";
    pub const SCHEMA_VERSION: &str = "schema_version";
    pub const ENTITY_ID: &str = "entity_id";

    pub const ALL: [&str; 6] = [
        EVENT_ID,
        EVENT_TIME,
        INGEST_TIME,
        SOURCE,
        SCHEMA_VERSION,
        ENTITY_ID,
    ];
}

// ================================================================================================
// Exchanges & low-cardinality tags
// ================================================================================================

#[derive(
    Copy, Clone, Debug, Display, EnumString, EnumIter, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum Exchange {
    #[strum(serialize = "NSE")]
    Nse,

    #[strum(serialize = "BSE")]
    Bse,
}

#[derive(
    Copy, Clone, Debug, Display, EnumString, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum DayType {
    Trading,
    Weekend,
    Holiday,
    Special,
}

#[derive(
    Copy, Clone, Debug, Display, EnumString, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum IndexAction {
    Add,
    Remove,
    Rebalance,
}

#[derive(
    Copy, Clone, Debug, Display, EnumString, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum CorporateActionKind {
    Split,
    Bonus,
    Dividend,
    Rights,
    Merger,
}

#[derive(
    Copy, Clone, Debug, Display, EnumString, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum DealKind {
    Bulk,
    Block,
}

// ================================================================================================
// Lake layers
// ================================================================================================

#[derive(
    Copy, Clone, Debug, Display, EnumString, EnumIter, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum Layer {
    Raw,
    Normalized,
    Features,
    Reference,
    Intraday,
    Quarantine,
}

impl Layer {
    /// Warehouse and lake retention tier, in days. `None` means keep forever.
    pub fn retention_days(&self) -> Option<u32> {
        match self {
            Layer::Raw => Some(5 * 365),
            Layer::Normalized => Some(3 * 365),
            Layer::Reference => Some(10 * 365),
            Layer::Features | Layer::Intraday | Layer::Quarantine => None,
        }
    }
}

// ================================================================================================
// Dataset families
// ================================================================================================

/// Every dataset family the engine materializes. The per-variant tables
/// below are the stable contract shared by the parser, validator, lake
/// writer and warehouse loader.
#[derive(
    Copy, Clone, Debug, Display, EnumString, EnumIter, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum Dataset {
    EquityOhlc,
    CorporateActions,
    IndexConstituents,
    TradingCalendar,
    SymbolMaster,
    BulkDeals,
    BlockDeals,
    QuarterlyFinancials,
    ShareholdingPattern,
    MacroIndicators,
}

impl Dataset {
    /// Identity tuple used for deduplication. Always non-null.
    ///
    /// Ticker-bearing families always carry `instrument_id` next to
    /// `symbol`: distinct securities can trade under one ticker on the same
    /// day.
    pub fn identity_key(&self) -> &'static [&'static str] {
        match self {
            Dataset::EquityOhlc => &["symbol", "instrument_id", "trade_date"],
            Dataset::CorporateActions => &["symbol", "ex_date", "ca_id"],
            Dataset::IndexConstituents => &["index_name", "symbol", "effective_date"],
            Dataset::TradingCalendar => &["exchange", "date"],
            Dataset::SymbolMaster => &["symbol", "exchange", "valid_from"],
            Dataset::BulkDeals | Dataset::BlockDeals => {
                &["symbol", "instrument_id", "trade_date", "client_name"]
            }
            Dataset::QuarterlyFinancials => &["symbol", "fiscal_year", "fiscal_quarter"],
            Dataset::ShareholdingPattern => &["symbol", "period_end", "category"],
            Dataset::MacroIndicators => &["indicator", "date"],
        }
    }

    /// Hive partition keys, fixed per dataset.
    pub fn partition_keys(&self) -> &'static [&'static str] {
        match self {
            Dataset::EquityOhlc => &["year", "month", "day"],
            Dataset::CorporateActions => &["year"],
            Dataset::IndexConstituents => &["year"],
            Dataset::TradingCalendar => &["year"],
            Dataset::SymbolMaster => &["exchange"],
            Dataset::BulkDeals | Dataset::BlockDeals => &["year", "month"],
            Dataset::QuarterlyFinancials => &["year", "quarter"],
            Dataset::ShareholdingPattern => &["year", "quarter"],
            Dataset::MacroIndicators => &["year"],
        }
    }

    /// The column the date of a partition is derived from, for retention.
    pub fn event_date_column(&self) -> &'static str {
        match self {
            Dataset::EquityOhlc => "trade_date",
            Dataset::CorporateActions => "ex_date",
            Dataset::IndexConstituents => "effective_date",
            Dataset::TradingCalendar => "date",
            Dataset::SymbolMaster => "valid_from",
            Dataset::BulkDeals | Dataset::BlockDeals => "trade_date",
            Dataset::QuarterlyFinancials => "period_end",
            Dataset::ShareholdingPattern => "period_end",
            Dataset::MacroIndicators => "date",
        }
    }

    /// Layers this family materializes into.
    pub fn layers(&self) -> &'static [Layer] {
        match self {
            Dataset::EquityOhlc => &[Layer::Raw, Layer::Normalized],
            Dataset::CorporateActions
            | Dataset::IndexConstituents
            | Dataset::BulkDeals
            | Dataset::BlockDeals
            | Dataset::QuarterlyFinancials
            | Dataset::ShareholdingPattern
            | Dataset::MacroIndicators => &[Layer::Raw, Layer::Normalized],
            Dataset::TradingCalendar | Dataset::SymbolMaster => &[Layer::Reference],
        }
    }

    /// Target warehouse table.
    pub fn warehouse_table(&self) -> &'static str {
        match self {
            Dataset::EquityOhlc => "equity_ohlc",
            Dataset::CorporateActions => "corporate_actions",
            Dataset::IndexConstituents => "index_constituents",
            Dataset::TradingCalendar => "trading_calendar",
            Dataset::SymbolMaster => "symbol_master",
            Dataset::BulkDeals => "bulk_deals",
            Dataset::BlockDeals => "block_deals",
            Dataset::QuarterlyFinancials => "quarterly_financials",
            Dataset::ShareholdingPattern => "shareholding_pattern",
            Dataset::MacroIndicators => "macro_indicators",
        }
    }

    /// Name of the validation schema applied to this family's batches.
    pub fn validation_schema(&self) -> &'static str {
        match self {
            Dataset::EquityOhlc => "equity_ohlc",
            Dataset::CorporateActions => "corporate_actions",
            Dataset::IndexConstituents => "index_constituents",
            Dataset::TradingCalendar => "trading_calendar",
            Dataset::SymbolMaster => "symbol_master",
            Dataset::BulkDeals | Dataset::BlockDeals => "deals",
            Dataset::QuarterlyFinancials => "quarterly_financials",
            Dataset::ShareholdingPattern => "shareholding_pattern",
            Dataset::MacroIndicators => "macro_indicators",
        }
    }
}

// ================================================================================================
// Canonical OHLC columns
// ================================================================================================

/// NSE-canonical column names for the equity OHLC family. BSE headers are
/// renamed to these during parsing.
pub mod ohlc_cols {
    pub const SYMBOL: &str = "symbol";
    pub const SERIES: &str = "series";
    pub const ISIN: &str = "isin";
    pub const INSTRUMENT_ID: &str = "instrument_id";
    pub const TRADE_DATE: &str = "trade_date";
    pub const OPEN: &str = "open";
    pub const HIGH: &str = "high";
    pub const LOW: &str = "low";
    pub const CLOSE: &str = "close";
    pub const PREV_CLOSE: &str = "prev_close";
    pub const VOLUME: &str = "volume";
    pub const TURNOVER: &str = "turnover";
    pub const TRADES: &str = "trades";
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn dataset_tags_round_trip() {
        for dataset in Dataset::iter() {
            let tag = dataset.to_string();
            assert_eq!(Dataset::from_str(&tag).unwrap(), dataset);
        }
        assert_eq!(Dataset::EquityOhlc.to_string(), "equity_ohlc");
    }

    #[test]
    fn every_identity_key_disambiguates_tickers() {
        for dataset in [Dataset::EquityOhlc, Dataset::BulkDeals, Dataset::BlockDeals] {
            assert!(dataset.identity_key().contains(&"instrument_id"));
        }
    }

    #[test]
    fn retention_tiers() {
        assert_eq!(Layer::Raw.retention_days(), Some(1825));
        assert_eq!(Layer::Normalized.retention_days(), Some(1095));
        assert_eq!(Layer::Reference.retention_days(), Some(3650));
    }

    #[test]
    fn ohlc_partitions_by_day() {
        assert_eq!(Dataset::EquityOhlc.partition_keys(), ["year", "month", "day"]);
        assert_eq!(Dataset::CorporateActions.partition_keys(), ["year"]);
    }
}
