use std::{collections::HashMap, path::Path};

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use polars::prelude::*;
use quick_xml::{Reader, events::Event};

use crate::{
    datasets::Dataset,
    envelope::{EventTime, Stamper},
    error::ParseError,
    parse::{BulletinParser, date_column, eod_event_time_ms},
};

/// Fixed XBRL element map: local element name → canonical column.
///
/// The first three are the required minimum; everything else is
/// best-effort and lands as a nullable float64.
const REQUIRED_FIELDS: [(&str, &str); 3] = [
    ("RevenueFromOperations", "revenue"),
    ("ProfitLossForPeriod", "net_profit"),
    ("BasicEarningsLossPerShare", "eps_basic"),
];

const OPTIONAL_FIELDS: [(&str, &str); 7] = [
    ("Income", "total_income"),
    ("Expenses", "total_expenses"),
    ("ProfitBeforeTax", "profit_before_tax"),
    ("TaxExpense", "tax_expense"),
    ("FinanceCosts", "finance_costs"),
    ("DepreciationDepletionAndAmortisationExpense", "depreciation"),
    ("DilutedEarningsLossPerShare", "eps_diluted"),
];

const SYMBOL_ELEMENT: &str = "Symbol";
const PERIOD_END_ELEMENT: &str = "DateOfEndOfReportingPeriod";

/// Parser for quarterly-results XBRL filings.
///
/// Elements are matched by local name only; namespace prefixes vary
/// across filing taxonomies. The first occurrence of each element wins,
/// which in these filings is the current reporting context.
pub struct FinancialsParser {
    stamper: Stamper,
}

impl FinancialsParser {
    pub fn new(stamper: Stamper) -> Self {
        Self { stamper }
    }

    fn extract_elements(&self, raw: &str) -> Result<HashMap<String, String>, ParseError> {
        let mut reader = Reader::from_str(raw);
        reader.trim_text(true);

        let mut wanted: HashMap<&str, &str> = HashMap::new();
        for (element, canonical) in REQUIRED_FIELDS.iter().chain(OPTIONAL_FIELDS.iter()) {
            wanted.insert(element, canonical);
        }
        wanted.insert(SYMBOL_ELEMENT, "symbol");
        wanted.insert(PERIOD_END_ELEMENT, "period_end");

        let mut values: HashMap<String, String> = HashMap::new();
        let mut current: Option<String> = None;
        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => {
                    let local = String::from_utf8_lossy(start.local_name().as_ref()).to_string();
                    current = wanted.get(local.as_str()).map(|c| (*c).to_string());
                }
                Ok(Event::Text(text)) => {
                    if let Some(canonical) = current.take() {
                        let value = text
                            .unescape()
                            .map_err(|e| ParseError::Malformed {
                                dataset: "quarterly_financials".to_string(),
                                column: canonical.clone(),
                                msg: e.to_string(),
                            })?
                            .trim()
                            .to_string();
                        values.entry(canonical).or_insert(value);
                    }
                }
                Ok(Event::End(_)) => current = None,
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(ParseError::Malformed {
                        dataset: "quarterly_financials".to_string(),
                        column: String::new(),
                        msg: format!("malformed XBRL: {e}"),
                    });
                }
            }
        }
        Ok(values)
    }
}

impl BulletinParser for FinancialsParser {
    fn dataset(&self) -> Dataset {
        Dataset::QuarterlyFinancials
    }

    fn parse(
        &self,
        path: &Path,
        date: NaiveDate,
        ingest_time: DateTime<Utc>,
    ) -> Result<Option<DataFrame>, ParseError> {
        let raw = std::fs::read_to_string(path)?;
        if raw.trim().is_empty() {
            return Ok(None);
        }
        let values = self.extract_elements(&raw)?;

        let mut missing: Vec<String> = REQUIRED_FIELDS
            .iter()
            .filter(|(_, canonical)| !values.contains_key(*canonical))
            .map(|(element, _)| element.to_string())
            .collect();
        if !values.contains_key("symbol") {
            missing.push(SYMBOL_ELEMENT.to_string());
        }
        if !missing.is_empty() {
            return Err(ParseError::Schema {
                dataset: "quarterly_financials".to_string(),
                expected: REQUIRED_FIELDS.iter().map(|(e, _)| e.to_string()).collect(),
                found: values.keys().cloned().collect(),
                missing,
            });
        }

        let symbol = values["symbol"].to_uppercase();
        let period_end = values
            .get("period_end")
            .map(|s| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| ParseError::Timestamp {
                    dataset: "quarterly_financials".to_string(),
                    msg: format!("bad period end '{s}'"),
                })
            })
            .transpose()?
            .unwrap_or(date);
        let (fiscal_year, fiscal_quarter) = fiscal_period(period_end);

        let parse_float = |canonical: &str| -> Result<Option<f64>, ParseError> {
            values
                .get(canonical)
                .map(|s| {
                    s.replace(',', "")
                        .parse::<f64>()
                        .map_err(|_| ParseError::Malformed {
                            dataset: "quarterly_financials".to_string(),
                            column: canonical.to_string(),
                            msg: format!("'{s}' is not a float64"),
                        })
                })
                .transpose()
        };

        let mut columns: Vec<Column> = vec![
            Series::new("symbol".into(), vec![symbol]).into(),
            date_column("period_end", period_end, 1)?.into(),
            Series::new("fiscal_year".into(), vec![fiscal_year]).into(),
            Series::new("fiscal_quarter".into(), vec![fiscal_quarter]).into(),
        ];
        for (_, canonical) in REQUIRED_FIELDS.iter().chain(OPTIONAL_FIELDS.iter()) {
            columns.push(Series::new((*canonical).into(), vec![parse_float(canonical)?]).into());
        }

        let df = DataFrame::new(columns)?;
        let stamped = self.stamper.stamp_batch(
            df,
            &["symbol", "fiscal_year", "fiscal_quarter"],
            EventTime::Constant(eod_event_time_ms(date)?),
            ingest_time,
        )?;
        Ok(Some(stamped))
    }
}

/// Indian fiscal year: April through March, labelled by its closing year.
fn fiscal_period(period_end: NaiveDate) -> (i64, i64) {
    let (year, month) = (period_end.year() as i64, period_end.month());
    match month {
        4..=6 => (year + 1, 1),
        7..=9 => (year + 1, 2),
        10..=12 => (year + 1, 3),
        _ => (year, 4),
    }
}
