use std::collections::HashMap;

use polars::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::{
    datasets::Dataset,
    error::ValidationError,
    validate::{Severity, Violation},
};

/// ISIN check digit format shared by NSE and BSE listings.
pub const ISIN_PATTERN: &str = r"^[A-Z]{2}[A-Z0-9]{9}[0-9]$";
pub const ISO_DATE_PATTERN: &str = r"^\d{4}-\d{2}-\d{2}$";

// ================================================================================================
// Schema specification
// ================================================================================================

#[derive(
    Copy, Clone, Debug, Display, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Date,
    Timestamp,
    Int64,
    Float64,
    String,
    Tag,
}

impl FieldType {
    fn matches(&self, dtype: &DataType) -> bool {
        match self {
            FieldType::Date => matches!(dtype, DataType::Date),
            FieldType::Timestamp => matches!(dtype, DataType::Int64 | DataType::Datetime(_, _)),
            FieldType::Int64 => matches!(dtype, DataType::Int64),
            FieldType::Float64 => matches!(dtype, DataType::Float64),
            FieldType::String | FieldType::Tag => matches!(dtype, DataType::String),
        }
    }
}

/// Declarative constraints on one column, deserialized from the schema
/// file or built in per dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnRule {
    pub name: String,
    pub kind: FieldType,

    #[serde(default = "default_true")]
    pub nullable: bool,

    /// Regex the (string) column must match.
    #[serde(default)]
    pub pattern: Option<String>,

    /// Closed enumeration of allowed values.
    #[serde(default)]
    pub one_of: Option<Vec<String>>,

    #[serde(default)]
    pub min: Option<f64>,

    #[serde(default)]
    pub max: Option<f64>,

    /// Participates in the `missing_critical` business rule.
    #[serde(default)]
    pub critical: bool,
}

fn default_true() -> bool {
    true
}

impl ColumnRule {
    pub fn new(name: &str, kind: FieldType) -> Self {
        Self {
            name: name.to_string(),
            kind,
            nullable: true,
            pattern: None,
            one_of: None,
            min: None,
            max: None,
            critical: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self.critical = true;
        self
    }

    pub fn pattern(mut self, pattern: &str) -> Self {
        self.pattern = Some(pattern.to_string());
        self
    }

    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.one_of = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }
}

/// Structural and business-rule configuration for one validation schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRules {
    pub name: String,

    /// Full dedup key; `duplicate_detection` and `missing_critical` use it.
    pub key: Vec<String>,

    pub columns: Vec<ColumnRule>,

    /// Built-in business rules disabled for this schema.
    #[serde(default)]
    pub disabled_rules: Vec<String>,
}

impl TableRules {
    pub fn from_json(raw: &str) -> Result<Self, ValidationError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnRule> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Built-in schema for a dataset family.
    pub fn builtin(dataset: Dataset) -> Self {
        let key: Vec<String> = dataset
            .identity_key()
            .iter()
            .map(|k| k.to_string())
            .collect();
        let name = dataset.validation_schema().to_string();

        let columns = match dataset {
            Dataset::EquityOhlc => vec![
                ColumnRule::new("symbol", FieldType::String).required(),
                ColumnRule::new("series", FieldType::Tag),
                ColumnRule::new("isin", FieldType::String).pattern(ISIN_PATTERN),
                ColumnRule::new("instrument_id", FieldType::String).required(),
                ColumnRule::new("trade_date", FieldType::Date).required(),
                ColumnRule::new("open", FieldType::Float64).min(0.0),
                ColumnRule::new("high", FieldType::Float64).min(0.0),
                ColumnRule::new("low", FieldType::Float64).min(0.0),
                ColumnRule::new("close", FieldType::Float64).required().min(0.0),
                ColumnRule::new("prev_close", FieldType::Float64).min(0.0),
                ColumnRule::new("volume", FieldType::Int64).min(0.0),
                ColumnRule::new("turnover", FieldType::Float64).min(0.0),
            ],
            Dataset::CorporateActions => vec![
                ColumnRule::new("symbol", FieldType::String).required(),
                ColumnRule::new("ex_date", FieldType::Date).required(),
                ColumnRule::new("ca_id", FieldType::String).required(),
                ColumnRule::new("ca_kind", FieldType::Tag)
                    .one_of(&["SPLIT", "BONUS", "DIVIDEND", "RIGHTS", "MERGER"]),
                ColumnRule::new("adjustment_factor", FieldType::Float64)
                    .required()
                    .min(f64::MIN_POSITIVE),
            ],
            Dataset::IndexConstituents => vec![
                ColumnRule::new("index_name", FieldType::String).required(),
                ColumnRule::new("symbol", FieldType::String).required(),
                ColumnRule::new("effective_date", FieldType::Date).required(),
                ColumnRule::new("action", FieldType::Tag)
                    .one_of(&["ADD", "REMOVE", "REBALANCE"]),
                ColumnRule::new("isin", FieldType::String).pattern(ISIN_PATTERN),
            ],
            Dataset::TradingCalendar => vec![
                ColumnRule::new("exchange", FieldType::Tag)
                    .required()
                    .one_of(&["NSE", "BSE"]),
                ColumnRule::new("date", FieldType::Date).required(),
                ColumnRule::new("day_type", FieldType::Tag)
                    .required()
                    .one_of(&["TRADING", "WEEKEND", "HOLIDAY", "SPECIAL"]),
            ],
            Dataset::SymbolMaster => vec![
                ColumnRule::new("symbol", FieldType::String).required(),
                ColumnRule::new("exchange", FieldType::Tag)
                    .required()
                    .one_of(&["NSE", "BSE"]),
                ColumnRule::new("valid_from", FieldType::Date).required(),
                ColumnRule::new("valid_to", FieldType::Date),
                ColumnRule::new("isin", FieldType::String).pattern(ISIN_PATTERN),
                ColumnRule::new("company_name", FieldType::String),
            ],
            Dataset::BulkDeals | Dataset::BlockDeals => vec![
                ColumnRule::new("symbol", FieldType::String).required(),
                ColumnRule::new("instrument_id", FieldType::String).required(),
                ColumnRule::new("trade_date", FieldType::Date).required(),
                ColumnRule::new("client_name", FieldType::String).required(),
                ColumnRule::new("side", FieldType::Tag).one_of(&["BUY", "SELL"]),
                ColumnRule::new("quantity", FieldType::Int64).min(0.0),
                ColumnRule::new("price", FieldType::Float64).min(0.0),
            ],
            Dataset::QuarterlyFinancials => vec![
                ColumnRule::new("symbol", FieldType::String).required(),
                ColumnRule::new("fiscal_year", FieldType::Int64).required().min(1990.0),
                ColumnRule::new("fiscal_quarter", FieldType::Int64)
                    .required()
                    .min(1.0)
                    .max(4.0),
                ColumnRule::new("revenue", FieldType::Float64),
                ColumnRule::new("net_profit", FieldType::Float64),
                ColumnRule::new("eps_basic", FieldType::Float64),
            ],
            Dataset::ShareholdingPattern => vec![
                ColumnRule::new("symbol", FieldType::String).required(),
                ColumnRule::new("period_end", FieldType::Date).required(),
                ColumnRule::new("category", FieldType::Tag).required(),
                ColumnRule::new("percent_held", FieldType::Float64).min(0.0).max(100.0),
                ColumnRule::new("shares_held", FieldType::Int64).min(0.0),
            ],
            Dataset::MacroIndicators => vec![
                ColumnRule::new("indicator", FieldType::Tag).required(),
                ColumnRule::new("date", FieldType::Date).required(),
                ColumnRule::new("value", FieldType::Float64).required(),
            ],
        };

        Self {
            name,
            key,
            columns,
            disabled_rules: Vec::new(),
        }
    }
}

// ================================================================================================
// Structural checks
// ================================================================================================

/// Applies type, nullability, enumeration, pattern and range checks to one
/// chunk. `offset` is the chunk's position in the full batch, so reported
/// row numbers are batch-global. Absent optional columns no-op.
pub fn check_chunk(
    rules: &TableRules,
    chunk: &DataFrame,
    offset: usize,
    patterns: &HashMap<String, Regex>,
) -> Result<Vec<Violation>, ValidationError> {
    let mut violations = Vec::new();

    for rule in &rules.columns {
        let Ok(column) = chunk.column(&rule.name) else {
            if !rule.nullable {
                violations.push(Violation {
                    rule: "structural_type".to_string(),
                    severity: Severity::Critical,
                    row: offset,
                    message: format!("required column '{}' is missing", rule.name),
                });
            }
            continue;
        };

        if !rule.kind.matches(column.dtype()) {
            violations.push(Violation {
                rule: "structural_type".to_string(),
                severity: Severity::Critical,
                row: offset,
                message: format!(
                    "column '{}' is {:?}, expected {}",
                    rule.name,
                    column.dtype(),
                    rule.kind
                ),
            });
            continue;
        }

        if !rule.nullable && column.null_count() > 0 {
            let mask: Vec<bool> = column.is_null().into_iter().map(|v| v == Some(true)).collect();
            push_mask(
                &mut violations,
                &mask,
                offset,
                "structural_nullability",
                Severity::Critical,
                |_| format!("null in non-nullable column '{}'", rule.name),
            );
        }

        if let Some(allowed) = &rule.one_of {
            if let Ok(ca) = column.str() {
                let mask: Vec<bool> = ca
                    .into_iter()
                    .map(|opt| opt.is_some_and(|v| !allowed.iter().any(|a| a == v)))
                    .collect();
                push_mask(
                    &mut violations,
                    &mask,
                    offset,
                    "structural_enum",
                    Severity::Critical,
                    |_| format!("value outside enumeration for '{}'", rule.name),
                );
            }
        }

        if rule.pattern.is_some() {
            if let (Some(regex), Ok(ca)) = (patterns.get(&rule.name), column.str()) {
                let mask: Vec<bool> = ca
                    .into_iter()
                    .map(|opt| opt.is_some_and(|v| !regex.is_match(v)))
                    .collect();
                push_mask(
                    &mut violations,
                    &mask,
                    offset,
                    "structural_pattern",
                    Severity::Critical,
                    |_| format!("value does not match pattern for '{}'", rule.name),
                );
            }
        }

        if rule.min.is_some() || rule.max.is_some() {
            let as_f64 = column.cast(&DataType::Float64)?;
            let ca = as_f64.f64()?;
            let mask: Vec<bool> = ca
                .into_iter()
                .map(|opt| {
                    opt.is_some_and(|v| {
                        rule.min.is_some_and(|min| v < min) || rule.max.is_some_and(|max| v > max)
                    })
                })
                .collect();
            push_mask(
                &mut violations,
                &mask,
                offset,
                "structural_range",
                Severity::Critical,
                |_| format!("value outside range for '{}'", rule.name),
            );
        }
    }

    Ok(violations)
}

/// Compiles the per-column regexes once per validation run.
pub fn compile_patterns(rules: &TableRules) -> Result<HashMap<String, Regex>, ValidationError> {
    let mut patterns = HashMap::new();
    for rule in &rules.columns {
        if let Some(pattern) = &rule.pattern {
            let regex = Regex::new(pattern).map_err(|e| ValidationError::InvalidRule {
                rule: format!("structural_pattern:{}", rule.name),
                msg: e.to_string(),
            })?;
            patterns.insert(rule.name.clone(), regex);
        }
    }
    Ok(patterns)
}

pub(crate) fn push_mask(
    violations: &mut Vec<Violation>,
    mask: &[bool],
    offset: usize,
    rule: &str,
    severity: Severity,
    message: impl Fn(usize) -> String,
) {
    for (i, flag) in mask.iter().enumerate() {
        if *flag {
            violations.push(Violation {
                rule: rule.to_string(),
                severity,
                row: offset + i,
                message: message(offset + i),
            });
        }
    }
}
