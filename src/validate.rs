pub mod quarantine;
pub mod rules;
pub mod structural;

use std::{
    collections::HashMap,
    fs::OpenOptions,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use strum::IntoEnumIterator;
use strum_macros::Display;
use tracing::{info, warn};

use crate::{
    config::ValidationConfig,
    datasets::Dataset,
    error::ValidationError,
    validate::{
        quarantine::QuarantineWriter,
        rules::{BuiltinRule, EngineState, RuleContext},
        structural::TableRules,
    },
};

// ================================================================================================
// Violations & results
// ================================================================================================

#[derive(
    Copy, Clone, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

/// One rule violation on one row. Streams to the error file; the first N
/// stay in memory as samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub rule: String,
    pub severity: Severity,
    pub row: usize,
    pub message: String,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub schema: String,
    pub total: usize,
    pub passed: usize,
    pub critical: usize,
    pub warnings: usize,
    pub rules_applied: Vec<String>,
    pub samples: Vec<Violation>,
    pub error_file_path: Option<PathBuf>,
    pub quarantine_file: Option<PathBuf>,

    #[serde_as(as = "serde_with::TimestampMilliSeconds<i64>")]
    pub timestamp: DateTime<Utc>,
}

impl ValidationResult {
    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.passed as f64 / self.total as f64
        }
    }

    /// Strict-mode gate: critical violations fail the enclosing task.
    pub fn ensure_passed(&self, fail_on_errors: bool) -> Result<(), ValidationError> {
        if fail_on_errors && self.critical > 0 {
            return Err(ValidationError::CriticalRulesFailed {
                schema: self.schema.clone(),
                critical: self.critical,
                failed_rows: self.total - self.passed,
                total_rows: self.total,
                quarantine_file: self
                    .quarantine_file
                    .as_ref()
                    .map(|p| p.display().to_string()),
            });
        }
        Ok(())
    }
}

// ================================================================================================
// Validator
// ================================================================================================

type CustomRuleFn = Box<dyn Fn(&DataFrame, usize) -> Vec<Violation> + Send + Sync>;

/// Streaming schema and business-rule engine.
///
/// Batches are validated in fixed-size chunks so memory stays bounded for
/// arbitrarily large inputs; failing rows go to a quarantine file with an
/// audit-log entry.
pub struct Validator {
    schemas: HashMap<String, TableRules>,
    custom: HashMap<String, Vec<(String, CustomRuleFn)>>,
    options: ValidationConfig,
    quarantine_dir: PathBuf,
    completeness_severity: Severity,
}

impl Validator {
    /// A validator preloaded with the built-in schema of every dataset
    /// family.
    pub fn new(options: ValidationConfig, quarantine_dir: &Path) -> Self {
        let mut schemas = HashMap::new();
        for dataset in Dataset::iter() {
            let rules = TableRules::builtin(dataset);
            schemas.insert(rules.name.clone(), rules);
        }
        Self {
            schemas,
            custom: HashMap::new(),
            options,
            quarantine_dir: quarantine_dir.to_path_buf(),
            completeness_severity: Severity::Warning,
        }
    }

    /// Replaces or adds a schema (e.g. loaded from a JSON file).
    pub fn register_schema(&mut self, rules: TableRules) {
        self.schemas.insert(rules.name.clone(), rules);
    }

    /// Extension point: a named rule evaluated per chunk. The callback
    /// receives the chunk and its batch-global offset and returns the
    /// violations it found.
    pub fn register_custom(
        &mut self,
        schema: &str,
        name: &str,
        rule: impl Fn(&DataFrame, usize) -> Vec<Violation> + Send + Sync + 'static,
    ) {
        self.custom
            .entry(schema.to_string())
            .or_default()
            .push((name.to_string(), Box::new(rule)));
    }

    /// Promotes `trading_day_completeness` to critical for deployments
    /// that want it so.
    pub fn with_completeness_severity(mut self, severity: Severity) -> Self {
        self.completeness_severity = severity;
        self
    }

    #[tracing::instrument(skip(self, batch), fields(schema = schema_name, rows = batch.height()))]
    pub fn validate(
        &self,
        batch: &DataFrame,
        schema_name: &str,
        now: DateTime<Utc>,
        trading_day: Option<bool>,
    ) -> Result<ValidationResult, ValidationError> {
        let rules = self
            .schemas
            .get(schema_name)
            .ok_or_else(|| ValidationError::UnknownSchema(schema_name.to_string()))?;
        let patterns = structural::compile_patterns(rules)?;

        let builtin: Vec<BuiltinRule> = BuiltinRule::iter()
            .filter(|r| !rules.disabled_rules.contains(&r.to_string()))
            .collect();
        let customs = self.custom.get(schema_name);

        let mut rules_applied: Vec<String> = vec![
            "structural_type".to_string(),
            "structural_nullability".to_string(),
            "structural_enum".to_string(),
            "structural_pattern".to_string(),
            "structural_range".to_string(),
        ];
        rules_applied.extend(builtin.iter().map(|r| r.to_string()));
        if let Some(customs) = customs {
            rules_applied.extend(customs.iter().map(|(name, _)| name.clone()));
        }

        let total = batch.height();
        if total == 0 {
            return Ok(ValidationResult {
                schema: schema_name.to_string(),
                total: 0,
                passed: 0,
                critical: 0,
                warnings: 0,
                rules_applied,
                samples: Vec::new(),
                error_file_path: None,
                quarantine_file: None,
                timestamp: now,
            });
        }

        let context = RuleContext {
            rules,
            options: &self.options,
            now,
            trading_day,
            completeness_severity: self.completeness_severity,
        };
        let mut state = EngineState::default();
        let mut quarantine = QuarantineWriter::new(&self.quarantine_dir, schema_name, now);
        let mut error_sink = ErrorSink::new(&self.quarantine_dir, schema_name, now);

        let mut samples: Vec<Violation> = Vec::new();
        let mut critical = 0usize;
        let mut warnings = 0usize;
        let mut failed_rows = 0usize;

        let chunk_rows = self.options.batch_rows.max(1);
        let mut offset = 0usize;
        while offset < total {
            let len = chunk_rows.min(total - offset);
            let chunk = batch.slice(offset as i64, len);

            let mut violations =
                structural::check_chunk(rules, &chunk, offset, &patterns)?;
            for rule in &builtin {
                violations.extend(rule.apply(&chunk, offset, &context, &mut state)?);
            }
            if let Some(customs) = customs {
                for (_, custom) in customs {
                    violations.extend(custom(&chunk, offset));
                }
            }

            let mut mask = vec![false; len];
            for violation in &violations {
                match violation.severity {
                    Severity::Critical => critical += 1,
                    Severity::Warning => warnings += 1,
                }
                // Warnings are reported but do not quarantine the row.
                if violation.severity == Severity::Critical {
                    if let Some(flag) = violation
                        .row
                        .checked_sub(offset)
                        .and_then(|i| mask.get_mut(i))
                    {
                        *flag = true;
                    }
                }
                if samples.len() < self.options.max_samples {
                    samples.push(violation.clone());
                }
            }
            error_sink.write_all(&violations)?;

            failed_rows += mask.iter().filter(|f| **f).count();
            quarantine.quarantine_rows(&chunk, &mask)?;

            offset += len;
        }

        let quarantine_file = quarantine.file_path().to_path_buf();
        let audit = quarantine.close(total, rules_applied.clone(), now)?;
        let error_file_path = error_sink.close();

        let result = ValidationResult {
            schema: schema_name.to_string(),
            total,
            passed: total - failed_rows,
            critical,
            warnings,
            rules_applied,
            samples,
            error_file_path,
            quarantine_file: audit.is_some().then_some(quarantine_file),
            timestamp: now,
        };

        if result.critical > 0 {
            warn!(
                schema = schema_name,
                critical = result.critical,
                warnings = result.warnings,
                failed_rows,
                "validation found violations"
            );
        } else {
            info!(
                schema = schema_name,
                rows = total,
                warnings = result.warnings,
                "validation passed"
            );
        }
        Ok(result)
    }
}

/// Line-delimited violation stream; created lazily on the first write so
/// clean runs leave nothing behind.
struct ErrorSink {
    path: PathBuf,
    writer: Option<BufWriter<std::fs::File>>,
}

impl ErrorSink {
    fn new(dir: &Path, schema: &str, now: DateTime<Utc>) -> Self {
        Self {
            path: dir.join(format!(
                "{schema}_errors_{}.jsonl",
                now.format("%Y%m%dT%H%M%S")
            )),
            writer: None,
        }
    }

    fn write_all(&mut self, violations: &[Violation]) -> Result<(), ValidationError> {
        if violations.is_empty() {
            return Ok(());
        }
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.writer = Some(BufWriter::new(file));
        }
        let writer = self.writer.as_mut().expect("writer just created");
        for violation in violations {
            let mut line = serde_json::to_string(violation)?;
            line.push('\n');
            writer.write_all(line.as_bytes())?;
        }
        writer.flush()?;
        Ok(())
    }

    fn close(self) -> Option<PathBuf> {
        self.writer.is_some().then_some(self.path)
    }
}
