use std::{fmt::Write as _, path::PathBuf};

use chrono::NaiveDate;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    error::ChampionResult,
    flow::checkpoint::{self, RunStatus},
    validate::quarantine,
};

/// Overall failure rate above this flags the day.
const OVERALL_FAILURE_THRESHOLD: f64 = 0.05;
/// Per-schema failure rate above this flags the schema.
const SCHEMA_FAILURE_THRESHOLD: f64 = 0.10;
/// Row volume above this multiple of the trailing mean flags a spike.
const VOLUME_SPIKE_FACTOR: f64 = 2.0;

// ================================================================================================
// Report shapes
// ================================================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaStats {
    pub schema: String,
    pub total_rows: usize,
    pub failed_rows: usize,
    pub failure_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    OverallFailureRate { rate: f64 },
    SchemaFailureRate { schema: String, rate: f64 },
    VolumeSpike { rows: usize, trailing_mean: f64 },
}

/// Day-over-day comparison against the prior equal window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comparison {
    pub rows_delta: i64,
    pub failure_rate_delta: f64,
}

/// Machine-readable daily report; `render_text` produces the human view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub date: NaiveDate,
    pub runs: usize,
    pub failed_runs: usize,
    pub rows_validated: usize,
    pub failed_rows: usize,
    pub overall_failure_rate: f64,
    pub per_schema: Vec<SchemaStats>,
    pub anomalies: Vec<Anomaly>,
    pub vs_previous: Option<Comparison>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub rows: usize,
    pub failed_rows: usize,
    pub failure_rate: f64,
    pub runs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendSeries {
    pub window_days: u32,
    pub points: Vec<TrendPoint>,
}

// ================================================================================================
// Reporter
// ================================================================================================

/// Aggregates the validator's audit log and run checkpoints into daily
/// reports and trend series.
pub struct Reporter {
    state_dir: PathBuf,
    quarantine_dir: PathBuf,
}

impl Reporter {
    pub fn new(state_dir: &std::path::Path, quarantine_dir: &std::path::Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            quarantine_dir: quarantine_dir.to_path_buf(),
        }
    }

    pub fn daily_report(&self, date: NaiveDate) -> ChampionResult<Report> {
        let day = self.day_aggregate(date)?;

        let mut anomalies = Vec::new();
        if day.failure_rate > OVERALL_FAILURE_THRESHOLD {
            anomalies.push(Anomaly::OverallFailureRate {
                rate: day.failure_rate,
            });
        }
        for schema in &day.per_schema {
            if schema.failure_rate > SCHEMA_FAILURE_THRESHOLD {
                anomalies.push(Anomaly::SchemaFailureRate {
                    schema: schema.schema.clone(),
                    rate: schema.failure_rate,
                });
            }
        }

        // Volume spike vs the trailing week.
        let trailing: Vec<usize> = (1..=7)
            .filter_map(|back| {
                let prior = date - chrono::Duration::days(back);
                self.day_aggregate(prior).ok().map(|d| d.rows)
            })
            .filter(|rows| *rows > 0)
            .collect();
        if !trailing.is_empty() {
            let mean = trailing.iter().sum::<usize>() as f64 / trailing.len() as f64;
            if day.rows as f64 > VOLUME_SPIKE_FACTOR * mean {
                anomalies.push(Anomaly::VolumeSpike {
                    rows: day.rows,
                    trailing_mean: mean,
                });
            }
        }

        let previous = self.day_aggregate(date - chrono::Duration::days(1))?;
        let vs_previous = (previous.rows > 0 || previous.runs > 0).then(|| Comparison {
            rows_delta: day.rows as i64 - previous.rows as i64,
            failure_rate_delta: day.failure_rate - previous.failure_rate,
        });

        Ok(Report {
            date,
            runs: day.runs,
            failed_runs: day.failed_runs,
            rows_validated: day.rows,
            failed_rows: day.failed_rows,
            overall_failure_rate: day.failure_rate,
            per_schema: day.per_schema,
            anomalies,
            vs_previous,
        })
    }

    pub fn trend(&self, window_days: u32, today: NaiveDate) -> ChampionResult<TrendSeries> {
        let points = (0..window_days)
            .rev()
            .map(|back| {
                let date = today - chrono::Duration::days(back as i64);
                self.day_aggregate(date).map(|day| TrendPoint {
                    date,
                    rows: day.rows,
                    failed_rows: day.failed_rows,
                    failure_rate: day.failure_rate,
                    runs: day.runs,
                })
            })
            .collect::<ChampionResult<Vec<_>>>()?;
        Ok(TrendSeries {
            window_days,
            points,
        })
    }

    fn day_aggregate(&self, date: NaiveDate) -> ChampionResult<DayAggregate> {
        let audit = quarantine::read_audit_log(&self.quarantine_dir)
            .map_err(crate::error::ChampionError::from)?;
        let day_records: Vec<_> = audit
            .into_iter()
            .filter(|r| r.timestamp.date_naive() == date)
            .collect();

        let rows: usize = day_records.iter().map(|r| r.total_rows).sum();
        let failed_rows: usize = day_records.iter().map(|r| r.failed_rows).sum();

        let per_schema: Vec<SchemaStats> = day_records
            .iter()
            .into_group_map_by(|r| r.schema.clone())
            .into_iter()
            .map(|(schema, records)| {
                let total: usize = records.iter().map(|r| r.total_rows).sum();
                let failed: usize = records.iter().map(|r| r.failed_rows).sum();
                SchemaStats {
                    schema,
                    total_rows: total,
                    failed_rows: failed,
                    failure_rate: if total == 0 {
                        0.0
                    } else {
                        failed as f64 / total as f64
                    },
                }
            })
            .sorted_by(|a, b| a.schema.cmp(&b.schema))
            .collect();

        let runs = checkpoint::load_all(&self.state_dir)
            .map_err(crate::error::ChampionError::from)?;
        let day_runs: Vec<_> = runs
            .into_iter()
            .filter(|r| r.started_at.date_naive() == date)
            .collect();

        Ok(DayAggregate {
            runs: day_runs.len(),
            failed_runs: day_runs
                .iter()
                .filter(|r| r.status != RunStatus::Success)
                .count(),
            rows,
            failed_rows,
            failure_rate: if rows == 0 {
                0.0
            } else {
                failed_rows as f64 / rows as f64
            },
            per_schema,
        })
    }
}

struct DayAggregate {
    runs: usize,
    failed_runs: usize,
    rows: usize,
    failed_rows: usize,
    failure_rate: f64,
    per_schema: Vec<SchemaStats>,
}

/// Plain-text rendering for logs and terminal output.
pub fn render_text(report: &Report) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Daily ingestion report for {}", report.date);
    let _ = writeln!(
        out,
        "  runs: {} ({} failed)",
        report.runs, report.failed_runs
    );
    let _ = writeln!(
        out,
        "  rows validated: {} ({} quarantined, {:.2}% failure rate)",
        report.rows_validated,
        report.failed_rows,
        report.overall_failure_rate * 100.0
    );
    if let Some(comparison) = &report.vs_previous {
        let _ = writeln!(
            out,
            "  vs previous day: {:+} rows, {:+.2}pp failure rate",
            comparison.rows_delta,
            comparison.failure_rate_delta * 100.0
        );
    }
    if !report.per_schema.is_empty() {
        let _ = writeln!(out, "  per schema:");
        for schema in &report.per_schema {
            let _ = writeln!(
                out,
                "    {:<24} {:>10} rows  {:>6.2}% failed",
                schema.schema,
                schema.total_rows,
                schema.failure_rate * 100.0
            );
        }
    }
    if report.anomalies.is_empty() {
        let _ = writeln!(out, "  no anomalies");
    } else {
        let _ = writeln!(out, "  anomalies:");
        for anomaly in &report.anomalies {
            let line = match anomaly {
                Anomaly::OverallFailureRate { rate } => {
                    format!("overall failure rate {:.2}%", rate * 100.0)
                }
                Anomaly::SchemaFailureRate { schema, rate } => {
                    format!("schema {schema} failure rate {:.2}%", rate * 100.0)
                }
                Anomaly::VolumeSpike {
                    rows,
                    trailing_mean,
                } => format!("volume spike: {rows} rows vs trailing mean {trailing_mean:.0}"),
            };
            let _ = writeln!(out, "    - {line}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::{
        flow::checkpoint::{RunRecord, persist},
        validate::quarantine::{AuditRecord, append_audit_record},
    };

    fn audit(dir: &std::path::Path, date: NaiveDate, schema: &str, failed: usize, total: usize) {
        append_audit_record(
            dir,
            &AuditRecord {
                timestamp: Utc.from_utc_datetime(&date.and_hms_opt(13, 0, 0).unwrap()),
                schema: schema.to_string(),
                quarantine_file: format!("{schema}_failures.csv"),
                failed_rows: failed,
                total_rows: total,
                rules_applied: vec!["ohlc_high_low".to_string()],
                failure_rate: failed as f64 / total.max(1) as f64,
            },
        )
        .unwrap();
    }

    fn run(dir: &std::path::Path, date: NaiveDate, status: RunStatus, run_id: &str) {
        let started = Utc.from_utc_datetime(&date.and_hms_opt(12, 30, 0).unwrap());
        persist(
            dir,
            &RunRecord {
                run_id: run_id.to_string(),
                flow: "eod_ingest".to_string(),
                params: serde_json::json!({}),
                started_at: started,
                ended_at: started + chrono::Duration::minutes(4),
                status,
                tasks: vec![],
            },
        )
        .unwrap();
    }

    #[test]
    fn daily_report_aggregates_audit_and_runs() {
        let state = tempfile::tempdir().unwrap();
        let quarantine = tempfile::tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();

        audit(quarantine.path(), date, "equity_ohlc", 25, 2500);
        audit(quarantine.path(), date, "corporate_actions", 3, 10);
        run(state.path(), date, RunStatus::Success, "run_a");
        run(state.path(), date, RunStatus::Failed, "run_b");

        let reporter = Reporter::new(state.path(), quarantine.path());
        let report = reporter.daily_report(date).unwrap();

        assert_eq!(report.runs, 2);
        assert_eq!(report.failed_runs, 1);
        assert_eq!(report.rows_validated, 2510);
        assert_eq!(report.failed_rows, 28);
        assert_eq!(report.per_schema.len(), 2);

        // corporate_actions is 30% failed: flagged per-schema; overall
        // 28/2510 stays under 5%.
        assert!(report.anomalies.iter().any(|a| matches!(
            a,
            Anomaly::SchemaFailureRate { schema, .. } if schema == "corporate_actions"
        )));
        assert!(
            !report
                .anomalies
                .iter()
                .any(|a| matches!(a, Anomaly::OverallFailureRate { .. }))
        );

        let text = render_text(&report);
        assert!(text.contains("2510"));
        assert!(text.contains("corporate_actions"));
    }

    #[test]
    fn volume_spike_is_flagged_against_trailing_mean() {
        let state = tempfile::tempdir().unwrap();
        let quarantine = tempfile::tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();

        for back in 1..=3 {
            audit(
                quarantine.path(),
                date - chrono::Duration::days(back),
                "equity_ohlc",
                0,
                1000,
            );
        }
        audit(quarantine.path(), date, "equity_ohlc", 0, 5000);

        let reporter = Reporter::new(state.path(), quarantine.path());
        let report = reporter.daily_report(date).unwrap();
        assert!(
            report
                .anomalies
                .iter()
                .any(|a| matches!(a, Anomaly::VolumeSpike { .. }))
        );
    }

    #[test]
    fn trend_produces_one_point_per_day() {
        let state = tempfile::tempdir().unwrap();
        let quarantine = tempfile::tempdir().unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();

        audit(quarantine.path(), today, "equity_ohlc", 10, 1000);
        audit(
            quarantine.path(),
            today - chrono::Duration::days(1),
            "equity_ohlc",
            0,
            900,
        );

        let reporter = Reporter::new(state.path(), quarantine.path());
        let trend = reporter.trend(7, today).unwrap();
        assert_eq!(trend.points.len(), 7);
        assert_eq!(trend.points.last().unwrap().rows, 1000);
        assert!((trend.points.last().unwrap().failure_rate - 0.01).abs() < 1e-9);
    }
}
