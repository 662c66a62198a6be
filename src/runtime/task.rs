use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{
    error::{ChampionError, ChampionResult, RuntimeError},
    runtime::{cache::TaskCache, context::TaskContext},
};

// ================================================================================================
// Descriptors
// ================================================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,

    /// Base of the exponential backoff between attempts.
    pub base_delay: Duration,

    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(500),
            jitter: true,
        }
    }
}

/// Declarative description of one unit of work. The runtime reads these
/// fields and applies them uniformly; tasks themselves stay plain
/// functions over their inputs and a context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    pub name: String,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Wall-clock deadline for one attempt.
    #[serde(default)]
    pub timeout: Option<Duration>,

    /// Result cache TTL; `None` disables caching (writes are never
    /// cached).
    #[serde(default)]
    pub cache_ttl: Option<Duration>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry: RetryPolicy::default(),
            timeout: None,
            cache_ttl: None,
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.retry.base_delay = base_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }
}

// ================================================================================================
// Reports
// ================================================================================================

#[derive(
    Copy, Clone, Debug, Display, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Failed,
    Cancelled,
    UpstreamFailed,
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub rows_in: u64,
    pub rows_out: u64,
    pub bytes_out: u64,
}

/// A task's return value plus the throughput it wants reported.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub value: serde_json::Value,
    pub metrics: TaskMetrics,
}

impl TaskOutcome {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            metrics: TaskMetrics::default(),
        }
    }

    pub fn with_rows(mut self, rows_in: u64, rows_out: u64) -> Self {
        self.metrics.rows_in = rows_in;
        self.metrics.rows_out = rows_out;
        self
    }

    pub fn with_bytes_out(mut self, bytes_out: u64) -> Self {
        self.metrics.bytes_out = bytes_out;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub name: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub duration_seconds: f64,
    pub error: Option<String>,
    pub metrics: TaskMetrics,
}

// ================================================================================================
// Runner
// ================================================================================================

/// Runs one task under its spec: cache, retries with jittered backoff,
/// timeout, cancellation, metric emission.
pub async fn run_task<F, Fut>(
    ctx: &TaskContext,
    spec: &TaskSpec,
    cache: Option<(&TaskCache, String)>,
    task: F,
) -> (TaskReport, ChampionResult<serde_json::Value>)
where
    F: Fn(TaskContext) -> Fut,
    Fut: Future<Output = ChampionResult<TaskOutcome>>,
{
    let started = Instant::now();

    if let (Some(ttl), Some((cache, fingerprint))) = (spec.cache_ttl, cache.as_ref()) {
        if let Some(value) = cache.get(&spec.name, fingerprint, ttl, ctx.now()) {
            ctx.metrics
                .counter("cache_hit", 1, &[("task", &spec.name)]);
            let report = TaskReport {
                name: spec.name.clone(),
                status: TaskStatus::Success,
                attempts: 0,
                duration_seconds: started.elapsed().as_secs_f64(),
                error: None,
                metrics: TaskMetrics::default(),
            };
            emit(ctx, spec, &report);
            return (report, Ok(value));
        }
    }

    let max_attempts = spec.retry.max_retries + 1;
    let mut attempt = 0u32;
    let final_error: ChampionError;

    loop {
        attempt += 1;

        if ctx.cancel.is_cancelled() {
            final_error = RuntimeError::Cancelled {
                task: spec.name.clone(),
            }
            .into();
            break;
        }

        let result = run_attempt(ctx, spec, &task).await;
        match result {
            Ok(outcome) => {
                if let (Some(_), Some((cache, fingerprint))) = (spec.cache_ttl, cache.as_ref()) {
                    if let Err(e) = cache.put(&spec.name, fingerprint, &outcome.value, ctx.now()) {
                        warn!(task = %spec.name, error = %e, "cache store failed");
                    }
                }
                let report = TaskReport {
                    name: spec.name.clone(),
                    status: TaskStatus::Success,
                    attempts: attempt,
                    duration_seconds: started.elapsed().as_secs_f64(),
                    error: None,
                    metrics: outcome.metrics,
                };
                emit(ctx, spec, &report);
                info!(task = %spec.name, attempts = attempt, "task succeeded");
                return (report, Ok(outcome.value));
            }
            Err(error) => {
                let retryable = error.is_retryable();
                if retryable && attempt < max_attempts {
                    let delay = backoff_delay(&spec.retry, attempt);
                    warn!(
                        task = %spec.name,
                        attempt,
                        error = %error,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed, backing off"
                    );
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => {
                            final_error = RuntimeError::Cancelled {
                                task: spec.name.clone(),
                            }
                            .into();
                            break;
                        }
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
                final_error = error;
                break;
            }
        }
    }

    let status = match final_error.kind() {
        crate::error::ErrorKind::Cancelled => TaskStatus::Cancelled,
        _ => TaskStatus::Failed,
    };
    let report = TaskReport {
        name: spec.name.clone(),
        status,
        attempts: attempt,
        duration_seconds: started.elapsed().as_secs_f64(),
        error: Some(final_error.to_string()),
        metrics: TaskMetrics::default(),
    };
    emit(ctx, spec, &report);
    warn!(task = %spec.name, attempts = attempt, error = %final_error, "task failed");
    (report, Err(final_error))
}

async fn run_attempt<F, Fut>(
    ctx: &TaskContext,
    spec: &TaskSpec,
    task: &F,
) -> ChampionResult<TaskOutcome>
where
    F: Fn(TaskContext) -> Fut,
    Fut: Future<Output = ChampionResult<TaskOutcome>>,
{
    let attempt_ctx = ctx.clone();
    let fut = task(attempt_ctx);

    // Biased toward the task: a future that finishes its in-flight work
    // after observing cancellation still reports its own result.
    match spec.timeout {
        Some(timeout) => tokio::select! {
            biased;
            result = tokio::time::timeout(timeout, fut) => match result {
                Ok(inner) => inner,
                Err(_) => Err(RuntimeError::DeadlineExceeded {
                    task: spec.name.clone(),
                    timeout: humantime::format_duration(timeout).to_string(),
                }
                .into()),
            },
            _ = ctx.cancel.cancelled() => Err(RuntimeError::Cancelled {
                task: spec.name.clone(),
            }
            .into()),
        },
        None => tokio::select! {
            biased;
            result = fut => result,
            _ = ctx.cancel.cancelled() => Err(RuntimeError::Cancelled {
                task: spec.name.clone(),
            }
            .into()),
        },
    }
}

fn emit(ctx: &TaskContext, spec: &TaskSpec, report: &TaskReport) {
    let status = report.status.to_string();
    let labels: [(&str, &str); 1] = [("task", &spec.name)];
    ctx.metrics
        .histogram("duration_seconds", report.duration_seconds, &labels);
    ctx.metrics.counter("rows_in", report.metrics.rows_in, &labels);
    ctx.metrics.counter("rows_out", report.metrics.rows_out, &labels);
    ctx.metrics
        .counter("bytes_out", report.metrics.bytes_out, &labels);
    ctx.metrics
        .counter("status", 1, &[("task", &spec.name), ("status", &status)]);
}

fn backoff_delay(retry: &RetryPolicy, attempt: u32) -> Duration {
    let exp = retry
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let capped = exp.min(Duration::from_secs(120));
    if retry.jitter {
        let ms = capped.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(ms / 2..=ms).max(1))
    } else {
        capped
    }
}
