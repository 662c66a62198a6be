use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::{
    error::{ChampionResult, RuntimeError},
    flow::{
        Flow, TaskInputs,
        checkpoint::{self, RunRecord, RunStatus},
    },
    runtime::{TaskCache, TaskContext, TaskMetrics, TaskReport, TaskStatus, run_task},
};

/// Runs flows on a bounded worker pool: independent tasks execute
/// concurrently up to the configured parallelism, dependents strictly
/// after their predecessors succeed.
pub struct FlowRunner {
    state_dir: PathBuf,
    parallelism: usize,
    cache: Arc<TaskCache>,
}

impl FlowRunner {
    pub fn new(state_dir: &Path, parallelism: usize) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            parallelism: parallelism.max(1),
            cache: Arc::new(TaskCache::new(state_dir)),
        }
    }

    /// Executes the flow and persists its checkpoint.
    ///
    /// A task's final failure fails the flow, but independent branches
    /// still run; dependents of a failed task are marked
    /// `upstream_failed` and never start. Cancellation lets in-flight
    /// tasks finish cooperatively, marks the rest skipped, and
    /// checkpoints the run as cancelled.
    #[tracing::instrument(skip(self, flow, ctx, params), fields(flow = %flow.name))]
    pub async fn run(
        &self,
        flow: &Flow,
        ctx: &TaskContext,
        params: serde_json::Value,
    ) -> ChampionResult<RunRecord> {
        validate(flow)?;
        let started_at = ctx.now();
        let run_id = format!(
            "{}_{}_{:06x}",
            flow.name,
            started_at.format("%Y%m%dT%H%M%S%3f"),
            rand::rng().random_range(0..0xff_ffffu32)
        );
        info!(run_id, "flow run started");

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let (tx, rx) =
            async_channel::unbounded::<(String, TaskReport, Option<serde_json::Value>)>();

        let mut statuses: HashMap<String, TaskStatus> = HashMap::new();
        let mut outputs: HashMap<String, serde_json::Value> = HashMap::new();
        let mut reports: HashMap<String, TaskReport> = HashMap::new();
        let mut started: HashSet<String> = HashSet::new();
        let mut in_flight = 0usize;
        let mut cancelled = false;

        loop {
            if !cancelled && ctx.cancel.is_cancelled() {
                cancelled = true;
            }

            let mut progressed = false;
            for task in &flow.tasks {
                let name = task.spec.name.clone();
                if started.contains(&name) || statuses.contains_key(&name) {
                    continue;
                }

                let deps_failed = task.depends_on.iter().any(|d| {
                    matches!(
                        statuses.get(d),
                        Some(
                            TaskStatus::Failed
                                | TaskStatus::UpstreamFailed
                                | TaskStatus::Cancelled
                                | TaskStatus::Skipped
                        )
                    )
                });
                if deps_failed {
                    statuses.insert(name.clone(), TaskStatus::UpstreamFailed);
                    reports.insert(name.clone(), skipped_report(&name, TaskStatus::UpstreamFailed));
                    progressed = true;
                    continue;
                }

                if cancelled {
                    continue;
                }
                let ready = task
                    .depends_on
                    .iter()
                    .all(|d| statuses.get(d) == Some(&TaskStatus::Success));
                if !ready {
                    continue;
                }

                // Ready: hand it to the pool.
                started.insert(name.clone());
                in_flight += 1;
                progressed = true;

                let inputs: TaskInputs = task
                    .depends_on
                    .iter()
                    .filter_map(|d| outputs.get(d).map(|v| (d.clone(), v.clone())))
                    .collect();
                let spec = task.spec.clone();
                let body = task.handle();
                let worker_ctx = ctx.child();
                let cache = self.cache.clone();
                let fingerprint = spec
                    .cache_ttl
                    .map(|_| TaskCache::fingerprint(&[spec.name.as_str(), &params.to_string()]));
                let semaphore = semaphore.clone();
                let tx = tx.clone();

                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("pool closed");
                    let cache_arg = fingerprint.map(|f| (cache.as_ref(), f));
                    let (report, result) = run_task(&worker_ctx, &spec, cache_arg, |c| {
                        body(c, inputs.clone())
                    })
                    .await;
                    let _ = tx.send((spec.name.clone(), report, result.ok())).await;
                });
            }

            if flow
                .tasks
                .iter()
                .all(|t| statuses.contains_key(&t.spec.name))
            {
                break;
            }

            if in_flight == 0 {
                if progressed {
                    continue;
                }
                if cancelled {
                    for task in &flow.tasks {
                        let name = task.spec.name.clone();
                        if !statuses.contains_key(&name) {
                            statuses.insert(name.clone(), TaskStatus::Skipped);
                            reports.insert(name.clone(), skipped_report(&name, TaskStatus::Skipped));
                        }
                    }
                    break;
                }
                return Err(RuntimeError::Unknown(format!(
                    "flow '{}' stalled with no runnable tasks",
                    flow.name
                ))
                .into());
            }

            let (name, report, output) = rx
                .recv()
                .await
                .map_err(|_| RuntimeError::Unknown("flow worker channel closed".to_string()))?;
            in_flight -= 1;
            statuses.insert(name.clone(), report.status);
            if let Some(value) = output {
                outputs.insert(name.clone(), value);
            }
            reports.insert(name, report);
        }

        let task_reports: Vec<TaskReport> = flow
            .tasks
            .iter()
            .filter_map(|t| reports.remove(&t.spec.name))
            .collect();

        let status = if cancelled {
            RunStatus::Cancelled
        } else if task_reports
            .iter()
            .any(|r| matches!(r.status, TaskStatus::Failed | TaskStatus::Cancelled))
        {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };

        let record = RunRecord {
            run_id: run_id.clone(),
            flow: flow.name.clone(),
            params,
            started_at,
            ended_at: ctx.now(),
            status,
            tasks: task_reports,
        };
        checkpoint::persist(&self.state_dir, &record)?;

        match status {
            RunStatus::Success => info!(run_id, "flow run succeeded"),
            RunStatus::Failed => warn!(run_id, "flow run failed"),
            RunStatus::Cancelled => warn!(run_id, "flow run cancelled"),
        }
        Ok(record)
    }
}

fn skipped_report(name: &str, status: TaskStatus) -> TaskReport {
    TaskReport {
        name: name.to_string(),
        status,
        attempts: 0,
        duration_seconds: 0.0,
        error: Some(match status {
            TaskStatus::UpstreamFailed => "upstream task failed".to_string(),
            _ => "run cancelled before start".to_string(),
        }),
        metrics: TaskMetrics::default(),
    }
}

fn validate(flow: &Flow) -> Result<(), RuntimeError> {
    let names: HashSet<&str> = flow.tasks.iter().map(|t| t.spec.name.as_str()).collect();
    if names.len() != flow.tasks.len() {
        return Err(RuntimeError::Unknown(format!(
            "flow '{}' has duplicate task names",
            flow.name
        )));
    }
    for task in &flow.tasks {
        for dep in &task.depends_on {
            if !names.contains(dep.as_str()) {
                return Err(RuntimeError::UnknownTask {
                    flow: flow.name.clone(),
                    task: dep.clone(),
                });
            }
        }
    }

    // Kahn's algorithm for cycle detection.
    let mut in_degree: HashMap<&str, usize> = flow
        .tasks
        .iter()
        .map(|t| (t.spec.name.as_str(), t.depends_on.len()))
        .collect();
    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut visited = 0;
    while let Some(name) = queue.pop() {
        visited += 1;
        for task in &flow.tasks {
            if task.depends_on.iter().any(|d| d == name) {
                let degree = in_degree.get_mut(task.spec.name.as_str()).expect("known task");
                *degree -= 1;
                if *degree == 0 {
                    queue.push(task.spec.name.as_str());
                }
            }
        }
    }
    if visited != flow.tasks.len() {
        let stuck = flow
            .tasks
            .iter()
            .find(|t| in_degree[t.spec.name.as_str()] > 0)
            .map(|t| t.spec.name.clone())
            .unwrap_or_default();
        return Err(RuntimeError::Cycle {
            flow: flow.name.clone(),
            task: stuck,
        });
    }
    Ok(())
}
