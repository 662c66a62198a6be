pub mod backfill;
pub mod checkpoint;
pub mod executor;
pub mod schedule;

use std::{collections::HashMap, pin::Pin, sync::Arc};

use crate::{
    error::ChampionResult,
    runtime::{TaskContext, TaskOutcome, TaskSpec},
};

/// Outputs of a task's declared predecessors, keyed by task name. A task
/// observes nothing else.
pub type TaskInputs = HashMap<String, serde_json::Value>;

pub(crate) type BoxTaskFuture =
    Pin<Box<dyn Future<Output = ChampionResult<TaskOutcome>> + Send>>;
pub(crate) type TaskFn = Arc<dyn Fn(TaskContext, TaskInputs) -> BoxTaskFuture + Send + Sync>;

pub struct FlowTask {
    pub spec: TaskSpec,
    pub depends_on: Vec<String>,
    run: TaskFn,
}

impl FlowTask {
    /// Shared handle to the task body; workers own their copy.
    pub(crate) fn handle(&self) -> TaskFn {
        self.run.clone()
    }
}

/// A DAG of tasks; edges express data or ordering dependencies.
pub struct Flow {
    pub name: String,
    pub tasks: Vec<FlowTask>,
}

impl Flow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
        }
    }

    /// Adds a task. `depends_on` names must match earlier (or later)
    /// tasks in this flow; the executor validates the graph before
    /// running.
    pub fn task<F, Fut>(mut self, spec: TaskSpec, depends_on: &[&str], run: F) -> Self
    where
        F: Fn(TaskContext, TaskInputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ChampionResult<TaskOutcome>> + Send + 'static,
    {
        self.tasks.push(FlowTask {
            spec,
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            run: Arc::new(move |ctx, inputs| Box::pin(run(ctx, inputs))),
        });
        self
    }
}
