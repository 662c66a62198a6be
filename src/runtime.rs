pub mod cache;
pub mod context;
pub mod metrics;
pub mod task;

pub use cache::TaskCache;
pub use context::{Clock, FixedClock, SystemClock, TaskContext, cancel_on_shutdown_signal};
pub use metrics::{MemorySink, MetricSink, NoopSink};
pub use task::{
    RetryPolicy, TaskMetrics, TaskOutcome, TaskReport, TaskSpec, TaskStatus, run_task,
};
