use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ChampionConfig,
    runtime::metrics::{MetricSink, NoopSink},
};

/// Wall-clock seam so ingest times are injectable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to one instant.
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Everything a task call needs from the outside world. Travels as an
/// explicit argument; there is no module-level mutable state.
#[derive(Clone)]
pub struct TaskContext {
    pub config: Arc<ChampionConfig>,
    pub metrics: Arc<dyn MetricSink>,
    pub cancel: CancellationToken,
    pub clock: Arc<dyn Clock>,
}

impl TaskContext {
    pub fn new(config: Arc<ChampionConfig>) -> Self {
        Self {
            config,
            metrics: Arc::new(NoopSink),
            cancel: CancellationToken::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Context for one task: same capabilities, child cancellation scope.
    pub fn child(&self) -> Self {
        Self {
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            cancel: self.cancel.child_token(),
            clock: self.clock.clone(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Wires SIGINT/SIGTERM to the root cancellation token.
pub fn cancel_on_shutdown_signal(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sig) => sig,
                Err(_) => {
                    let _ = ctrl_c.await;
                    token.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        token.cancel();
    });
}
