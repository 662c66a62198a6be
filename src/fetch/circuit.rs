use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use tracing::warn;

use crate::{config::CircuitBreakerConfig, error::FetchError};

/// Per-host circuit breaker, process-local.
///
/// Closed until `threshold` consecutive failures, then open for `cooldown`.
/// After the cooldown one probe request is let through (half-open); its
/// outcome closes or re-opens the circuit.
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    hosts: Mutex<HashMap<String, HostState>>,
}

#[derive(Debug, Clone, Copy)]
enum HostState {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            threshold: config.threshold.max(1),
            cooldown: config.cooldown,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Errors with `CircuitOpen` without issuing any request when the host
    /// is still cooling down.
    pub fn check(&self, host: &str) -> Result<(), FetchError> {
        let mut hosts = self.hosts.lock().expect("circuit breaker lock poisoned");
        let state = hosts
            .entry(host.to_string())
            .or_insert(HostState::Closed {
                consecutive_failures: 0,
            });

        match *state {
            HostState::Closed { .. } | HostState::HalfOpen => Ok(()),
            HostState::Open { since } => {
                if since.elapsed() >= self.cooldown {
                    *state = HostState::HalfOpen;
                    Ok(())
                } else {
                    Err(FetchError::CircuitOpen {
                        host: host.to_string(),
                    })
                }
            }
        }
    }

    pub fn record_success(&self, host: &str) {
        let mut hosts = self.hosts.lock().expect("circuit breaker lock poisoned");
        hosts.insert(
            host.to_string(),
            HostState::Closed {
                consecutive_failures: 0,
            },
        );
    }

    pub fn record_failure(&self, host: &str) {
        let mut hosts = self.hosts.lock().expect("circuit breaker lock poisoned");
        let state = hosts
            .entry(host.to_string())
            .or_insert(HostState::Closed {
                consecutive_failures: 0,
            });

        *state = match *state {
            HostState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.threshold {
                    warn!(host, failures, "circuit opened");
                    HostState::Open {
                        since: Instant::now(),
                    }
                } else {
                    HostState::Closed {
                        consecutive_failures: failures,
                    }
                }
            }
            // A failed half-open probe re-opens immediately.
            HostState::HalfOpen | HostState::Open { .. } => {
                warn!(host, "half-open probe failed, circuit re-opened");
                HostState::Open {
                    since: Instant::now(),
                }
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(&CircuitBreakerConfig {
            threshold,
            cooldown: Duration::from_millis(cooldown_ms),
        })
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let cb = breaker(3, 60_000);
        let host = "archives.nseindia.com";

        for _ in 0..2 {
            cb.record_failure(host);
            assert!(cb.check(host).is_ok());
        }
        cb.record_failure(host);
        assert!(matches!(
            cb.check(host),
            Err(FetchError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let cb = breaker(3, 60_000);
        let host = "www.bseindia.com";

        cb.record_failure(host);
        cb.record_failure(host);
        cb.record_success(host);
        cb.record_failure(host);
        cb.record_failure(host);
        assert!(cb.check(host).is_ok());
    }

    #[test]
    fn half_open_probe_after_cooldown() {
        let cb = breaker(1, 0);
        let host = "archives.nseindia.com";

        cb.record_failure(host);
        // Zero cooldown: the next check transitions to half-open.
        assert!(cb.check(host).is_ok());

        // Failed probe re-opens; with nonzero cooldown it would block again.
        cb.record_failure(host);
        cb.record_success(host);
        assert!(cb.check(host).is_ok());
    }

    #[test]
    fn hosts_are_isolated() {
        let cb = breaker(1, 60_000);
        cb.record_failure("archives.nseindia.com");
        assert!(cb.check("www.bseindia.com").is_ok());
    }
}
