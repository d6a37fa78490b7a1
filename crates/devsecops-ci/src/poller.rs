//! Bounded readiness polling.

use crate::error::{PipelineError, Result};
use crate::probe::{ProbeSpec, ReadinessProbe};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What to poll, how often, and for how long.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollTarget {
    pub probe: ProbeSpec,

    /// Delay between attempts in milliseconds. Must be > 0.
    pub interval_ms: u64,

    /// Total budget in milliseconds. Must be >= `interval_ms`.
    pub timeout_ms: u64,
}

impl PollTarget {
    /// Create a validated poll target.
    pub fn new(probe: ProbeSpec, interval: Duration, timeout: Duration) -> Result<Self> {
        let target = Self::from_parts(probe, interval, timeout);
        target.validate()?;
        Ok(target)
    }

    pub(crate) fn from_parts(probe: ProbeSpec, interval: Duration, timeout: Duration) -> Self {
        Self {
            probe,
            interval_ms: interval.as_millis() as u64,
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(PipelineError::InvalidPollTarget(
                "interval must be > 0".to_string(),
            ));
        }
        if self.timeout_ms < self.interval_ms {
            return Err(PipelineError::InvalidPollTarget(format!(
                "timeout ({}ms) must be >= interval ({}ms)",
                self.timeout_ms, self.interval_ms
            )));
        }
        self.probe
            .validate()
            .map_err(PipelineError::InvalidPollTarget)
    }
}

/// Result of a polling session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Ready { attempts: u32, elapsed: Duration },
    TimedOut { attempts: u32, elapsed: Duration },
}

impl PollOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Ready { attempts, .. } | PollOutcome::TimedOut { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            PollOutcome::Ready { elapsed, .. } | PollOutcome::TimedOut { elapsed, .. } => *elapsed,
        }
    }
}

/// Polls a target at a fixed interval until it is ready or the timeout expires.
pub struct ReadinessPoller {
    client: reqwest::Client,
}

impl ReadinessPoller {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Build the target's probe and poll it.
    pub async fn poll(&self, target: &PollTarget) -> PollOutcome {
        let probe = target.probe.build(&self.client);
        Self::poll_probe(probe.as_ref(), target.interval(), target.timeout()).await
    }

    /// Poll an arbitrary probe.
    ///
    /// The first query happens immediately. Each query is bounded by the time
    /// left before the deadline, so the call returns once `timeout` has
    /// elapsed even if the probe hangs.
    pub async fn poll_probe(
        probe: &dyn ReadinessProbe,
        interval: Duration,
        timeout: Duration,
    ) -> PollOutcome {
        let start = Instant::now();
        let deadline = start + timeout;
        let target = probe.describe();
        let mut attempts = 0u32;

        info!(target = %target, ?interval, ?timeout, "Waiting for readiness");

        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());

            let ready = match tokio::time::timeout(remaining, probe.is_ready()).await {
                Ok(Ok(ready)) => ready,
                Ok(Err(e)) => {
                    debug!(target = %target, attempt = attempts, error = %e, "Probe error");
                    false
                }
                Err(_) => {
                    debug!(target = %target, attempt = attempts, "Probe exceeded remaining budget");
                    false
                }
            };

            let now = Instant::now();
            if ready {
                let elapsed = now - start;
                info!(target = %target, attempts, ?elapsed, "Target ready");
                return PollOutcome::Ready { attempts, elapsed };
            }

            if now >= deadline {
                let elapsed = now - start;
                warn!(target = %target, attempts, ?elapsed, "Readiness timed out");
                return PollOutcome::TimedOut { attempts, elapsed };
            }

            let pause = interval.min(deadline - now);
            tokio::time::sleep(pause).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Becomes ready on the Nth query (0 = never).
    struct CountingProbe {
        ready_on: u32,
        queries: AtomicU32,
    }

    impl CountingProbe {
        fn new(ready_on: u32) -> Self {
            Self {
                ready_on,
                queries: AtomicU32::new(0),
            }
        }

        fn queries(&self) -> u32 {
            self.queries.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReadinessProbe for CountingProbe {
        fn describe(&self) -> String {
            "counting".to_string()
        }

        async fn is_ready(&self) -> anyhow::Result<bool> {
            let n = self.queries.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(self.ready_on != 0 && n >= self.ready_on)
        }
    }

    struct FailingProbe;

    #[async_trait]
    impl ReadinessProbe for FailingProbe {
        fn describe(&self) -> String {
            "failing".to_string()
        }

        async fn is_ready(&self) -> anyhow::Result<bool> {
            anyhow::bail!("connection refused")
        }
    }

    /// Never answers.
    struct HangingProbe;

    #[async_trait]
    impl ReadinessProbe for HangingProbe {
        fn describe(&self) -> String {
            "hanging".to_string()
        }

        async fn is_ready(&self) -> anyhow::Result<bool> {
            std::future::pending::<()>().await;
            Ok(true)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_first_attempt() {
        let probe = CountingProbe::new(1);
        let outcome =
            ReadinessPoller::poll_probe(&probe, Duration::from_secs(1), Duration::from_secs(5))
                .await;
        assert_eq!(
            outcome,
            PollOutcome::Ready {
                attempts: 1,
                elapsed: Duration::ZERO
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_three_intervals() {
        let probe = CountingProbe::new(4);
        let outcome =
            ReadinessPoller::poll_probe(&probe, Duration::from_secs(1), Duration::from_secs(5))
                .await;
        assert!(outcome.is_ready());
        assert_eq!(outcome.attempts(), 4);
        assert_eq!(outcome.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_exactly_at_timeout() {
        let probe = CountingProbe::new(0);
        let start = Instant::now();
        let outcome =
            ReadinessPoller::poll_probe(&probe, Duration::from_secs(1), Duration::from_secs(5))
                .await;
        assert_eq!(
            outcome,
            PollOutcome::TimedOut {
                attempts: 6,
                elapsed: Duration::from_secs(5)
            }
        );
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert_eq!(probe.queries(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uneven_interval_does_not_overshoot() {
        let probe = CountingProbe::new(0);
        let outcome =
            ReadinessPoller::poll_probe(&probe, Duration::from_secs(2), Duration::from_secs(5))
                .await;
        assert!(!outcome.is_ready());
        assert_eq!(outcome.elapsed(), Duration::from_secs(5));
        // t = 0, 2, 4, 5
        assert_eq!(outcome.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_errors_count_as_not_ready() {
        let outcome = ReadinessPoller::poll_probe(
            &FailingProbe,
            Duration::from_secs(1),
            Duration::from_secs(3),
        )
        .await;
        assert!(!outcome.is_ready());
        assert_eq!(outcome.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_probe_bounded_by_timeout() {
        let outcome = ReadinessPoller::poll_probe(
            &HangingProbe,
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
        .await;
        assert!(!outcome.is_ready());
        assert_eq!(outcome.elapsed(), Duration::from_secs(5));
        assert_eq!(outcome.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_is_idempotent_for_ready_target() {
        let probe = CountingProbe::new(1);
        let first =
            ReadinessPoller::poll_probe(&probe, Duration::from_secs(1), Duration::from_secs(5))
                .await;
        let second =
            ReadinessPoller::poll_probe(&probe, Duration::from_secs(1), Duration::from_secs(5))
                .await;
        assert!(first.is_ready());
        assert!(second.is_ready());
        assert_eq!(second.attempts(), 1);
        assert_eq!(probe.queries(), 2);
    }

    #[test]
    fn test_poll_target_validation() {
        let probe = ProbeSpec::http("http://127.0.0.1:8000/health");
        assert!(PollTarget::new(probe.clone(), Duration::ZERO, Duration::from_secs(5)).is_err());
        assert!(
            PollTarget::new(probe.clone(), Duration::from_secs(5), Duration::from_secs(1)).is_err()
        );
        let target = PollTarget::new(probe, Duration::from_secs(1), Duration::from_secs(1))
            .expect("interval == timeout is valid");
        assert_eq!(target.interval(), Duration::from_secs(1));
        assert_eq!(target.timeout(), Duration::from_secs(1));
    }
}
