//! Readiness probe logic.
//!
//! Probes a virtual cluster's API server through its extracted credential
//! and tracks consecutive results for reporting.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info, warn};

use testbed_core::config::ClusterConfig;
use testbed_core::{CommandRunner, Invocation, Kubectl};

use crate::poller::{PollOutcome, PollResult, Poller};

/// Result of a single readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The endpoint answered `ok`.
    Ready,
    /// The endpoint answered, but not ready (non-zero exit).
    NotReady,
    /// The probe could not be executed at all.
    Failed,
}

/// Tracks consecutive probe results for one target.
#[derive(Debug, Default)]
pub struct ProbeTracker {
    consecutive_failures: u32,
    total: u32,
    last: Option<ProbeResult>,
}

impl ProbeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a probe result and return whether the target is ready.
    pub fn record(&mut self, result: ProbeResult) -> bool {
        self.total += 1;
        self.last = Some(result);
        match result {
            ProbeResult::Ready => {
                if self.consecutive_failures > 0 {
                    debug!(
                        failures = self.consecutive_failures,
                        "target recovered to ready"
                    );
                }
                self.consecutive_failures = 0;
                true
            }
            ProbeResult::NotReady | ProbeResult::Failed => {
                self.consecutive_failures += 1;
                false
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn last(&self) -> Option<ProbeResult> {
        self.last
    }
}

/// Probes `/readyz` of a virtual cluster through its credential file.
pub struct ReadinessProbe<'a, R: ?Sized> {
    runner: &'a R,
    invocation: Invocation,
}

impl<'a, R: CommandRunner + ?Sized> ReadinessProbe<'a, R> {
    pub fn new(runner: &'a R, cluster: &ClusterConfig, credential: &Path, timeout: Duration) -> Self {
        let invocation =
            Kubectl::with_credential(cluster, credential).bounded(["get", "--raw", "/readyz"], timeout);
        Self { runner, invocation }
    }

    /// Run one probe.
    pub async fn probe(&self) -> ProbeResult {
        match self.runner.run(&self.invocation).await {
            Ok(out) if out.success() => ProbeResult::Ready,
            Ok(out) => {
                debug!(error = %out.diagnostic(), "readiness probe not ready");
                ProbeResult::NotReady
            }
            Err(e) => {
                debug!(error = %e, "readiness probe failed");
                ProbeResult::Failed
            }
        }
    }

    /// Probe until ready or until `poller` runs out of retries.
    pub async fn wait_ready(&self, poller: &Poller) -> PollResult {
        let tracker = Mutex::new(ProbeTracker::new());
        let result = poller
            .poll(|_| {
                let tracker = &tracker;
                async move {
                    let probe = self.probe().await;
                    if tracker.lock().is_ok_and(|mut t| t.record(probe)) {
                        PollOutcome::Ready
                    } else {
                        PollOutcome::Pending
                    }
                }
            })
            .await;

        match result {
            PollResult::Ready { attempts } => info!(attempts, "virtual cluster is ready"),
            PollResult::Exhausted { attempts } => warn!(
                attempts,
                last = ?tracker.lock().ok().and_then(|t| t.last()),
                "virtual cluster did not report ready"
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testbed_core::CommandOutput;
    use testbed_test_utils::ScriptedRunner;

    fn probe_for(runner: &ScriptedRunner) -> ReadinessProbe<'_, ScriptedRunner> {
        ReadinessProbe::new(
            runner,
            &ClusterConfig::default(),
            Path::new(".testbed/kc.yaml"),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn tracker_counts_consecutive_failures() {
        let mut tracker = ProbeTracker::new();
        assert!(!tracker.record(ProbeResult::NotReady));
        assert!(!tracker.record(ProbeResult::Failed));
        assert_eq!(tracker.consecutive_failures(), 2);
        assert!(tracker.record(ProbeResult::Ready));
        assert_eq!(tracker.consecutive_failures(), 0);
        assert_eq!(tracker.total(), 3);
        assert_eq!(tracker.last(), Some(ProbeResult::Ready));
    }

    #[tokio::test]
    async fn probe_uses_credential_and_readyz() {
        let runner = ScriptedRunner::new();
        let result = probe_for(&runner).probe().await;
        assert_eq!(result, ProbeResult::Ready);
        assert!(runner.was_called(&[
            "kubectl",
            "--kubeconfig",
            ".testbed/kc.yaml",
            "get",
            "--raw",
            "/readyz"
        ]));
    }

    #[tokio::test]
    async fn probe_classifies_failures() {
        let runner = ScriptedRunner::new();
        runner.on(&["/readyz"], CommandOutput::failed(1, "ServiceUnavailable"));
        assert_eq!(probe_for(&runner).probe().await, ProbeResult::NotReady);

        runner.on_spawn_error(&["/readyz"]);
        assert_eq!(probe_for(&runner).probe().await, ProbeResult::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ready_retries_until_ready() {
        let runner = ScriptedRunner::new();
        runner.on_sequence(
            &["/readyz"],
            vec![
                CommandOutput::failed(1, "not yet"),
                CommandOutput::failed(1, "not yet"),
                CommandOutput::ok("ok"),
            ],
        );
        let result = probe_for(&runner)
            .wait_ready(&Poller::new(5, Duration::from_secs(5)))
            .await;
        assert_eq!(result, PollResult::Ready { attempts: 3 });
        assert_eq!(runner.count(&["/readyz"]), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ready_gives_up_after_retries() {
        let runner = ScriptedRunner::new();
        runner.on(&["/readyz"], CommandOutput::failed(1, "not yet"));
        let result = probe_for(&runner)
            .wait_ready(&Poller::new(3, Duration::from_secs(5)))
            .await;
        assert_eq!(result, PollResult::Exhausted { attempts: 3 });
    }
}
