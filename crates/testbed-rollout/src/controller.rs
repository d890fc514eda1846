//! Deploy-then-verify controller.
//!
//! Every affected unit is applied before any rollout is checked, so slow
//! units overlap their startup. Verification then walks the rollout targets
//! in unit order and stops at the first one that does not complete.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use testbed_core::config::DeployConfig;
use testbed_core::{CommandRunner, ExecError, Kubectl, UnitSet};

use crate::error::{RolloutError, RolloutResult};
use crate::manifest::ManifestIndex;

/// Workload kinds whose progress `kubectl rollout status` can report.
const ROLLOUT_KINDS: [&str; 3] = ["deployment", "statefulset", "daemonset"];

/// Lifecycle of one unit within a deploy run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitPhase {
    Pending,
    /// No manifest found.
    Skipped,
    Applied,
    Verified,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeployReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    pub verified: Vec<String>,
    pub phases: BTreeMap<String, UnitPhase>,
}

impl DeployReport {
    pub fn phase(&self, unit: &str) -> Option<UnitPhase> {
        self.phases.get(unit).copied()
    }

    fn set(&mut self, unit: &str, phase: UnitPhase) {
        self.phases.insert(unit.to_string(), phase);
        let list = match phase {
            UnitPhase::Applied => &mut self.applied,
            UnitPhase::Skipped => &mut self.skipped,
            UnitPhase::Verified => &mut self.verified,
            UnitPhase::Pending | UnitPhase::Failed => return,
        };
        list.push(unit.to_string());
    }
}

/// Rollout targets (`deployment.apps/api`) among `kubectl apply -o name` output.
pub fn rollout_targets(applied: &str) -> Vec<String> {
    applied
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|name| {
            name.split_once('/')
                .map(|(kind, _)| kind.split('.').next().unwrap_or(kind))
                .is_some_and(|kind| ROLLOUT_KINDS.contains(&kind))
        })
        .map(str::to_string)
        .collect()
}

pub struct Deployer<'a, R: ?Sized> {
    runner: &'a R,
    kubectl: &'a Kubectl,
    index: ManifestIndex,
    namespace: String,
    timeout: Duration,
}

impl<'a, R: CommandRunner + ?Sized> Deployer<'a, R> {
    /// `kubectl` must address the provisioned environment.
    pub fn new(runner: &'a R, kubectl: &'a Kubectl, config: &DeployConfig) -> Self {
        Self {
            runner,
            kubectl,
            index: ManifestIndex::from_config(config),
            namespace: config.namespace.clone(),
            timeout: Duration::from_secs(config.rollout_timeout_secs),
        }
    }

    /// Deploy and verify `units`, returning what happened.
    pub async fn run(&self, units: &UnitSet) -> RolloutResult<DeployReport> {
        let mut report = DeployReport::default();
        self.deploy(units, &mut report).await?;
        Ok(report)
    }

    /// Like [`Deployer::run`], but leaves the partial report in `report`
    /// when a unit fails.
    pub async fn deploy(&self, units: &UnitSet, report: &mut DeployReport) -> RolloutResult<()> {
        if units.is_empty() {
            info!("no units to deploy");
            return Ok(());
        }
        for unit in units.iter() {
            report.set(unit, UnitPhase::Pending);
        }

        let mut targets: Vec<(String, Vec<String>)> = Vec::new();
        for unit in units.iter() {
            let Some(manifest) = self.index.lookup(unit) else {
                warn!(%unit, root = %self.index.root().display(), "no manifest for unit, skipping");
                report.set(unit, UnitPhase::Skipped);
                continue;
            };

            let inv = self
                .kubectl
                .command(["apply", "-n", self.namespace.as_str()])
                .args(manifest.apply_args())
                .args(["-o", "name"]);
            let out = self.runner.run(&inv).await.inspect_err(|_| {
                report.set(unit, UnitPhase::Failed);
            })?;
            if !out.success() {
                report.set(unit, UnitPhase::Failed);
                return Err(RolloutError::Apply {
                    unit: unit.to_string(),
                    message: out.diagnostic(),
                });
            }

            let found = rollout_targets(&out.stdout);
            info!(%unit, path = %manifest.path.display(), targets = found.len(), "unit applied");
            report.set(unit, UnitPhase::Applied);
            targets.push((unit.to_string(), found));
        }

        for (unit, unit_targets) in &targets {
            for target in unit_targets {
                if let Err(e) = self.verify(unit, target).await {
                    report.set(unit, UnitPhase::Failed);
                    return Err(e);
                }
            }
            report.set(unit, UnitPhase::Verified);
        }
        Ok(())
    }

    async fn verify(&self, unit: &str, target: &str) -> RolloutResult<()> {
        let secs = self.timeout.as_secs();
        let inv = self
            .kubectl
            .command([
                "rollout".to_string(),
                "status".to_string(),
                target.to_string(),
                "-n".to_string(),
                self.namespace.clone(),
                format!("--timeout={secs}s"),
            ])
            .timeout(self.timeout + Duration::from_secs(10));
        debug!(%unit, %target, timeout_secs = secs, "waiting for rollout");

        let timed_out = |message: String| RolloutError::Timeout {
            unit: unit.to_string(),
            target: target.to_string(),
            message,
        };
        match self.runner.run(&inv).await {
            Ok(out) if out.success() => {
                info!(%unit, %target, "rollout complete");
                Ok(())
            }
            Ok(out) => Err(timed_out(out.diagnostic())),
            Err(e @ ExecError::Timeout { .. }) => Err(timed_out(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use testbed_core::config::ClusterConfig;
    use testbed_test_utils::FakeCluster;

    fn config(root: &Path) -> DeployConfig {
        DeployConfig {
            manifest_root: root.to_path_buf(),
            ..Default::default()
        }
    }

    fn vkubectl() -> Kubectl {
        Kubectl::with_credential(&ClusterConfig::default(), Path::new(".testbed/kc.yaml"))
    }

    fn units(names: &[&str]) -> UnitSet {
        names.iter().copied().collect()
    }

    #[test]
    fn targets_only_include_rollout_kinds() {
        let out = "deployment.apps/api\nservice/api\nstatefulset.apps/db\nconfigmap/x\ndaemonset.apps/agent\n";
        assert_eq!(
            rollout_targets(out),
            vec!["deployment.apps/api", "statefulset.apps/db", "daemonset.apps/agent"]
        );
    }

    #[tokio::test]
    async fn empty_unit_set_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = FakeCluster::new();
        let kubectl = vkubectl();
        let report = Deployer::new(&cluster, &kubectl, &config(dir.path()))
            .run(&UnitSet::new())
            .await
            .unwrap();
        assert!(report.applied.is_empty());
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn applies_everything_before_verifying() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("api.yaml"), "").unwrap();
        fs::write(dir.path().join("web.yaml"), "").unwrap();
        let cluster = FakeCluster::new();
        let kubectl = vkubectl();

        let report = Deployer::new(&cluster, &kubectl, &config(dir.path()))
            .run(&units(&["web", "api", "gone"]))
            .await
            .unwrap();

        assert_eq!(report.applied, vec!["api", "web"]);
        assert_eq!(report.skipped, vec!["gone"]);
        assert_eq!(report.verified, vec!["api", "web"]);
        assert_eq!(report.phase("gone"), Some(UnitPhase::Skipped));

        let argv: Vec<String> = cluster.calls().iter().map(|c| c.args.join(" ")).collect();
        let last_apply = argv.iter().rposition(|a| a.contains(" apply ")).unwrap();
        let first_rollout = argv.iter().position(|a| a.contains(" rollout ")).unwrap();
        assert!(last_apply < first_rollout);
        assert_eq!(
            cluster.state().rollouts_checked,
            vec!["deployment.apps/api", "deployment.apps/web"]
        );
    }

    #[tokio::test]
    async fn rollout_timeout_stops_remaining_checks() {
        let dir = tempfile::tempdir().unwrap();
        for unit in ["a", "b", "c"] {
            fs::write(dir.path().join(format!("{unit}.yaml")), "").unwrap();
        }
        let cluster = FakeCluster::new();
        cluster.with(|s| {
            s.failing_rollouts.insert("deployment.apps/b".to_string());
        });
        let kubectl = vkubectl();
        let mut report = DeployReport::default();

        let err = Deployer::new(&cluster, &kubectl, &config(dir.path()))
            .deploy(&units(&["a", "b", "c"]), &mut report)
            .await
            .unwrap_err();

        assert!(matches!(err, RolloutError::Timeout { ref unit, .. } if unit == "b"));
        assert_eq!(report.phase("a"), Some(UnitPhase::Verified));
        assert_eq!(report.phase("b"), Some(UnitPhase::Failed));
        assert_eq!(report.phase("c"), Some(UnitPhase::Applied));
        assert_eq!(
            cluster.state().rollouts_checked,
            vec!["deployment.apps/a", "deployment.apps/b"]
        );
    }

    #[tokio::test]
    async fn hung_status_command_counts_as_rollout_timeout() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("api.yaml"), "").unwrap();
        let runner = testbed_test_utils::ScriptedRunner::new();
        runner.on(&["apply"], testbed_core::CommandOutput::ok("deployment.apps/api\n"));
        runner.on_timeout(&["rollout", "status"]);
        let kubectl = vkubectl();
        let mut report = DeployReport::default();

        let err = Deployer::new(&runner, &kubectl, &config(dir.path()))
            .deploy(&units(&["api"]), &mut report)
            .await
            .unwrap_err();

        assert!(
            matches!(err, RolloutError::Timeout { ref target, .. } if target == "deployment.apps/api"),
            "{err:?}"
        );
        assert_eq!(report.phase("api"), Some(UnitPhase::Failed));
    }

    #[tokio::test]
    async fn apply_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("api.yaml"), "").unwrap();
        let runner = testbed_test_utils::ScriptedRunner::new();
        runner.on(
            &["apply"],
            testbed_core::CommandOutput::failed(1, "error: unable to recognize \"api.yaml\""),
        );
        let kubectl = vkubectl();

        let err = Deployer::new(&runner, &kubectl, &config(dir.path()))
            .run(&units(&["api"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RolloutError::Apply { .. }));
        assert!(!runner.was_called(&["rollout"]));
    }

    #[tokio::test]
    async fn rollout_command_carries_timeout() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("api.yaml"), "").unwrap();
        let cluster = FakeCluster::new();
        let kubectl = vkubectl();
        let mut cfg = config(dir.path());
        cfg.rollout_timeout_secs = 45;
        cfg.namespace = "apps".to_string();

        Deployer::new(&cluster, &kubectl, &cfg)
            .run(&units(&["api"]))
            .await
            .unwrap();
        assert_eq!(
            cluster.count(&["rollout", "status", "deployment.apps/api", "-n", "apps", "--timeout=45s"]),
            1
        );
        assert_eq!(cluster.count(&["apply", "-n", "apps", "-f"]), 1);
    }
}
