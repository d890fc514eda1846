//! Host network prerequisites: kernel parameters and the overlay daemonset.
//!
//! Nothing here is fatal. A host that already has forwarding enabled or
//! refuses `sudo` still gets a usable environment more often than not.

use tracing::{debug, info};

use testbed_core::config::{NetworkConfig, OverlayConfig};
use testbed_core::kube::is_not_found;
use testbed_core::{CommandRunner, Invocation, Kubectl, SshRunner, SshTarget};

use crate::report::Warnings;

const STEP: &str = "network";

pub struct NetworkPrep<'a, R: ?Sized> {
    runner: &'a R,
    kubectl: &'a Kubectl,
    config: &'a NetworkConfig,
    host: Option<SshTarget>,
}

impl<'a, R: CommandRunner + ?Sized> NetworkPrep<'a, R> {
    pub fn new(runner: &'a R, kubectl: &'a Kubectl, config: &'a NetworkConfig) -> Self {
        Self {
            runner,
            kubectl,
            config,
            host: None,
        }
    }

    /// Run host commands on `target` over SSH instead of locally.
    pub fn on_host(mut self, target: Option<SshTarget>) -> Self {
        self.host = target;
        self
    }

    fn sysctl(&self, entry: &str) -> Invocation {
        if self.config.sudo {
            Invocation::new("sudo").args(["-n", "sysctl", "-w", entry])
        } else {
            Invocation::new("sysctl").args(["-w", entry])
        }
    }

    async fn run_on_host(&self, inv: &Invocation) -> Result<(), String> {
        let result = match &self.host {
            Some(target) => SshRunner::new(target.clone(), self.runner).run(inv).await,
            None => self.runner.run(inv).await,
        };
        match result {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(out.diagnostic()),
            Err(e) => Err(e.to_string()),
        }
    }

    pub async fn apply(&self, warnings: &mut Warnings) {
        for entry in &self.config.sysctls {
            match self.run_on_host(&self.sysctl(entry)).await {
                Ok(()) => debug!(%entry, "sysctl applied"),
                Err(e) => warnings.push(STEP, format!("sysctl {entry} failed: {e}")),
            }
        }
        if let Some(overlay) = &self.config.overlay {
            self.ensure_overlay(overlay, warnings).await;
        }
    }

    async fn ensure_overlay(&self, overlay: &OverlayConfig, warnings: &mut Warnings) {
        let get = self.kubectl.command([
            "get",
            "daemonset",
            overlay.daemonset.as_str(),
            "-n",
            overlay.namespace.as_str(),
            "-o",
            "name",
        ]);
        match self.runner.run(&get).await {
            Ok(out) if out.success() => {
                debug!(daemonset = %overlay.daemonset, "overlay network present");
                return;
            }
            Ok(out) if is_not_found(&out.stderr) => {}
            Ok(out) => {
                warnings.push(STEP, format!("overlay check failed: {}", out.diagnostic()));
                return;
            }
            Err(e) => {
                warnings.push(STEP, format!("overlay check failed: {e}"));
                return;
            }
        }

        let apply = self.kubectl.command(["apply", "-f", overlay.manifest.as_str()]);
        match self.runner.run(&apply).await {
            Ok(out) if out.success() => {
                info!(daemonset = %overlay.daemonset, manifest = %overlay.manifest, "overlay network installed")
            }
            Ok(out) => warnings.push(STEP, format!("overlay install failed: {}", out.diagnostic())),
            Err(e) => warnings.push(STEP, format!("overlay install failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testbed_core::CommandOutput;
    use testbed_core::config::ClusterConfig;
    use testbed_test_utils::ScriptedRunner;

    fn overlay() -> OverlayConfig {
        OverlayConfig {
            namespace: "kube-system".to_string(),
            daemonset: "kube-flannel".to_string(),
            manifest: "https://example.invalid/flannel.yml".to_string(),
        }
    }

    #[tokio::test]
    async fn sysctls_run_locally_with_sudo() {
        let runner = ScriptedRunner::new();
        let kubectl = Kubectl::parent(&ClusterConfig::default());
        let config = NetworkConfig::default();
        let mut warnings = Warnings::default();
        NetworkPrep::new(&runner, &kubectl, &config).apply(&mut warnings).await;

        assert!(warnings.is_empty());
        assert!(runner.was_called(&["sudo", "-n", "sysctl", "-w", "net.ipv4.ip_forward=1"]));
        assert_eq!(runner.count(&["sysctl"]), 2);
    }

    #[tokio::test]
    async fn sysctls_go_through_ssh_when_host_is_set() {
        let runner = ScriptedRunner::new();
        let kubectl = Kubectl::parent(&ClusterConfig::default());
        let config = NetworkConfig {
            sysctls: vec!["net.ipv4.ip_forward=1".to_string()],
            sudo: false,
            overlay: None,
        };
        let target = SshTarget {
            host: "node-1".to_string(),
            user: None,
            port: 22,
            identity_file: None,
            options: Vec::new(),
        };
        let mut warnings = Warnings::default();
        NetworkPrep::new(&runner, &kubectl, &config)
            .on_host(Some(target))
            .apply(&mut warnings)
            .await;

        assert!(runner.was_called(&["ssh", "node-1", "--", "sysctl -w net.ipv4.ip_forward=1"]));
    }

    #[tokio::test]
    async fn sysctl_failure_is_a_warning() {
        let runner = ScriptedRunner::new();
        runner.on(&["sysctl"], CommandOutput::failed(1, "sudo: a password is required"));
        let kubectl = Kubectl::parent(&ClusterConfig::default());
        let config = NetworkConfig::default();
        let mut warnings = Warnings::default();
        NetworkPrep::new(&runner, &kubectl, &config).apply(&mut warnings).await;

        assert_eq!(warnings.len(), 2);
        assert!(warnings.has_step(STEP));
    }

    #[tokio::test]
    async fn missing_overlay_is_installed() {
        let runner = ScriptedRunner::new();
        runner.on(
            &["get", "daemonset", "kube-flannel"],
            CommandOutput::failed(1, r#"Error from server (NotFound): daemonsets.apps "kube-flannel" not found"#),
        );
        let kubectl = Kubectl::parent(&ClusterConfig::default());
        let config = NetworkConfig {
            sysctls: Vec::new(),
            sudo: false,
            overlay: Some(overlay()),
        };
        let mut warnings = Warnings::default();
        NetworkPrep::new(&runner, &kubectl, &config).apply(&mut warnings).await;

        assert!(warnings.is_empty());
        assert!(runner.was_called(&["kubectl", "apply", "-f", "https://example.invalid/flannel.yml"]));
    }

    #[tokio::test]
    async fn present_overlay_is_left_alone() {
        let runner = ScriptedRunner::new();
        let kubectl = Kubectl::parent(&ClusterConfig::default());
        let config = NetworkConfig {
            sysctls: Vec::new(),
            sudo: false,
            overlay: Some(overlay()),
        };
        let mut warnings = Warnings::default();
        NetworkPrep::new(&runner, &kubectl, &config).apply(&mut warnings).await;
        assert!(!runner.was_called(&["kubectl", "apply"]));
    }
}
