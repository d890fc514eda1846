use std::io::Write;
use std::path::Path;

use anyhow::Context;
use tracing::info;

use testbed_core::{ChangeId, CommandRunner, TestbedConfig};
use testbed_provision::{ProvisionReport, Provisioner};

use super::{KUBECONFIG_ENV, tunneled};

/// Provision the environment, with the configured tunnel open, and release
/// the lease before returning.
pub async fn provision<R: CommandRunner + ?Sized>(
    runner: &R,
    config: &TestbedConfig,
    change: &ChangeId,
    env_file: Option<&Path>,
) -> anyhow::Result<ProvisionReport> {
    let report = tunneled(config, async {
        let provisioner = Provisioner::new(runner, config);
        let mut report = provisioner.provision(change).await?;
        provisioner.release(&mut report).await;
        Ok::<_, anyhow::Error>(report)
    })
    .await?;

    if let Some(path) = env_file {
        append_env(path, &report)?;
    }
    Ok(report)
}

/// `TESTBED_KUBECONFIG=<path>`
pub fn handoff_line(report: &ProvisionReport) -> String {
    format!("{KUBECONFIG_ENV}={}", report.credential_path.display())
}

/// Append the hand-off line to a CI env file such as `$GITHUB_ENV`.
pub fn append_env(path: &Path, report: &ProvisionReport) -> anyhow::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening env file {}", path.display()))?;
    writeln!(file, "{}", handoff_line(report))
        .with_context(|| format!("writing env file {}", path.display()))?;
    info!(path = %path.display(), "credential path exported");
    Ok(())
}
