//! The full pipeline: detect, provision, deploy, verify.

use tracing::info;

use testbed_core::{ChangeId, CommandRunner, Kubectl, TestbedConfig, UnitSet};
use testbed_provision::{ProvisionReport, Provisioner};
use testbed_rollout::{DeployReport, Deployer};

use super::detect::{DetectOptions, detect};
use super::tunneled;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Skips detection when set.
    pub units: Option<UnitSet>,
    pub detect: DetectOptions,
}

#[derive(Debug)]
pub struct RunSummary {
    pub units: UnitSet,
    pub provision: ProvisionReport,
    pub deploy: DeployReport,
}

pub async fn run<R: CommandRunner + ?Sized>(
    runner: &R,
    config: &TestbedConfig,
    change: &ChangeId,
    opts: &RunOptions,
) -> anyhow::Result<RunSummary> {
    tunneled(config, pipeline(runner, config, change, opts)).await
}

async fn pipeline<R: CommandRunner + ?Sized>(
    runner: &R,
    config: &TestbedConfig,
    change: &ChangeId,
    opts: &RunOptions,
) -> anyhow::Result<RunSummary> {
    let units = match &opts.units {
        Some(units) => units.clone(),
        None => detect(runner, config, &opts.detect).await?.units,
    };
    info!(change = %change, %units, "affected units");

    let provisioner = Provisioner::new(runner, config);
    let mut provision = provisioner.provision(change).await?;

    let kubectl = Kubectl::with_credential(&config.cluster, &provision.credential_path);
    let deployed = Deployer::new(runner, &kubectl, &config.deploy).run(&units).await;
    provisioner.release(&mut provision).await;
    let deploy = deployed?;

    info!(
        change = %change,
        applied = deploy.applied.len(),
        skipped = deploy.skipped.len(),
        warnings = provision.warnings.len(),
        "run complete"
    );
    Ok(RunSummary {
        units,
        provision,
        deploy,
    })
}
