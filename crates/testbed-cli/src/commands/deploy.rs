use std::path::{Path, PathBuf};

use testbed_core::{ChangeId, CommandRunner, Kubectl, TestbedConfig, UnitSet};
use testbed_rollout::{DeployReport, Deployer};

use super::tunneled;

/// Credential to deploy through: the explicit path if given, else the
/// change's derived path.
pub fn credential_for(change: &ChangeId, explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| change.credential_path().clone())
}

pub async fn deploy<R: CommandRunner + ?Sized>(
    runner: &R,
    config: &TestbedConfig,
    credential: &Path,
    units: &UnitSet,
) -> anyhow::Result<DeployReport> {
    let kubectl = Kubectl::with_credential(&config.cluster, credential);
    tunneled(config, async {
        Ok::<_, anyhow::Error>(Deployer::new(runner, &kubectl, &config.deploy).run(units).await?)
    })
    .await
}
