//! Removal of one environment. Every step tolerates the resource already
//! being gone, so teardown can be repeated.

use tracing::{debug, info};

use testbed_core::{ChangeId, CommandRunner, Kubectl, TestbedConfig, VclusterCli};

use crate::error::{ProvisionError, ProvisionResult};
use crate::instance;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub instance_deleted: bool,
    pub credential_removed: bool,
}

pub struct Teardown<'a, R: ?Sized> {
    runner: &'a R,
    parent: Kubectl,
    vcluster: VclusterCli,
}

impl<'a, R: CommandRunner + ?Sized> Teardown<'a, R> {
    pub fn new(runner: &'a R, config: &TestbedConfig) -> Self {
        Self {
            runner,
            parent: Kubectl::parent(&config.cluster),
            vcluster: VclusterCli::new(&config.cluster),
        }
    }

    pub async fn run(&self, change: &ChangeId) -> ProvisionResult<TeardownReport> {
        let instance_deleted = instance::delete(self.runner, &self.vcluster, change).await?;
        if !instance_deleted {
            debug!(instance = %change.instance(), "virtual cluster already gone");
        }

        let ns = change.namespace();
        let inv = self
            .parent
            .command(["delete", "namespace", ns, "--ignore-not-found", "--wait=false"]);
        let out = self.runner.run(&inv).await?;
        if !out.success() {
            return Err(ProvisionError::Teardown {
                target: format!("namespace {ns}"),
                message: out.diagnostic(),
            });
        }

        let path = change.credential_path();
        let credential_removed = match std::fs::remove_file(path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(ProvisionError::Teardown {
                    target: path.display().to_string(),
                    message: e.to_string(),
                });
            }
        };

        info!(change = %change, instance_deleted, credential_removed, "environment torn down");
        Ok(TeardownReport {
            instance_deleted,
            credential_removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Provisioner;
    use testbed_test_utils::FakeCluster;

    #[tokio::test]
    async fn teardown_twice_is_safe() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TestbedConfig::default();
        config.naming.credential_dir = dir.path().to_path_buf();
        config.network.sysctls.clear();
        let change = ChangeId::parse("5", &config.naming).unwrap();
        let cluster = FakeCluster::new();

        let mut report = Provisioner::new(&cluster, &config).provision(&change).await.unwrap();
        Provisioner::new(&cluster, &config).release(&mut report).await;

        let teardown = Teardown::new(&cluster, &config);
        let first = teardown.run(&change).await.unwrap();
        assert!(first.instance_deleted);
        assert!(first.credential_removed);

        let second = teardown.run(&change).await.unwrap();
        assert_eq!(second, TeardownReport::default());

        let state = cluster.state();
        assert!(state.namespaces.is_empty());
        assert!(state.instances.is_empty());
    }

    #[tokio::test]
    async fn unreachable_parent_fails_teardown() {
        let config = TestbedConfig::default();
        let change = ChangeId::parse("5", &config.naming).unwrap();
        let cluster = FakeCluster::new();
        cluster.with(|s| s.reachable = false);

        let err = Teardown::new(&cluster, &config).run(&change).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Teardown { .. }));
    }
}
