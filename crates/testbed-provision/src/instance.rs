//! Virtual cluster lifecycle through the `vcluster` CLI.

use tracing::info;

use testbed_core::config::VclusterConfig;
use testbed_core::kube::is_not_found;
use testbed_core::{ChangeId, CommandRunner, VclusterCli};

use crate::error::{ProvisionError, ProvisionResult};

/// `vcluster create --upgrade` reconciles an existing instance in place, so
/// repeated runs converge on one instance per namespace.
pub async fn create_or_upgrade<R: CommandRunner + ?Sized>(
    runner: &R,
    vcluster: &VclusterCli,
    config: &VclusterConfig,
    change: &ChangeId,
) -> ProvisionResult<()> {
    let mut args = vec![
        "create".to_string(),
        change.instance().to_string(),
        "--namespace".to_string(),
        change.namespace().to_string(),
        "--upgrade".to_string(),
        "--connect=false".to_string(),
    ];
    if let Some(version) = &config.chart_version {
        args.push("--chart-version".to_string());
        args.push(version.clone());
    }
    if let Some(values) = &config.values {
        args.push("-f".to_string());
        args.push(values.display().to_string());
    }

    let out = runner.run(&vcluster.command(args)).await?;
    if !out.success() {
        return Err(ProvisionError::InstanceCreate {
            instance: change.instance().to_string(),
            message: out.diagnostic(),
        });
    }
    info!(instance = %change.instance(), namespace = %change.namespace(), "virtual cluster reconciled");
    Ok(())
}

/// Delete the instance. Returns `false` when it did not exist.
pub async fn delete<R: CommandRunner + ?Sized>(
    runner: &R,
    vcluster: &VclusterCli,
    change: &ChangeId,
) -> ProvisionResult<bool> {
    let inv = vcluster.command(["delete", change.instance(), "--namespace", change.namespace()]);
    let out = runner.run(&inv).await?;
    if out.success() {
        info!(instance = %change.instance(), "virtual cluster deleted");
        Ok(true)
    } else if is_not_found(&out.diagnostic()) {
        Ok(false)
    } else {
        Err(ProvisionError::Teardown {
            target: format!("virtual cluster {}", change.instance()),
            message: out.diagnostic(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use testbed_core::config::{ClusterConfig, NamingConfig};
    use testbed_test_utils::{FakeCluster, ScriptedRunner};

    fn change() -> ChangeId {
        ChangeId::parse("7", &NamingConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn passes_chart_version_and_values() {
        let runner = ScriptedRunner::new();
        let config = VclusterConfig {
            chart_version: Some("0.20.0".to_string()),
            values: Some(PathBuf::from("ci/vcluster.yaml")),
            ..Default::default()
        };
        create_or_upgrade(&runner, &VclusterCli::new(&ClusterConfig::default()), &config, &change())
            .await
            .unwrap();
        assert!(runner.was_called(&[
            "vcluster",
            "create",
            "pr-7",
            "--namespace",
            "testbed-pr-7",
            "--upgrade",
            "--connect=false",
            "--chart-version",
            "0.20.0",
            "-f",
            "ci/vcluster.yaml",
        ]));
    }

    #[tokio::test]
    async fn create_failure_is_fatal() {
        let cluster = FakeCluster::new();
        cluster.with(|s| {
            s.fail_instance_create = true;
            s.namespaces.insert("testbed-pr-7".to_string(), BTreeMap::new());
        });
        let err = create_or_upgrade(
            &cluster,
            &VclusterCli::new(&ClusterConfig::default()),
            &VclusterConfig::default(),
            &change(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProvisionError::InstanceCreate { .. }));
    }

    #[tokio::test]
    async fn delete_tolerates_missing_instance() {
        let cluster = FakeCluster::new();
        let vcluster = VclusterCli::new(&ClusterConfig::default());
        assert!(!delete(&cluster, &vcluster, &change()).await.unwrap());
    }
}
