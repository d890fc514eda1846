//! End-to-end pipeline runs against the simulated cluster.

use std::fs;
use std::path::Path;

use testbed_cli::commands::detect::DetectOptions;
use testbed_cli::commands::run::{RunOptions, run};
use testbed_cli::commands::{self, deploy, parse_units, provision, teardown};
use testbed_core::config::{SshConfig, TunnelConfig};
use testbed_core::{CommandOutput, CommandRunner, Invocation, TestbedConfig};
use testbed_core::exec::RunFuture;
use testbed_test_utils::{FakeCluster, ScriptedRunner};

/// Answers `git` from a script and everything else from a fake cluster.
struct GitAndCluster {
    git: ScriptedRunner,
    cluster: FakeCluster,
}

impl CommandRunner for GitAndCluster {
    fn run<'a>(&'a self, invocation: &'a Invocation) -> RunFuture<'a> {
        if invocation.program == "git" {
            self.git.run(invocation)
        } else {
            self.cluster.run(invocation)
        }
    }
}

fn workspace(root: &Path) -> TestbedConfig {
    let mut config = TestbedConfig::default();
    config.naming.credential_dir = root.join(".testbed");
    config.deploy.manifest_root = root.join("scripts/testbed");
    config.network.sysctls.clear();
    fs::create_dir_all(&config.deploy.manifest_root).unwrap();
    config
}

#[tokio::test]
async fn detected_units_are_deployed_and_verified() {
    let dir = tempfile::tempdir().unwrap();
    let config = workspace(dir.path());
    fs::write(config.deploy.manifest_root.join("feature-a.yaml"), "").unwrap();

    let runner = GitAndCluster {
        git: ScriptedRunner::new(),
        cluster: FakeCluster::new(),
    };
    runner.git.on(&["git", "merge-base"], CommandOutput::ok("abc\n"));
    runner.git.on(
        &["git", "diff"],
        CommandOutput::ok("scripts/testbed/feature-a.yaml\0README.md\0"),
    );

    let change = commands::change_id("PR-17", &config).unwrap();
    let opts = RunOptions {
        units: None,
        detect: DetectOptions {
            revision: "HEAD".to_string(),
            ..Default::default()
        },
    };
    let summary = run(&runner, &config, &change, &opts).await.unwrap();

    assert_eq!(summary.units.to_string(), "feature-a");
    assert_eq!(summary.deploy.verified, vec!["feature-a"]);
    assert!(summary.provision.lease.is_none());

    let state = runner.cluster.state();
    assert_eq!(state.rollouts_checked, vec!["deployment.apps/feature-a"]);
    assert!(state.leases.is_empty());
    assert!(state.namespaces.contains_key("testbed-pr-pr-17"));
}

#[tokio::test]
async fn empty_unit_set_provisions_but_deploys_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = workspace(dir.path());
    let cluster = FakeCluster::new();
    let change = commands::change_id("3", &config).unwrap();

    let opts = RunOptions {
        units: Some(parse_units("")),
        ..Default::default()
    };
    let summary = run(&cluster, &config, &change, &opts).await.unwrap();

    assert!(summary.deploy.applied.is_empty());
    assert!(summary.provision.credential_path.exists());
    assert!(cluster.state().applied.is_empty());
}

#[tokio::test]
async fn instance_failure_skips_deploy() {
    let dir = tempfile::tempdir().unwrap();
    let config = workspace(dir.path());
    fs::write(config.deploy.manifest_root.join("api.yaml"), "").unwrap();
    let cluster = FakeCluster::new();
    cluster.with(|s| s.fail_instance_create = true);
    let change = commands::change_id("3", &config).unwrap();

    let opts = RunOptions {
        units: Some(parse_units("api")),
        ..Default::default()
    };
    let err = run(&cluster, &config, &change, &opts).await.unwrap_err();

    assert!(format!("{err:#}").contains("pr-3"));
    let state = cluster.state();
    assert!(state.applied.is_empty());
    assert!(state.rollouts_checked.is_empty());
    assert!(state.leases.is_empty());
}

#[tokio::test]
async fn rollout_timeout_fails_run_and_releases_lease() {
    let dir = tempfile::tempdir().unwrap();
    let config = workspace(dir.path());
    for unit in ["a", "b"] {
        fs::write(config.deploy.manifest_root.join(format!("{unit}.yaml")), "").unwrap();
    }
    let cluster = FakeCluster::new();
    cluster.with(|s| {
        s.failing_rollouts.insert("deployment.apps/a".to_string());
    });
    let change = commands::change_id("3", &config).unwrap();

    let opts = RunOptions {
        units: Some(parse_units("a,b")),
        ..Default::default()
    };
    let err = run(&cluster, &config, &change, &opts).await.unwrap_err();

    assert!(format!("{err:#}").contains("deployment.apps/a"));
    let state = cluster.state();
    assert_eq!(state.rollouts_checked, vec!["deployment.apps/a"]);
    assert!(state.leases.is_empty());
}

#[tokio::test]
async fn separate_steps_hand_off_through_env_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = workspace(dir.path());
    fs::write(config.deploy.manifest_root.join("api.yaml"), "").unwrap();
    let cluster = FakeCluster::new();
    let change = commands::change_id("8", &config).unwrap();
    let env_file = dir.path().join("github.env");

    let report = provision::provision(&cluster, &config, &change, Some(&env_file))
        .await
        .unwrap();
    let exported = fs::read_to_string(&env_file).unwrap();
    assert_eq!(exported.trim_end(), provision::handoff_line(&report));
    assert!(exported.starts_with("TESTBED_KUBECONFIG="));

    let credential = deploy::credential_for(&change, None);
    assert_eq!(credential, report.credential_path);
    let deployed = deploy::deploy(&cluster, &config, &credential, &parse_units("api"))
        .await
        .unwrap();
    assert_eq!(deployed.verified, vec!["api"]);

    let removed = teardown::teardown(&cluster, &config, &change).await.unwrap();
    assert!(removed.instance_deleted);
    let again = teardown::teardown(&cluster, &config, &change).await.unwrap();
    assert!(!again.instance_deleted);
    assert!(cluster.state().namespaces.is_empty());
}

/// A tunnel whose local end never accepts connections.
fn dead_tunnel(config: &mut TestbedConfig) {
    let free_port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    config.ssh = Some(SshConfig {
        host: "testbed-host.invalid".to_string(),
        user: None,
        port: 22,
        identity_file: None,
        options: vec!["ConnectTimeout=1".to_string()],
        tunnel: Some(TunnelConfig {
            local_port: free_port,
            remote: "127.0.0.1:6443".to_string(),
            ready_retries: 2,
            ready_interval_ms: 20,
        }),
    });
}

#[tokio::test]
async fn split_steps_go_through_the_configured_tunnel() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = workspace(dir.path());
    dead_tunnel(&mut config);
    let cluster = FakeCluster::new();
    let change = commands::change_id("8", &config).unwrap();

    let err = provision::provision(&cluster, &config, &change, None)
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("tunnel"), "{err:#}");

    let err = teardown::teardown(&cluster, &config, &change).await.unwrap_err();
    assert!(format!("{err:#}").contains("tunnel"), "{err:#}");

    let credential = deploy::credential_for(&change, None);
    let err = deploy::deploy(&cluster, &config, &credential, &parse_units("api"))
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("tunnel"), "{err:#}");

    assert!(cluster.calls().is_empty());
}

#[test]
fn invalid_change_id_is_rejected() {
    let config = TestbedConfig::default();
    let err = commands::change_id("###", &config).unwrap_err();
    assert!(format!("{err:#}").contains("###"));
}
