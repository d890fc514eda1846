//! testbed.toml configuration parser.
//!
//! Every section has defaults, so an empty file (or no file at all) yields a
//! usable configuration. CLI flags override individual values after loading.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TestbedConfig {
    pub cluster: ClusterConfig,
    pub naming: NamingConfig,
    pub detect: DetectConfig,
    pub network: NetworkConfig,
    pub vcluster: VclusterConfig,
    pub readiness: ReadinessConfig,
    pub storage: StorageConfig,
    pub deploy: DeployConfig,
    pub lease: LeaseConfig,
    pub ssh: Option<SshConfig>,
}

/// Parent cluster access.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub kubectl: String,
    pub vcluster: String,
    /// Kubeconfig for the parent cluster. Falls back to the ambient `KUBECONFIG`.
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            vcluster: "vcluster".to_string(),
            kubeconfig: None,
            context: None,
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    pub namespace_prefix: String,
    pub instance_prefix: String,
    pub credential_dir: PathBuf,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            namespace_prefix: "testbed-pr-".to_string(),
            instance_prefix: "pr-".to_string(),
            credential_dir: PathBuf::from(".testbed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectConfig {
    pub target_ref: String,
    pub manifest_dir: String,
    pub extensions: Vec<String>,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            target_ref: "origin/main".to_string(),
            manifest_dir: "scripts/testbed".to_string(),
            extensions: default_extensions(),
        }
    }
}

/// Host-level network prerequisites. All of them are best-effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// `key=value` pairs passed to `sysctl -w`.
    pub sysctls: Vec<String>,
    pub sudo: bool,
    pub overlay: Option<OverlayConfig>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            sysctls: vec![
                "net.ipv4.ip_forward=1".to_string(),
                "net.bridge.bridge-nf-call-iptables=1".to_string(),
            ],
            sudo: true,
            overlay: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    pub namespace: String,
    pub daemonset: String,
    /// Path or URL handed to `kubectl apply -f` when the daemonset is missing.
    pub manifest: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
    /// `vcluster connect --print`.
    #[default]
    Connect,
    /// The `vc-<instance>` secret generated by the vcluster chart.
    Secret,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VclusterConfig {
    pub values: Option<PathBuf>,
    pub chart_version: Option<String>,
    pub credential: CredentialSource,
    /// API server address written into the extracted kubeconfig.
    pub server: Option<String>,
    pub secret_key: String,
}

impl Default for VclusterConfig {
    fn default() -> Self {
        Self {
            values: None,
            chart_version: None,
            credential: CredentialSource::default(),
            server: None,
            secret_key: "config".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub retries: u32,
    pub interval_secs: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            retries: 30,
            interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub enabled: bool,
    pub fallback_class: String,
    pub host_path_root: String,
    pub claim_name: String,
    pub claim_namespace: String,
    /// Kubernetes quantity, e.g. `5Gi`.
    pub min_size: String,
    pub bind_retries: u32,
    pub bind_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_class: "testbed-local".to_string(),
            host_path_root: "/var/lib/testbed".to_string(),
            claim_name: "testbed-shared".to_string(),
            claim_namespace: "default".to_string(),
            min_size: "5Gi".to_string(),
            bind_retries: 12,
            bind_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub manifest_root: PathBuf,
    pub namespace: String,
    pub rollout_timeout_secs: u64,
    pub extensions: Vec<String>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            manifest_root: PathBuf::from("scripts/testbed"),
            namespace: "default".to_string(),
            rollout_timeout_secs: 120,
            extensions: default_extensions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3600,
        }
    }
}

/// SSH hop to the parent cluster's host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub host: String,
    pub user: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    /// Extra `-o` options, e.g. `StrictHostKeyChecking=no`.
    #[serde(default)]
    pub options: Vec<String>,
    pub tunnel: Option<TunnelConfig>,
}

/// Local port forward to the parent API server, kept open for the whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub local_port: u16,
    /// `host:port` as seen from the SSH host.
    pub remote: String,
    #[serde(default = "default_tunnel_ready_retries")]
    pub ready_retries: u32,
    #[serde(default = "default_tunnel_ready_interval_ms")]
    pub ready_interval_ms: u64,
}

fn default_extensions() -> Vec<String> {
    vec!["yaml".to_string(), "yml".to_string(), "json".to_string()]
}

fn default_ssh_port() -> u16 {
    22
}

fn default_tunnel_ready_retries() -> u32 {
    20
}

fn default_tunnel_ready_interval_ms() -> u64 {
    500
}

impl TestbedConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: TestbedConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.is_file() {
            Self::from_file(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for entry in &self.network.sysctls {
            if !entry.contains('=') {
                return Err(ConfigError::Invalid(format!(
                    "sysctl entry `{entry}` must be key=value"
                )));
            }
        }
        if self.detect.extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "detect.extensions must not be empty".to_string(),
            ));
        }
        // leaseDurationSeconds is an int32 in the Lease API.
        if self.lease.ttl_secs == 0 || self.lease.ttl_secs > i32::MAX as u64 {
            return Err(ConfigError::Invalid(format!(
                "lease.ttl_secs {} must be between 1 and {}",
                self.lease.ttl_secs,
                i32::MAX
            )));
        }
        if let Some(tunnel) = self.ssh.as_ref().and_then(|s| s.tunnel.as_ref()) {
            if !tunnel.remote.contains(':') {
                return Err(ConfigError::Invalid(format!(
                    "ssh.tunnel.remote `{}` must be host:port",
                    tunnel.remote
                )));
            }
        }
        Ok(())
    }
}
