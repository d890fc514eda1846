//! Builders for `kubectl` and `vcluster` invocations.
//!
//! Both tools take the target cluster from global flags or the
//! environment; these builders keep that prefix in one place so the parent
//! cluster and a virtual cluster are addressed consistently.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ClusterConfig;
use crate::exec::Invocation;

/// Addresses one cluster through `kubectl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kubectl {
    binary: String,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
}

impl Kubectl {
    /// The parent (host) cluster, as configured.
    pub fn parent(config: &ClusterConfig) -> Self {
        Self {
            binary: config.kubectl.clone(),
            kubeconfig: config.kubeconfig.clone(),
            context: config.context.clone(),
        }
    }

    /// A virtual cluster reached through its extracted credential.
    pub fn with_credential(config: &ClusterConfig, credential: &Path) -> Self {
        Self {
            binary: config.kubectl.clone(),
            kubeconfig: Some(credential.to_path_buf()),
            context: None,
        }
    }

    pub fn kubeconfig(&self) -> Option<&Path> {
        self.kubeconfig.as_deref()
    }

    /// `kubectl [--kubeconfig <path>] [--context <ctx>] <args...>`
    pub fn command<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inv = Invocation::new(&self.binary);
        if let Some(path) = &self.kubeconfig {
            inv = inv.arg("--kubeconfig").arg(path.display().to_string());
        }
        if let Some(context) = &self.context {
            inv = inv.arg("--context").arg(context.clone());
        }
        inv.args(args)
    }

    /// Like [`Kubectl::command`] but bounded by a server-side request
    /// timeout and a matching client-side kill timeout.
    pub fn bounded<I, S>(&self, args: I, timeout: Duration) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command(args)
            .arg(format!("--request-timeout={}s", timeout.as_secs().max(1)))
            .timeout(timeout + Duration::from_secs(5))
    }
}

/// Drives the `vcluster` CLI against the parent cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VclusterCli {
    binary: String,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
}

impl VclusterCli {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            binary: config.vcluster.clone(),
            kubeconfig: config.kubeconfig.clone(),
            context: config.context.clone(),
        }
    }

    /// `vcluster <args...> [--context <ctx>]`, with `KUBECONFIG` set when a
    /// parent kubeconfig is configured.
    pub fn command<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inv = Invocation::new(&self.binary).args(args);
        if let Some(context) = &self.context {
            inv = inv.arg("--context").arg(context.clone());
        }
        if let Some(path) = &self.kubeconfig {
            inv = inv.env("KUBECONFIG", path.display().to_string());
        }
        inv
    }
}

/// Whether kubectl/vcluster output reports a missing object.
pub fn is_not_found(diagnostic: &str) -> bool {
    let lower = diagnostic.to_ascii_lowercase();
    lower.contains("notfound") || lower.contains("not found") || lower.contains("couldn't find")
}

/// Whether kubectl output reports a create conflict.
pub fn is_already_exists(diagnostic: &str) -> bool {
    let lower = diagnostic.to_ascii_lowercase();
    lower.contains("alreadyexists") || lower.contains("already exists")
}
