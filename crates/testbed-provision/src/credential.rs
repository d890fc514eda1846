//! Extraction of the virtual cluster's kubeconfig.

use std::io::Write;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::info;

use testbed_core::config::{CredentialSource, VclusterConfig};
use testbed_core::{ChangeId, CommandRunner, Kubectl, VclusterCli};

use crate::error::{ProvisionError, ProvisionResult};

pub struct CredentialExtractor<'a, R: ?Sized> {
    runner: &'a R,
    parent: &'a Kubectl,
    vcluster: &'a VclusterCli,
    config: &'a VclusterConfig,
}

impl<'a, R: CommandRunner + ?Sized> CredentialExtractor<'a, R> {
    pub fn new(
        runner: &'a R,
        parent: &'a Kubectl,
        vcluster: &'a VclusterCli,
        config: &'a VclusterConfig,
    ) -> Self {
        Self {
            runner,
            parent,
            vcluster,
            config,
        }
    }

    /// Fetch the kubeconfig and write it to the change's credential path.
    pub async fn extract(&self, change: &ChangeId) -> ProvisionResult<()> {
        let fail = |message: String| ProvisionError::Credential {
            instance: change.instance().to_string(),
            message,
        };

        let content = match self.config.credential {
            CredentialSource::Connect => self.from_connect(change).await?,
            CredentialSource::Secret => self.from_secret(change).await?,
        }
        .map_err(fail)?;

        if content.trim().is_empty() {
            return Err(fail("credential is empty".to_string()));
        }

        let path = change.credential_path();
        write_private(path, &content)
            .map_err(|e| fail(format!("writing {}: {e}", path.display())))?;
        info!(instance = %change.instance(), path = %path.display(), "credential written");
        Ok(())
    }

    async fn from_connect(&self, change: &ChangeId) -> ProvisionResult<Result<String, String>> {
        let mut args = vec![
            "connect".to_string(),
            change.instance().to_string(),
            "--namespace".to_string(),
            change.namespace().to_string(),
            "--print".to_string(),
        ];
        if let Some(server) = &self.config.server {
            args.push("--server".to_string());
            args.push(server.clone());
        }
        let out = self.runner.run(&self.vcluster.command(args)).await?;
        if out.success() {
            Ok(Ok(out.stdout))
        } else {
            Ok(Err(out.diagnostic()))
        }
    }

    async fn from_secret(&self, change: &ChangeId) -> ProvisionResult<Result<String, String>> {
        let secret = format!("vc-{}", change.instance());
        let path = format!("jsonpath={{.data.{}}}", self.config.secret_key);
        let inv = self.parent.command([
            "get",
            "secret",
            secret.as_str(),
            "-n",
            change.namespace(),
            "-o",
            path.as_str(),
        ]);
        let out = self.runner.run(&inv).await?;
        if !out.success() {
            return Ok(Err(out.diagnostic()));
        }
        let decoded = match STANDARD.decode(out.stdout.trim()) {
            Ok(bytes) => bytes,
            Err(e) => return Ok(Err(format!("secret {secret} is not base64: {e}"))),
        };
        let text = match String::from_utf8(decoded) {
            Ok(text) => text,
            Err(_) => return Ok(Err(format!("secret {secret} is not UTF-8"))),
        };
        Ok(Ok(match &self.config.server {
            Some(server) => rewrite_server(&text, server),
            None => text,
        }))
    }
}

/// Replace every `server:` entry with `server`, keeping indentation.
pub fn rewrite_server(kubeconfig: &str, server: &str) -> String {
    let mut out = String::with_capacity(kubeconfig.len());
    for line in kubeconfig.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("server:") {
            if !rest.is_empty() && !rest.starts_with(' ') {
                out.push_str(line);
            } else {
                let indent = &line[..line.len() - trimmed.len()];
                out.push_str(&format!("{indent}server: {server}"));
            }
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

/// Write `content` to `path` readable by the owner only, creating parents.
fn write_private(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(content.as_bytes())?;

    // `mode` only applies on creation; tighten files left by older runs.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
