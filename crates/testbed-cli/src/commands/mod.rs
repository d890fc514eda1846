pub mod deploy;
pub mod detect;
pub mod provision;
pub mod run;
pub mod teardown;

use std::future::Future;

use anyhow::Context;

use testbed_core::{ChangeId, SshTarget, TestbedConfig, UnitSet};
use testbed_tunnel::Tunnel;

/// Environment variable carrying the credential path between CI steps.
pub const KUBECONFIG_ENV: &str = "TESTBED_KUBECONFIG";

/// Parse a comma-separated unit list. Blank entries are ignored.
pub fn parse_units(raw: &str) -> UnitSet {
    raw.split(',')
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .collect()
}

pub fn change_id(raw: &str, config: &TestbedConfig) -> anyhow::Result<ChangeId> {
    ChangeId::parse(raw, &config.naming).with_context(|| format!("invalid change identifier `{raw}`"))
}

/// Open the configured tunnel, if any, and wait for it to accept connections.
pub async fn open_tunnel(config: &TestbedConfig) -> anyhow::Result<Option<Tunnel>> {
    let Some((ssh, tunnel)) = config
        .ssh
        .as_ref()
        .and_then(|ssh| ssh.tunnel.as_ref().map(|t| (ssh, t)))
    else {
        return Ok(None);
    };
    let tunnel = Tunnel::open(&SshTarget::from_config(ssh), tunnel).context("opening tunnel")?;
    tunnel
        .wait_ready()
        .await
        .context("parent control plane unreachable through tunnel")?;
    Ok(Some(tunnel))
}

/// Run `work` with the configured tunnel open; it is closed afterwards
/// whatever the outcome.
pub async fn tunneled<T, F>(config: &TestbedConfig, work: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let tunnel = open_tunnel(config).await?;
    let result = work.await;
    if let Some(tunnel) = tunnel {
        tunnel.close().await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units_are_trimmed_and_deduplicated() {
        let units = parse_units(" api, web,,api ");
        assert_eq!(units.len(), 2);
        assert!(units.contains("api"));
        assert!(units.contains("web"));
        assert!(parse_units("").is_empty());
    }
}
