//! Environment provisioning pipeline.

use std::time::Duration;

use tracing::{info, warn};

use testbed_core::{ChangeId, CommandRunner, Kubectl, SshTarget, TestbedConfig, VclusterCli};
use testbed_health::{Poller, ReadinessProbe};

use crate::credential::CredentialExtractor;
use crate::error::{ProvisionError, ProvisionResult};
use crate::instance;
use crate::lease::{LeaseError, LeaseGuard, Leaser, default_holder};
use crate::namespace::ensure_namespace;
use crate::network::NetworkPrep;
use crate::report::{ProvisionReport, StorageOutcome, Warnings};
use crate::storage::StorageSync;

/// Brings the environment of one change identifier to a ready state.
///
/// Steps run strictly in order: reachability, network, namespace, lease,
/// virtual cluster, credential, readiness, storage. Only reachability, lease
/// contention, instance creation and credential extraction abort the run.
pub struct Provisioner<'a, R: ?Sized> {
    runner: &'a R,
    config: &'a TestbedConfig,
    parent: Kubectl,
    vcluster: VclusterCli,
    holder: String,
}

impl<'a, R: CommandRunner + ?Sized> Provisioner<'a, R> {
    pub fn new(runner: &'a R, config: &'a TestbedConfig) -> Self {
        Self {
            runner,
            config,
            parent: Kubectl::parent(&config.cluster),
            vcluster: VclusterCli::new(&config.cluster),
            holder: default_holder(),
        }
    }

    /// Override the identity recorded in the lease.
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.cluster.request_timeout_secs)
    }

    pub async fn provision(&self, change: &ChangeId) -> ProvisionResult<ProvisionReport> {
        info!(change = %change, namespace = %change.namespace(), instance = %change.instance(), "provisioning environment");
        let mut warnings = Warnings::default();

        self.check_reachable().await?;

        NetworkPrep::new(self.runner, &self.parent, &self.config.network)
            .on_host(self.config.ssh.as_ref().map(SshTarget::from_config))
            .apply(&mut warnings)
            .await;

        ensure_namespace(self.runner, &self.parent, change, &mut warnings).await;

        let lease = self.acquire_lease(change, &mut warnings).await?;

        let (ready, storage) = match self.reconcile(change, &mut warnings).await {
            Ok(done) => done,
            Err(e) => {
                if let Some(guard) = lease {
                    self.release_guard(guard, &mut warnings).await;
                }
                return Err(e);
            }
        };

        info!(
            change = %change,
            ready,
            warnings = warnings.len(),
            credential = %change.credential_path().display(),
            "environment provisioned"
        );
        Ok(ProvisionReport {
            change_id: change.as_str().to_string(),
            namespace: change.namespace().to_string(),
            instance: change.instance().to_string(),
            credential_path: change.credential_path().clone(),
            ready,
            storage,
            warnings,
            lease,
        })
    }

    /// Release the lease held by `report`, if any. Failures become warnings.
    pub async fn release(&self, report: &mut ProvisionReport) {
        if let Some(guard) = report.lease.take() {
            self.release_guard(guard, &mut report.warnings).await;
        }
    }

    async fn release_guard(&self, guard: LeaseGuard, warnings: &mut Warnings) {
        let namespace = guard.namespace().to_string();
        if let Err(e) = guard.release(self.runner, &self.parent).await {
            warnings.push("lease", format!("release in {namespace} failed: {e}"));
        }
    }

    async fn check_reachable(&self) -> ProvisionResult<()> {
        let inv = self.parent.bounded(["version"], self.request_timeout());
        match self.runner.run(&inv).await {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(ProvisionError::Unreachable(out.diagnostic())),
            Err(e) => Err(ProvisionError::Unreachable(e.to_string())),
        }
    }

    async fn acquire_lease(
        &self,
        change: &ChangeId,
        warnings: &mut Warnings,
    ) -> ProvisionResult<Option<LeaseGuard>> {
        if !self.config.lease.enabled {
            return Ok(None);
        }
        let leaser = Leaser::new(self.runner, &self.parent, self.holder.as_str(), self.config.lease.ttl_secs);
        match leaser.acquire(change.namespace()).await {
            Ok(guard) => Ok(Some(guard)),
            Err(LeaseError::Held { holder, renewed }) => Err(ProvisionError::LeaseHeld {
                namespace: change.namespace().to_string(),
                holder,
                renewed,
            }),
            Err(LeaseError::Unavailable(message)) => {
                warnings.push("lease", format!("continuing without lease: {message}"));
                Ok(None)
            }
        }
    }

    /// Instance, credential, readiness and storage.
    async fn reconcile(
        &self,
        change: &ChangeId,
        warnings: &mut Warnings,
    ) -> ProvisionResult<(bool, Option<StorageOutcome>)> {
        instance::create_or_upgrade(self.runner, &self.vcluster, &self.config.vcluster, change).await?;

        CredentialExtractor::new(self.runner, &self.parent, &self.vcluster, &self.config.vcluster)
            .extract(change)
            .await?;

        let poller = Poller::new(
            self.config.readiness.retries,
            Duration::from_secs(self.config.readiness.interval_secs),
        );
        let ready = ReadinessProbe::new(
            self.runner,
            &self.config.cluster,
            change.credential_path(),
            self.request_timeout(),
        )
        .wait_ready(&poller)
        .await
        .is_ready();
        if !ready {
            warnings.push(
                "readiness",
                format!("{} not ready after {} probes", change.instance(), poller.retries()),
            );
        }

        let storage = if self.config.storage.enabled {
            let inner = Kubectl::with_credential(&self.config.cluster, change.credential_path());
            StorageSync::new(self.runner, &inner, &self.config.storage, change.instance())
                .sync(warnings)
                .await
        } else {
            None
        };
        if storage.as_ref().is_some_and(|s| !s.claim_bound) {
            warn!(instance = %change.instance(), "shared claim is not bound; stateful units may not start");
        }

        Ok((ready, storage))
    }
}
