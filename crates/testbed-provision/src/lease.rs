//! Per-identifier lease.
//!
//! Two runs for the same change identifier would otherwise race on the same
//! namespace and instance. A `coordination.k8s.io/v1` Lease inside the
//! namespace serializes them: `kubectl create` is atomic, and taking over an
//! expired lease goes through `kubectl replace` with the observed
//! `resourceVersion`, so a concurrent takeover fails with a conflict.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use testbed_core::kube::is_already_exists;
use testbed_core::{CommandRunner, Kubectl, LEASE_NAME};

/// Outcome of a failed acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    /// Another live holder owns the lease.
    Held { holder: String, renewed: String },
    /// The lease could not be created or read.
    Unavailable(String),
}

/// Proof that this run holds the lease. Release it when the run ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGuard {
    namespace: String,
    holder: String,
}

impl LeaseGuard {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Delete the lease. Failures are returned for the caller to log.
    pub async fn release<R: CommandRunner + ?Sized>(
        self,
        runner: &R,
        kubectl: &Kubectl,
    ) -> Result<(), String> {
        let inv = kubectl.command([
            "delete",
            "lease",
            LEASE_NAME,
            "-n",
            self.namespace.as_str(),
            "--ignore-not-found",
        ]);
        match runner.run(&inv).await {
            Ok(out) if out.success() => {
                info!(namespace = %self.namespace, holder = %self.holder, "lease released");
                Ok(())
            }
            Ok(out) => Err(out.diagnostic()),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseObject {
    metadata: LeaseMeta,
    #[serde(default)]
    spec: LeaseSpec,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseMeta {
    #[serde(default)]
    resource_version: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseSpec {
    holder_identity: Option<String>,
    lease_duration_seconds: Option<i64>,
    renew_time: Option<String>,
}

/// Acquires leases on the parent cluster for one holder identity.
pub struct Leaser<'a, R: ?Sized> {
    runner: &'a R,
    kubectl: &'a Kubectl,
    holder: String,
    ttl_secs: u64,
}

impl<'a, R: CommandRunner + ?Sized> Leaser<'a, R> {
    pub fn new(runner: &'a R, kubectl: &'a Kubectl, holder: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            runner,
            kubectl,
            holder: holder.into(),
            ttl_secs,
        }
    }

    fn manifest(&self, namespace: &str, now: DateTime<Utc>, resource_version: Option<&str>) -> String {
        let stamp = now.to_rfc3339_opts(SecondsFormat::Micros, true);
        let mut lease = json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": { "name": LEASE_NAME, "namespace": namespace },
            "spec": {
                "holderIdentity": self.holder,
                "leaseDurationSeconds": self.ttl_secs,
                "acquireTime": stamp,
                "renewTime": stamp,
            }
        });
        if let Some(rv) = resource_version {
            lease["metadata"]["resourceVersion"] = json!(rv);
        }
        lease.to_string()
    }

    /// Acquire the lease for `namespace`, taking over an expired one.
    pub async fn acquire(&self, namespace: &str) -> Result<LeaseGuard, LeaseError> {
        let now = Utc::now();
        let create = self
            .kubectl
            .command(["create", "-f", "-", "-o", "name"])
            .stdin(self.manifest(namespace, now, None));
        let out = self
            .runner
            .run(&create)
            .await
            .map_err(|e| LeaseError::Unavailable(e.to_string()))?;
        if out.success() {
            info!(%namespace, holder = %self.holder, "lease acquired");
            return Ok(self.guard(namespace));
        }
        if !is_already_exists(&out.stderr) {
            return Err(LeaseError::Unavailable(out.diagnostic()));
        }

        let current = self.read(namespace).await?;
        let holder = current.spec.holder_identity.clone().unwrap_or_default();
        let renewed = current.spec.renew_time.clone().unwrap_or_default();

        if holder != self.holder && !is_expired(&current.spec, now) {
            return Err(LeaseError::Held { holder, renewed });
        }

        debug!(%namespace, previous = %holder, "taking over lease");
        let replace = self
            .kubectl
            .command(["replace", "-f", "-", "-o", "name"])
            .stdin(self.manifest(namespace, now, current.metadata.resource_version.as_deref()));
        let out = self
            .runner
            .run(&replace)
            .await
            .map_err(|e| LeaseError::Unavailable(e.to_string()))?;
        if out.success() {
            info!(%namespace, holder = %self.holder, previous = %holder, "lease taken over");
            Ok(self.guard(namespace))
        } else if out.stderr.contains("Conflict") {
            // Someone else took it over between our read and replace.
            Err(LeaseError::Held { holder, renewed })
        } else {
            Err(LeaseError::Unavailable(out.diagnostic()))
        }
    }

    async fn read(&self, namespace: &str) -> Result<LeaseObject, LeaseError> {
        let inv = self
            .kubectl
            .command(["get", "lease", LEASE_NAME, "-n", namespace, "-o", "json"]);
        let out = self
            .runner
            .run(&inv)
            .await
            .map_err(|e| LeaseError::Unavailable(e.to_string()))?;
        if !out.success() {
            return Err(LeaseError::Unavailable(out.diagnostic()));
        }
        serde_json::from_str(&out.stdout)
            .map_err(|e| LeaseError::Unavailable(format!("unreadable lease: {e}")))
    }

    fn guard(&self, namespace: &str) -> LeaseGuard {
        LeaseGuard {
            namespace: namespace.to_string(),
            holder: self.holder.clone(),
        }
    }
}

/// A lease without a parseable renew time counts as expired.
fn is_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    let Some(renewed) = spec
        .renew_time
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
    else {
        return true;
    };
    let ttl = chrono::Duration::seconds(spec.lease_duration_seconds.unwrap_or(0));
    renewed.with_timezone(&Utc) + ttl < now
}

/// Identity recorded in leases: `<host>-<pid>`.
pub fn default_holder() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "testbed".to_string());
    format!("{host}-{}", std::process::id())
}
