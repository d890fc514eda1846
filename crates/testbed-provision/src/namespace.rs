//! Namespace that hosts one environment's virtual cluster.

use tracing::{debug, info};

use testbed_core::kube::{is_already_exists, is_not_found};
use testbed_core::{CHANGE_ID_LABEL, ChangeId, CommandRunner, Kubectl};

use crate::report::Warnings;

const STEP: &str = "namespace";

/// Create the namespace if missing and label it with the change identifier.
/// Failures are recorded as warnings; instance creation reports the real
/// problem if the namespace is unusable.
pub async fn ensure_namespace<R: CommandRunner + ?Sized>(
    runner: &R,
    kubectl: &Kubectl,
    change: &ChangeId,
    warnings: &mut Warnings,
) {
    let ns = change.namespace();

    let get = kubectl.command(["get", "namespace", ns, "-o", "name"]);
    let exists = match runner.run(&get).await {
        Ok(out) if out.success() => true,
        Ok(out) if is_not_found(&out.stderr) => false,
        Ok(out) => {
            warnings.push(STEP, format!("lookup of {ns} failed: {}", out.diagnostic()));
            false
        }
        Err(e) => {
            warnings.push(STEP, format!("lookup of {ns} failed: {e}"));
            false
        }
    };

    if exists {
        debug!(namespace = %ns, "namespace exists");
    } else {
        let create = kubectl.command(["create", "namespace", ns]);
        match runner.run(&create).await {
            Ok(out) if out.success() => info!(namespace = %ns, "namespace created"),
            Ok(out) if is_already_exists(&out.stderr) => {
                debug!(namespace = %ns, "namespace created concurrently")
            }
            Ok(out) => warnings.push(STEP, format!("create {ns} failed: {}", out.diagnostic())),
            Err(e) => warnings.push(STEP, format!("create {ns} failed: {e}")),
        }
    }

    let label = format!("{CHANGE_ID_LABEL}={}", change.as_str());
    let inv = kubectl.command(["label", "namespace", ns, label.as_str(), "--overwrite"]);
    match runner.run(&inv).await {
        Ok(out) if out.success() => {}
        Ok(out) => warnings.push(STEP, format!("label {ns} failed: {}", out.diagnostic())),
        Err(e) => warnings.push(STEP, format!("label {ns} failed: {e}")),
    }
}
