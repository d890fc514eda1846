//! Change identifiers and affected-unit sets.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::NamingConfig;
use crate::error::ChangeIdError;

/// Kubernetes object names (namespaces, helm releases) are DNS labels.
const MAX_NAME_LEN: usize = 63;

/// Name of the lease object guarding one environment.
pub const LEASE_NAME: &str = "testbed-lock";

/// Label attached to every namespace the provisioner creates.
pub const CHANGE_ID_LABEL: &str = "testbed.io/change-id";

/// Identifies one ephemeral environment. All resource names derive from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeId {
    id: String,
    namespace: String,
    instance: String,
    credential_path: PathBuf,
}

impl ChangeId {
    /// Normalize `raw` into a DNS-label-safe token and derive resource names.
    ///
    /// `PR #42` becomes `pr-42`; anything that normalizes to an empty string
    /// is rejected.
    pub fn parse(raw: &str, naming: &NamingConfig) -> Result<Self, ChangeIdError> {
        let id = normalize(raw);
        if id.is_empty() {
            return Err(ChangeIdError::Empty(raw.to_string()));
        }

        let namespace = format!("{}{}", naming.namespace_prefix, id);
        let instance = format!("{}{}", naming.instance_prefix, id);
        for name in [&namespace, &instance] {
            if name.len() > MAX_NAME_LEN {
                return Err(ChangeIdError::TooLong { name: name.clone() });
            }
        }

        let credential_path = naming
            .credential_dir
            .join(format!("kubeconfig-{instance}.yaml"));

        Ok(Self {
            id,
            namespace,
            instance,
            credential_path,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    /// Namespace on the parent cluster hosting the virtual cluster.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Virtual-cluster instance (release) name.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn credential_path(&self) -> &PathBuf {
        &self.credential_path
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

fn normalize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = false;
    for c in raw.trim().chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Distinct deployable-unit names. Semantically unordered; iteration is
/// sorted so logs and rollout order are stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitSet(BTreeSet<String>);

impl UnitSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the unit was already present.
    pub fn insert(&mut self, unit: impl Into<String>) -> bool {
        self.0.insert(unit.into())
    }

    pub fn contains(&self, unit: &str) -> bool {
        self.0.contains(unit)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for UnitSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for UnitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for unit in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            f.write_str(unit)?;
            first = false;
        }
        Ok(())
    }
}
