//! What a provisioning run did, including every degraded step.

use std::fmt;
use std::path::PathBuf;

use tracing::warn;

use crate::lease::LeaseGuard;

/// Degraded steps collected during a run. Each push is also logged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Warnings(Vec<String>);

impl Warnings {
    pub fn push(&mut self, step: &'static str, message: impl fmt::Display) {
        let message = message.to_string();
        warn!(step, %message, "continuing after degraded step");
        self.0.push(format!("{step}: {message}"));
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

    /// Whether any warning came from `step`.
    pub fn has_step(&self, step: &str) -> bool {
        self.0
            .iter()
            .any(|w| w.split_once(':').is_some_and(|(s, _)| s == step))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageOutcome {
    /// Storage classes found before any change.
    pub classes_found: usize,
    pub fallback_created: bool,
    pub default_class: Option<String>,
    pub claim_requested: bool,
    pub claim_bound: bool,
}

#[derive(Debug)]
pub struct ProvisionReport {
    pub change_id: String,
    pub namespace: String,
    pub instance: String,
    pub credential_path: PathBuf,
    pub ready: bool,
    /// `None` when storage sync is disabled or the instance could not be queried.
    pub storage: Option<StorageOutcome>,
    pub warnings: Warnings,
    /// Held until the caller releases it.
    pub lease: Option<LeaseGuard>,
}
