//! Provisioning error types.
//!
//! Only fatal conditions are errors. Everything best-effort is reported
//! through [`crate::report::Warnings`] instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("parent control plane unreachable: {0}")]
    Unreachable(String),

    #[error("environment {namespace} is leased by {holder} (renewed {renewed})")]
    LeaseHeld {
        namespace: String,
        holder: String,
        renewed: String,
    },

    #[error("failed to create or upgrade virtual cluster {instance}: {message}")]
    InstanceCreate { instance: String, message: String },

    #[error("failed to extract credential for {instance}: {message}")]
    Credential { instance: String, message: String },

    #[error("teardown of {target} failed: {message}")]
    Teardown { target: String, message: String },

    #[error(transparent)]
    Exec(#[from] testbed_core::ExecError),
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;
