//! testbed-provision — isolated virtual-cluster environments per change.
//!
//! # Components
//!
//! - **`provisioner`**: the ordered provisioning pipeline
//! - **`network`**, **`namespace`**, **`lease`**, **`instance`**,
//!   **`credential`**, **`storage`**: one step each
//! - **`teardown`**: idempotent removal of an environment
//! - **`report`**: what a run did, including degraded steps

pub mod credential;
pub mod error;
pub mod instance;
pub mod lease;
pub mod namespace;
pub mod network;
pub mod provisioner;
pub mod report;
pub mod storage;
pub mod teardown;

pub use error::{ProvisionError, ProvisionResult};
pub use lease::{LeaseError, LeaseGuard, Leaser};
pub use provisioner::Provisioner;
pub use report::{ProvisionReport, StorageOutcome, Warnings};
pub use teardown::{Teardown, TeardownReport};
