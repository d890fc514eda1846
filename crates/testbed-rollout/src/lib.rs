//! testbed-rollout — deploy affected units and gate on their rollouts.
//!
//! # Components
//!
//! - **`manifest`**: unit name to manifest file, directory or kustomization
//! - **`controller`**: apply every unit, then wait on each rollout target

pub mod controller;
pub mod error;
pub mod manifest;

pub use controller::{DeployReport, Deployer, UnitPhase, rollout_targets};
pub use error::{RolloutError, RolloutResult};
pub use manifest::{Manifest, ManifestIndex, ManifestKind};
