//! testbed-detect — which deployable units does a change touch?
//!
//! Compares a working revision against a target branch (through the
//! nearest common ancestor when history allows) and maps changed paths
//! under the manifest directory to unit names. An empty result means
//! "nothing to deploy", not an error.

pub mod detector;
pub mod error;
pub mod matcher;

pub use detector::{ChangeDetector, Detection};
pub use error::DetectError;
pub use matcher::UnitMatcher;
