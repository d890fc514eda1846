//! testbed-health — readiness checks for provisioned environments.
//!
//! # Components
//!
//! - **`poller`**: bounded, fixed-interval polling shared by every wait
//!   in the workflow
//! - **`checker`**: `/readyz` probes against a virtual cluster and a
//!   tracker of consecutive results

pub mod checker;
pub mod poller;

pub use checker::{ProbeResult, ProbeTracker, ReadinessProbe};
pub use poller::{PollOutcome, PollResult, Poller};
