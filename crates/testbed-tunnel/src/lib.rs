//! testbed-tunnel — the one long-lived background connection of a run.
//!
//! An SSH local port forward to the parent cluster's API server, owned by
//! the run that opened it and stopped when the run ends.

pub mod error;
pub mod tunnel;

pub use error::{TunnelError, TunnelResult};
pub use tunnel::{Tunnel, forward_invocation};
