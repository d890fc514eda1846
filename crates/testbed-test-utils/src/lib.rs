//! Testing utilities for the testbed workspace.
//!
//! - [`ScriptedRunner`]: canned replies keyed by argv patterns, with a call log.
//! - [`FakeCluster`]: a stateful simulation of the parent cluster, the
//!   `vcluster` CLI, and the virtual cluster's API.

pub mod cluster;
pub mod scripted;

pub use cluster::{ClusterState, FAKE_KUBECONFIG, FakeCluster, FakeInstance};
pub use scripted::ScriptedRunner;
