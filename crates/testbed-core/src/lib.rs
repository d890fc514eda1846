//! testbed-core — shared configuration, naming, and command execution.

pub mod config;
pub mod error;
pub mod exec;
pub mod kube;
pub mod types;

pub use config::TestbedConfig;
pub use error::{ChangeIdError, ConfigError, ExecError};
pub use exec::{CommandOutput, CommandRunner, Invocation, ProcessRunner, SshRunner, SshTarget};
pub use kube::{Kubectl, VclusterCli};
pub use types::*;
