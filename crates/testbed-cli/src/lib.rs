//! testbed-cli — the `testbed` binary's commands, usable as a library so
//! the whole pipeline can run against a simulated cluster.

pub mod commands;
