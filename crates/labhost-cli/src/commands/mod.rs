//! Subcommand implementations.

pub mod host;
pub mod rpc;
