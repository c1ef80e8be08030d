//! CLI argument model for the mimic bot binary.

pub mod cli_args;

pub use cli_args::{Cli, CliCommand, ProbeArgs};
