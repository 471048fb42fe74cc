//! Command line interface module
//!
//! Argument parsing and the runner that wires configuration, registry clients,
//! the checkpoint store and the replicator together for each command.

pub mod args;
pub mod runner;

pub use args::{Args, CheckpointAction, Command};
pub use runner::Runner;
