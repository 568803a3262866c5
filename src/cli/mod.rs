//! Command-line interface for image-forge.
//!
//! Provides commands for running generation jobs, verifying and archiving
//! the record log, and querying or rebuilding the record index.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
