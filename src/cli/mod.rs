//! CLI module for infra-converge.
//!
//! This module provides the command-line interface for converging and
//! inspecting cluster infrastructure.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, RefreshCommands, TagCommands};
pub use output::OutputFormatter;
