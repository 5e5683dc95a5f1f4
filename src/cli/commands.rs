//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// infra-converge - Idempotent convergence of cluster infrastructure.
#[derive(Parser, Debug)]
#[command(name = "infra-converge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "INFRA_CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the configuration.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Report drift between the configuration and the provider.
    Plan,

    /// Converge provider resources to the configuration.
    Reconcile {
        /// Only reconcile this machine pool.
        #[arg(long)]
        pool: Option<String>,
    },

    /// Delete every managed resource.
    Delete {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Instance refresh commands.
    Refresh {
        /// Refresh subcommand.
        #[command(subcommand)]
        command: RefreshCommands,
    },

    /// Register an instance with the API-server load balancer.
    Register {
        /// Instance id.
        instance_id: String,
    },

    /// Deregister an instance from the API-server load balancer.
    Deregister {
        /// Instance id.
        instance_id: String,
    },

    /// Delete launch template versions outside the retention set.
    Prune {
        /// Launch template name.
        template: String,
    },

    /// Tag commands.
    Tags {
        /// Tags subcommand.
        #[command(subcommand)]
        command: TagCommands,
    },
}

/// Instance refresh subcommands.
#[derive(Subcommand, Debug)]
pub enum RefreshCommands {
    /// Show the refresh state of a machine pool.
    Status {
        /// Machine pool name.
        pool: String,
    },
}

/// Tag subcommands.
#[derive(Subcommand, Debug)]
pub enum TagCommands {
    /// Show the tag changes a resource needs.
    Diff {
        /// Provider resource id.
        resource_id: String,

        /// Desired role tag value.
        #[arg(long)]
        role: String,

        /// Desired Name tag value (defaults to the resource id).
        #[arg(long)]
        name: Option<String>,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable log lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reconcile_pool() {
        let cli = Cli::try_parse_from(["infra-converge", "reconcile", "--pool", "pool-a"])
            .expect("parse");
        assert!(matches!(
            cli.command,
            Commands::Reconcile { pool: Some(ref p) } if p == "pool-a"
        ));
    }

    #[test]
    fn test_parse_global_flags() {
        let cli = Cli::try_parse_from([
            "infra-converge",
            "refresh",
            "status",
            "pool-a",
            "--output",
            "json",
            "--log-format",
            "json",
            "-v",
        ])
        .expect("parse");
        assert!(cli.verbose);
        assert!(matches!(cli.output, OutputFormat::Json));
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn test_tags_diff_requires_role() {
        assert!(Cli::try_parse_from(["infra-converge", "tags", "diff", "lt-1"]).is_err());
    }
}
