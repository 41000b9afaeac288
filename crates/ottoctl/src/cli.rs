//! CLI - Command-line argument parsing
//!
//! Defines the CLI structure using clap. Keeps argument parsing separate
//! from execution logic.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Otto CLI
#[derive(Parser)]
#[command(name = "ottoctl")]
#[command(about = "Otto - Desktop automation plans under explicit safety controls", long_about = None)]
#[command(version)]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    /// Config directory (defaults to $OTTO_CONFIG_DIR or ./config)
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Data directory (defaults to $OTTO_DATA_DIR or ./data)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List plan templates with signature and risk summary
    Templates {
        /// Template directory
        #[arg(default_value = "./plans")]
        dir: PathBuf,
    },

    /// Statically validate a plan file
    Validate {
        file: PathBuf,
    },

    /// Run a plan file in the foreground
    Run {
        file: PathBuf,

        /// Approve risky manifests and HITL steps without prompting
        #[arg(long)]
        auto_approve: bool,

        /// Variable overrides, `--var key=value` (repeatable)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Role used when auto-approving HITL steps
        #[arg(long)]
        role: Option<String>,
    },

    /// List recorded runs
    List {
        /// Filter by state (QUEUED, RUNNING, COMPLETED, FAILED, ...)
        #[arg(long)]
        state: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one run with its first-error card
    Show {
        run_id: i64,
    },

    /// Sign a plan file in place
    Sign {
        file: PathBuf,

        #[arg(long)]
        key_id: String,

        /// Path to the 32-byte hex signing key
        #[arg(long)]
        key: PathBuf,
    },

    /// Policy tooling
    Policy {
        #[command(subcommand)]
        action: PolicyCommands,
    },
}

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// Dry-run the policy gate against a plan file
    Test {
        file: PathBuf,
    },
}
