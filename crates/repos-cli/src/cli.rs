//! Command line definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::trace::LogLevel;

#[derive(Parser, Debug)]
#[command(name = "repos")]
#[command(about = "Build orchestrator for monolithic repositories")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Working directory.
    #[arg(short = 'C', value_name = "DIR", global = true)]
    pub chdir: Option<PathBuf>,

    /// Plain text output, no colour or animated display.
    #[arg(long, visible_alias = "no-color", global = true)]
    pub script: bool,

    /// Diagnostic log level.
    #[arg(short = 'l', long, global = true, default_value = "warn", value_enum)]
    pub level: LogLevel,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List all projects.
    #[command(visible_alias = "p")]
    Projects,

    /// List targets, or those matching the given patterns.
    ///
    /// A pattern is PROJECT-PATTERN:TARGET-PATTERN or TARGET-PATTERN.
    /// Both sides support `*`, `?`, `[...]`, `[^...]` and `\` escapes. An
    /// empty project pattern means the current project. A bare literal
    /// target name must match a single target; use `*:NAME` to match
    /// across projects.
    #[command(visible_alias = "t")]
    Targets {
        #[arg(value_name = "PATTERN")]
        patterns: Vec<String>,
    },

    /// Check consistency of all projects and targets.
    Check,

    /// Print the last result and outputs of a target.
    #[command(visible_alias = "st")]
    Status {
        #[arg(value_name = "TARGET")]
        target: String,
    },

    /// Print the last-run log of a target.
    Log {
        #[arg(value_name = "TARGET")]
        target: String,
    },

    /// Plan and execute matching targets.
    #[command(visible_alias = "b")]
    Build {
        /// Rebuild the listed targets even when up-to-date.
        #[arg(short, long)]
        force: bool,
        /// Do not echo task logs on failure.
        #[arg(short, long)]
        quiet: bool,
        #[arg(value_name = "TARGET", required = true)]
        targets: Vec<String>,
    },

    /// Build a target, then execute its primary output.
    #[command(visible_alias = "r")]
    Run {
        #[arg(value_name = "TARGET")]
        target: String,
        #[arg(
            value_name = "ARGS",
            trailing_var_arg = true,
            allow_hyphen_values = true
        )]
        args: Vec<String>,
    },
}
