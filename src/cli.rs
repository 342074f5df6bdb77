//! CLI command definitions and handling
//!
//! Uses `clap` derive API for argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// assetflow - dependency-ordered asset builds with file watching
#[derive(Parser, Debug)]
#[command(name = "assetflow")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to assetflow.toml config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Skip minification steps
    #[arg(short, long, global = true, env = "ASSETFLOW_UNCOMPRESSED")]
    pub uncompressed: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Working directory
    #[arg(long, global = true)]
    pub cwd: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Tasks to run (shorthand for `assetflow run <task>...`)
    #[arg(trailing_var_arg = true)]
    pub task: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run tasks and everything they depend on
    Run {
        /// Tasks to run
        #[arg(default_value = "default")]
        tasks: Vec<String>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,

        /// Max tasks running at once (0 = unbounded)
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
    },

    /// Watch sources and re-run the bound tasks on change
    Watch {
        /// Run every bound task once before watching
        #[arg(long)]
        initial: bool,
    },

    /// List tasks in registration order
    List {
        /// Show task dependencies
        #[arg(long)]
        deps: bool,
    },

    /// Validate assetflow.toml and every task's dependency graph
    Check,

    /// Write a starter assetflow.toml
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    /// Get the effective command, treating bare task names as `run <task>...`
    pub fn effective_command(&self) -> EffectiveCommand<'_> {
        if let Some(cmd) = &self.command {
            EffectiveCommand::Subcommand(cmd)
        } else if !self.task.is_empty() {
            EffectiveCommand::RunTasks(&self.task)
        } else {
            EffectiveCommand::Default
        }
    }
}

pub enum EffectiveCommand<'a> {
    Subcommand(&'a Commands),
    RunTasks(&'a [String]),
    /// No arguments: run the `default` task
    Default,
}
