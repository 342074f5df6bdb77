//! Error types for assetflow
//!
//! Uses `miette` for pretty error reporting with codes and help text.
//! Structural errors (`DuplicateTask`, `InvalidDefinition`, `UnknownTask`,
//! `CyclicDependency`) abort a run before any action starts. Action failures
//! are scoped to one task and its dependents and end up in the run report.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for assetflow operations
#[derive(Error, Diagnostic, Debug)]
pub enum FlowError {
    #[error("Configuration file not found")]
    #[diagnostic(
        code(assetflow::config::not_found),
        help("Create an assetflow.toml in your project root (`assetflow init`), or pass --config")
    )]
    ConfigNotFound { searched: Vec<PathBuf> },

    #[error("Failed to parse configuration {}", .path.display())]
    #[diagnostic(code(assetflow::config::parse))]
    ConfigParse {
        #[source]
        source: toml::de::Error,
        path: PathBuf,
    },

    #[error("Invalid configuration: {reason}")]
    #[diagnostic(code(assetflow::config::invalid))]
    InvalidConfig { reason: String },

    #[error("Task '{name}' is already registered")]
    #[diagnostic(code(assetflow::task::duplicate))]
    DuplicateTask { name: String },

    #[error("Invalid definition for task '{task}': {reason}")]
    #[diagnostic(code(assetflow::task::invalid))]
    InvalidDefinition { task: String, reason: String },

    #[error("Task '{name}' not found")]
    #[diagnostic(
        code(assetflow::task::not_found),
        help("Run `assetflow list` to see available tasks")
    )]
    UnknownTask {
        name: String,
        available: Vec<String>,
    },

    #[error("Circular dependency detected: {}", .cycle.join(" -> "))]
    #[diagnostic(
        code(assetflow::task::cycle),
        help("Check the 'depends' field in your task definitions")
    )]
    CyclicDependency { cycle: Vec<String> },

    #[error("Task '{task}' failed: {reason}")]
    #[diagnostic(code(assetflow::task::action))]
    TaskAction { task: String, reason: String },

    #[error("{failed} task(s) failed, {skipped} skipped")]
    #[diagnostic(code(assetflow::run::failed))]
    TasksFailed { failed: usize, skipped: usize },

    #[error("Invalid glob pattern '{pattern}'")]
    #[diagnostic(code(assetflow::glob))]
    Glob {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("I/O error")]
    #[diagnostic(code(assetflow::io))]
    Io(#[from] std::io::Error),

    #[error("Watch error")]
    #[diagnostic(code(assetflow::watch))]
    Watch {
        #[source]
        source: notify::Error,
    },
}

impl FlowError {
    /// Whether this error is raised before any task action runs
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            FlowError::DuplicateTask { .. }
                | FlowError::InvalidDefinition { .. }
                | FlowError::UnknownTask { .. }
                | FlowError::CyclicDependency { .. }
        )
    }
}

/// Result type alias for assetflow operations
pub type Result<T> = std::result::Result<T, FlowError>;
