//! assetflow - a task-graph build orchestrator for static-site assets
//!
//! This crate provides both a CLI tool and a library for asset builds.
//!
//! # Features
//!
//! - **Named tasks with dependencies** - validated once into an index-based graph
//! - **Layered parallel execution** - independent tasks run concurrently
//! - **Failure isolation** - a failed task skips its dependents, nothing else
//! - **Composable pipelines** - concat, wrap, rename, external programs, Rhai scripts
//! - **File watching** - debounced, serialized re-runs of bound tasks
//! - **Compressed/uncompressed builds** - one flag switches every pipeline
//!
//! # Example
//!
//! ```toml
//! # assetflow.toml
//!
//! [tasks."scripts:critical"]
//! src = "./src/scripts/critical/**/*.js"
//! output = "./_includes"
//! steps = [
//!   { concat = { file = "criticalJS.js" } },
//!   { exec = { program = "uglifyjs" }, only = "compressed" },
//!   { wrap = { header = "<script>", footer = "</script>" } },
//!   { rename = { basename = "criticalJS", extname = ".html" } },
//! ]
//!
//! [tasks.default]
//! depends = ["scripts:critical"]
//! ```
//!
//! # Library Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use assetflow::{noop, Scheduler, SchedulerOptions, TaskRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut registry = TaskRegistry::new();
//!     registry.register("lint", Vec::<String>::new(), noop())?;
//!     registry.register("bundle", ["lint"], noop())?;
//!
//!     let scheduler = Scheduler::new(Arc::new(registry), SchedulerOptions::default());
//!     let report = scheduler.run(&["bundle"]).await?;
//!     assert!(report.success());
//!
//!     Ok(())
//! }
//! ```

pub mod build;
pub mod config;
pub mod debounce;
pub mod error;
pub mod graph;
pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod script;
pub mod steps;
pub mod watch;

// Re-export main types
pub use build::{register_config, watch_bindings, BuildContext, PipelineTask};
pub use config::Config;
pub use debounce::{Debouncer, TimerState};
pub use error::{FlowError, Result};
pub use graph::DependencyGraph;
pub use pipeline::{Artifact, Mode, Pipeline, PipelineBuilder, Step, StepError};
pub use registry::{noop, Action, Task, TaskId, TaskRegistry, TaskStatus};
pub use scheduler::{ExecutionResult, RunReport, Scheduler, SchedulerOptions};
pub use script::ScriptStep;
pub use watch::{WatchBinding, WatchManager, WatchOptions, WatchSummary};
