//! Task scheduling
//!
//! Runs the closure of the requested tasks layer by layer. Tasks inside a
//! layer run concurrently; the next layer starts only once the whole layer
//! has resolved. A failure skips the failed task's dependents but leaves
//! unrelated branches running.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::{Serialize, Serializer};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::{FlowError, Result};
use crate::graph::DependencyGraph;
use crate::registry::{Task, TaskId, TaskRegistry, TaskStatus};

/// Outcome of one task in one run
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub name: String,
    pub status: TaskStatus,
    pub error: Option<String>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    pub started_at: Option<DateTime<Utc>>,
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl ExecutionResult {
    fn skipped(name: &str, failed_dependency: &str) -> Self {
        Self {
            name: name.to_string(),
            status: TaskStatus::Skipped,
            error: Some(format!("dependency '{}' failed", failed_dependency)),
            duration: Duration::ZERO,
            started_at: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }
}

/// Results of one `Scheduler::run`, ordered by layer then registration
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub results: Vec<ExecutionResult>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

impl RunReport {
    /// True when every task succeeded (also for an empty run)
    pub fn success(&self) -> bool {
        self.results.iter().all(ExecutionResult::is_success)
    }

    pub fn get(&self, name: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.name == name)
    }

    /// Task names in result order
    pub fn names(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn failed(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results.iter().filter(|r| r.status == TaskStatus::Failed)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results.iter().filter(|r| r.status == TaskStatus::Skipped)
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// One `TaskAction` error per failed task
    pub fn errors(&self) -> Vec<FlowError> {
        self.failed()
            .map(|r| FlowError::TaskAction {
                task: r.name.clone(),
                reason: r.error.clone().unwrap_or_default(),
            })
            .collect()
    }

    /// `Err(TasksFailed)` unless the run fully succeeded
    pub fn into_result(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(FlowError::TasksFailed {
                failed: self.failed().count(),
                skipped: self.skipped().count(),
            })
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Default)]
pub struct SchedulerOptions {
    /// Max tasks running at once inside a layer (0 = unbounded)
    pub concurrency: usize,
    /// Show a spinner per running task
    pub progress: bool,
}

/// Runs tasks from a registry in dependency order
pub struct Scheduler {
    registry: Arc<TaskRegistry>,
    options: SchedulerOptions,
    semaphore: Option<Arc<Semaphore>>,
}

enum Slot {
    Done(ExecutionResult),
    Running {
        id: TaskId,
        spawned: Instant,
        handle: JoinHandle<ExecutionResult>,
    },
}

impl Scheduler {
    pub fn new(registry: Arc<TaskRegistry>, options: SchedulerOptions) -> Self {
        let semaphore = match options.concurrency {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        Self {
            registry,
            options,
            semaphore,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Run the requested tasks and everything they depend on
    ///
    /// Structural problems (unknown task, cycle) fail before any action runs.
    /// Action failures are reported in the returned `RunReport`.
    pub async fn run<S: AsRef<str>>(&self, requested: &[S]) -> Result<RunReport> {
        if requested.is_empty() {
            return Ok(RunReport::default());
        }

        let graph = DependencyGraph::resolve(&self.registry, requested)?;
        let layers = graph.layers();
        let run_start = Instant::now();

        tracing::info!(
            requested = %requested.iter().map(|s| s.as_ref()).collect::<Vec<_>>().join(", "),
            tasks = graph.len(),
            layers = layers.len(),
            "starting run"
        );

        for id in graph.tasks() {
            self.registry.task(id).set_status(TaskStatus::Pending);
        }

        let multi_progress = MultiProgress::new();
        if !self.options.progress {
            multi_progress.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut results = Vec::with_capacity(graph.len());
        // Name of the failed task that keeps each unfinished task from running
        let mut blocked_by: HashMap<TaskId, String> = HashMap::new();

        for (depth, layer) in layers.iter().enumerate() {
            tracing::debug!(layer = depth, tasks = layer.len(), "starting layer");
            let mut slots = Vec::with_capacity(layer.len());

            for &id in layer {
                let task = self.registry.task(id);
                let blocker = graph
                    .dependencies(id)
                    .into_iter()
                    .find_map(|dep| blocked_by.get(&dep).cloned());

                match blocker {
                    Some(root) => {
                        tracing::warn!(task = %task.name, failed = %root, "skipping task");
                        task.set_status(TaskStatus::Skipped);
                        slots.push(Slot::Done(ExecutionResult::skipped(&task.name, &root)));
                        blocked_by.insert(id, root);
                    }
                    None => slots.push(Slot::Running {
                        id,
                        spawned: Instant::now(),
                        handle: self.spawn(task, &multi_progress),
                    }),
                }
            }

            // Wait for the entire layer before moving on
            for slot in slots {
                let result = match slot {
                    Slot::Done(result) => result,
                    Slot::Running {
                        id,
                        spawned,
                        handle,
                    } => {
                        let task = self.registry.task(id);
                        let result = match handle.await {
                            Ok(result) => result,
                            Err(e) => ExecutionResult {
                                name: task.name.clone(),
                                status: TaskStatus::Failed,
                                error: Some(format!("task panicked: {}", e)),
                                duration: spawned.elapsed(),
                                started_at: None,
                            },
                        };
                        task.set_status(result.status);
                        if !result.is_success() {
                            blocked_by.insert(id, task.name.clone());
                        }
                        result
                    }
                };
                results.push(result);
            }
        }

        let report = RunReport {
            results,
            duration: run_start.elapsed(),
        };

        tracing::info!(
            succeeded = report.results.iter().filter(|r| r.is_success()).count(),
            failed = report.failed().count(),
            skipped = report.skipped().count(),
            "run finished"
        );

        Ok(report)
    }

    /// Spawn a single task's action
    fn spawn(&self, task: &Task, multi_progress: &MultiProgress) -> JoinHandle<ExecutionResult> {
        let id = task.id;
        let name = task.name.clone();
        let action = task.action();
        let registry = Arc::clone(&self.registry);
        let semaphore = self.semaphore.clone();

        let pb = multi_progress.add(ProgressBar::new_spinner());
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("Running {}", name));

        tokio::spawn(async move {
            let _permit = match semaphore {
                Some(sem) => Some(sem.acquire_owned().await),
                None => None,
            };

            registry.task(id).set_status(TaskStatus::Running);
            pb.enable_steady_tick(Duration::from_millis(100));
            tracing::debug!(task = %name, "task started");

            let started_at = Utc::now();
            let start = Instant::now();
            let outcome = action.call().await;
            let duration = start.elapsed();
            pb.finish_and_clear();

            match outcome {
                Ok(()) => {
                    tracing::debug!(task = %name, ms = duration.as_millis() as u64, "task succeeded");
                    ExecutionResult {
                        name,
                        status: TaskStatus::Succeeded,
                        error: None,
                        duration,
                        started_at: Some(started_at),
                    }
                }
                Err(e) => {
                    tracing::warn!(task = %name, error = %e, "task failed");
                    ExecutionResult {
                        name,
                        status: TaskStatus::Failed,
                        error: Some(e.to_string()),
                        duration,
                        started_at: Some(started_at),
                    }
                }
            }
        })
    }
}

/// Print one line per task result
pub fn print_results(report: &RunReport) {
    for result in &report.results {
        let status = match result.status {
            TaskStatus::Succeeded => style("✓").green(),
            TaskStatus::Skipped => style("-").yellow(),
            _ => style("✗").red(),
        };

        let duration = format!("{:.2}s", result.duration.as_secs_f64());

        println!(
            "{} {} {}",
            status,
            style(&result.name).bold(),
            style(duration).dim()
        );

        if let Some(error) = &result.error {
            let line = if result.status == TaskStatus::Skipped {
                style(format!("skipped: {}", error)).yellow()
            } else {
                style(error.clone()).red()
            };
            eprintln!("  {}", line);
        }
    }
}

/// Print execution summary
pub fn print_summary(report: &RunReport) {
    println!();

    let succeeded = report.results.iter().filter(|r| r.is_success()).count();
    let failed = report.failed().count();
    let skipped = report.skipped().count();

    if failed == 0 && skipped == 0 {
        println!(
            "{} {} tasks completed in {:.2}s",
            style("✓").green().bold(),
            succeeded,
            report.duration.as_secs_f64()
        );
    } else {
        println!(
            "{} {} succeeded, {} failed, {} skipped in {:.2}s",
            style("✗").red().bold(),
            succeeded,
            failed,
            skipped,
            report.duration.as_secs_f64()
        );
    }
}
