//! Task registry
//!
//! Tasks live in an arena indexed by [`TaskId`], which doubles as the
//! registration order. Dependencies are stored by name and validated when a
//! run resolves its dependency graph, so tasks may reference tasks that are
//! registered later.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;

use crate::error::{FlowError, Result};
use crate::pipeline::StepError;

/// Index of a task in registration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub usize);

/// Lifecycle of a task within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum TaskStatus {
    Pending = 0,
    Running = 1,
    Succeeded = 2,
    Failed = 3,
    Skipped = 4,
}

impl TaskStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TaskStatus::Running,
            2 => TaskStatus::Succeeded,
            3 => TaskStatus::Failed,
            4 => TaskStatus::Skipped,
            _ => TaskStatus::Pending,
        }
    }

    /// Succeeded, Failed or Skipped
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// The work a task performs once its dependencies succeeded
///
/// The returned future must be `'static` so the scheduler can spawn it.
pub trait Action: Send + Sync {
    fn call(&self) -> BoxFuture<'static, std::result::Result<(), StepError>>;
}

impl<F, Fut> Action for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), StepError>> + Send + 'static,
{
    fn call(&self) -> BoxFuture<'static, std::result::Result<(), StepError>> {
        Box::pin(self())
    }
}

/// Action for tasks that only group their dependencies
pub fn noop() -> Arc<dyn Action> {
    Arc::new(|| async { Ok::<(), StepError>(()) })
}

/// A registered task
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub depends: Vec<String>,
    pub desc: Option<String>,
    action: Arc<dyn Action>,
    status: AtomicU8,
}

impl Task {
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: TaskStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn action(&self) -> Arc<dyn Action> {
        Arc::clone(&self.action)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("depends", &self.depends)
            .field("status", &self.status())
            .finish()
    }
}

/// Stores task definitions in registration order
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<Task>,
    by_name: HashMap<String, TaskId>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task
    pub fn register<I, S>(&mut self, name: &str, depends: I, action: Arc<dyn Action>) -> Result<TaskId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.register_with_description(name, depends, None, action)
    }

    /// Register a task with a human-readable description
    pub fn register_with_description<I, S>(
        &mut self,
        name: &str,
        depends: I,
        desc: Option<String>,
        action: Arc<dyn Action>,
    ) -> Result<TaskId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if name.trim().is_empty() {
            return Err(FlowError::InvalidDefinition {
                task: name.to_string(),
                reason: "task name must not be empty".to_string(),
            });
        }

        if self.by_name.contains_key(name) {
            return Err(FlowError::DuplicateTask {
                name: name.to_string(),
            });
        }

        let depends: Vec<String> = depends.into_iter().map(Into::into).collect();
        let mut seen = HashSet::new();
        for dep in &depends {
            if dep.trim().is_empty() {
                return Err(FlowError::InvalidDefinition {
                    task: name.to_string(),
                    reason: "dependency name must not be empty".to_string(),
                });
            }
            if !seen.insert(dep.as_str()) {
                return Err(FlowError::InvalidDefinition {
                    task: name.to_string(),
                    reason: format!("dependency '{}' is listed more than once", dep),
                });
            }
        }

        let id = TaskId(self.tasks.len());
        self.tasks.push(Task {
            id,
            name: name.to_string(),
            depends,
            desc,
            action,
            status: AtomicU8::new(TaskStatus::Pending as u8),
        });
        self.by_name.insert(name.to_string(), id);

        tracing::debug!(task = name, id = id.0, "registered task");
        Ok(id)
    }

    /// Get a task by name
    pub fn get(&self, name: &str) -> Result<&Task> {
        self.id_of(name)
            .map(|id| &self.tasks[id.0])
            .ok_or_else(|| self.unknown(name))
    }

    /// Get a task by id
    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id.0]
    }

    pub fn id_of(&self, name: &str) -> Option<TaskId> {
        self.by_name.get(name).copied()
    }

    /// Task names in registration order; clone the iterator to restart it
    pub fn list(&self) -> impl Iterator<Item = &str> + Clone + '_ {
        self.tasks.iter().map(|t| t.name.as_str())
    }

    /// Tasks in registration order
    pub fn tasks(&self) -> impl Iterator<Item = &Task> + Clone + '_ {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn unknown(&self, name: &str) -> FlowError {
        FlowError::UnknownTask {
            name: name.to_string(),
            available: self.list().map(str::to_string).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_get() {
        let mut registry = TaskRegistry::new();
        let lint = registry.register("lint", Vec::<String>::new(), noop()).unwrap();
        let bundle = registry.register("bundle", ["lint"], noop()).unwrap();

        assert_eq!(lint, TaskId(0));
        assert_eq!(bundle, TaskId(1));

        let task = registry.get("bundle").unwrap();
        assert_eq!(task.depends, vec!["lint".to_string()]);
        assert_eq!(task.status(), TaskStatus::Pending);
    }

    #[test]
    fn test_duplicate_task() {
        let mut registry = TaskRegistry::new();
        registry.register("lint", Vec::<String>::new(), noop()).unwrap();
        let err = registry.register("lint", Vec::<String>::new(), noop()).unwrap_err();
        assert!(matches!(err, FlowError::DuplicateTask { name } if name == "lint"));
    }

    #[test]
    fn test_invalid_dependencies() {
        let mut registry = TaskRegistry::new();

        let err = registry.register("a", [""], noop()).unwrap_err();
        assert!(matches!(err, FlowError::InvalidDefinition { .. }));

        let err = registry.register("a", ["b", "b"], noop()).unwrap_err();
        assert!(matches!(err, FlowError::InvalidDefinition { .. }));

        let err = registry.register("  ", Vec::<String>::new(), noop()).unwrap_err();
        assert!(matches!(err, FlowError::InvalidDefinition { .. }));

        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_task_lists_available() {
        let mut registry = TaskRegistry::new();
        registry.register("styles", Vec::<String>::new(), noop()).unwrap();

        match registry.get("scripts") {
            Err(FlowError::UnknownTask { name, available }) => {
                assert_eq!(name, "scripts");
                assert_eq!(available, vec!["styles".to_string()]);
            }
            other => panic!("unexpected: {:?}", other.map(|t| t.name.clone())),
        }
    }

    #[test]
    fn test_list_is_registration_order_and_restartable() {
        let mut registry = TaskRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.register(name, Vec::<String>::new(), noop()).unwrap();
        }

        let names = registry.list();
        let first: Vec<_> = names.clone().collect();
        let second: Vec<_> = names.collect();
        assert_eq!(first, vec!["zeta", "alpha", "mid"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_forward_references_are_allowed() {
        let mut registry = TaskRegistry::new();
        registry.register("default", ["styles", "scripts"], noop()).unwrap();
        registry.register("styles", Vec::<String>::new(), noop()).unwrap();
        assert_eq!(registry.len(), 2);
    }
}
