//! Configuration parsing for assetflow.toml
//!
//! Handles loading and validating the build configuration. Tasks keep the
//! order in which they appear in the file, which becomes their registration
//! order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{FlowError, Result};
use crate::pipeline::Mode;

/// Default config file names to search for
pub const CONFIG_FILES: &[&str] = &["assetflow.toml", "Assetflow.toml"];

/// Root configuration structure
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Global settings
    pub settings: Settings,

    /// Named source/output path sets
    pub paths: BTreeMap<String, PathSetConfig>,

    /// Task definitions in file order
    pub tasks: Vec<(String, TaskConfig)>,

    /// Standalone watch bindings
    pub watch: Vec<WatchConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    settings: Settings,
    #[serde(default)]
    paths: BTreeMap<String, PathSetConfig>,
    #[serde(default)]
    tasks: toml::Table,
    #[serde(default)]
    watch: Vec<WatchConfig>,
}

/// Global settings for assetflow behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Max tasks running at once inside a layer (0 = unbounded)
    #[serde(default)]
    pub concurrency: usize,

    /// Watch debounce window in milliseconds
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Ignore change events whose file content hash did not change
    #[serde(default)]
    pub watch_hash: bool,

    /// Build the uncompressed variant unless overridden on the command line
    #[serde(default)]
    pub uncompressed: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrency: 0,
            debounce_ms: default_debounce(),
            watch_hash: false,
            uncompressed: false,
        }
    }
}

fn default_debounce() -> u64 {
    100
}

/// One glob or a list of globs
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s.clone()],
            OneOrMany::Many(v) => v.clone(),
        }
    }
}

impl Default for OneOrMany {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

/// A named source/output pair
///
/// Besides `src`, any other key holding globs is kept as a named glob set
/// (e.g. `lint = "src/scripts/main.js"`), selectable with a task's `sources`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathSetConfig {
    pub src: OneOrMany,

    #[serde(default)]
    pub output: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, OneOrMany>,
}

/// Configuration for a single task
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    /// Human-readable description
    #[serde(default)]
    pub desc: Option<String>,

    /// Tasks that must complete before this one
    #[serde(default)]
    pub depends: Vec<String>,

    /// Name of the path set providing sources and output
    #[serde(default)]
    pub paths: Option<String>,

    /// Which glob set of the path set to read (defaults to `src`)
    #[serde(default)]
    pub sources: Option<String>,

    /// Inline source globs (instead of a path set)
    #[serde(default)]
    pub src: Option<OneOrMany>,

    /// Inline output directory (instead of a path set)
    #[serde(default)]
    pub output: Option<String>,

    /// Pipeline steps applied to the sources
    #[serde(default)]
    pub steps: Vec<StepConfig>,

    /// Files to watch for this task (glob patterns)
    #[serde(default)]
    pub watch: Vec<String>,
}

/// A pipeline step as written in the config
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StepConfig {
    #[serde(flatten)]
    pub kind: StepKind,

    /// Restrict the step to one transform variant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only: Option<Mode>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Join every artifact into one file
    Concat {
        file: String,
        #[serde(default = "default_separator")]
        separator: String,
    },

    /// Surround contents with a header and a footer
    Wrap {
        #[serde(default)]
        header: String,
        #[serde(default)]
        footer: String,
    },

    /// Rewrite file names
    Rename {
        #[serde(default)]
        basename: Option<String>,
        #[serde(default)]
        suffix: Option<String>,
        #[serde(default)]
        extname: Option<String>,
    },

    /// Pipe contents through an external command
    Exec {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },

    /// Run an external checker; contents pass through unchanged
    Check {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },

    /// Transform contents with a Rhai script
    Script { source: String },
}

fn default_separator() -> String {
    "\n".to_string()
}

/// Standalone watch binding
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WatchConfig {
    pub patterns: Vec<String>,
    pub task: String,
}

impl Config {
    /// Load configuration from the specified path or search for it
    pub fn load(path: Option<&Path>) -> Result<(Self, PathBuf)> {
        let config_path = match path {
            Some(p) => {
                if p.exists() {
                    p.to_path_buf()
                } else {
                    return Err(FlowError::ConfigNotFound {
                        searched: vec![p.to_path_buf()],
                    });
                }
            }
            None => Self::find_config()?,
        };

        let content = std::fs::read_to_string(&config_path)?;
        let config = Self::parse(&content).map_err(|e| FlowError::ConfigParse {
            source: e,
            path: config_path.clone(),
        })?;

        config.validate()?;

        Ok((config, config_path))
    }

    /// Parse a configuration document, keeping task order
    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        let raw: RawConfig = toml::from_str(content)?;

        let mut tasks = Vec::with_capacity(raw.tasks.len());
        for (name, value) in raw.tasks {
            let task: TaskConfig = value.try_into()?;
            tasks.push((name, task));
        }

        Ok(Self {
            settings: raw.settings,
            paths: raw.paths,
            tasks,
            watch: raw.watch,
        })
    }

    /// Search for config file starting from current directory
    fn find_config() -> Result<PathBuf> {
        let mut current = std::env::current_dir()?;
        let mut searched = Vec::new();

        loop {
            for name in CONFIG_FILES {
                let candidate = current.join(name);
                searched.push(candidate.clone());
                if candidate.exists() {
                    return Ok(candidate);
                }
            }

            if !current.pop() {
                break;
            }
        }

        Err(FlowError::ConfigNotFound { searched })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (name, task) in &self.tasks {
            if task.paths.is_some() && (task.src.is_some() || task.output.is_some()) {
                return Err(FlowError::InvalidConfig {
                    reason: format!(
                        "task '{}' cannot combine 'paths' with inline 'src'/'output'",
                        name
                    ),
                });
            }

            if task.sources.is_some() && task.paths.is_none() {
                return Err(FlowError::InvalidConfig {
                    reason: format!("task '{}' sets 'sources' without 'paths'", name),
                });
            }

            if let Some(set) = &task.paths {
                if !self.paths.contains_key(set) {
                    return Err(FlowError::InvalidConfig {
                        reason: format!("task '{}' references unknown path set '{}'", name, set),
                    });
                }
            }

            let has_sources = task.paths.is_some() || task.src.is_some();
            if !task.steps.is_empty() && !has_sources {
                return Err(FlowError::InvalidConfig {
                    reason: format!("task '{}' has steps but no sources", name),
                });
            }
        }

        // Extra keys are flattened, so a typo would otherwise become a glob set
        for (set_name, set) in &self.paths {
            for key in set.extra.keys() {
                let selected = self.tasks.iter().any(|(_, task)| {
                    task.paths.as_deref() == Some(set_name.as_str())
                        && task.sources.as_deref() == Some(key.as_str())
                });
                if !selected {
                    return Err(FlowError::InvalidConfig {
                        reason: format!(
                            "path set '{}' has key '{}' that no task selects with 'sources'",
                            set_name, key
                        ),
                    });
                }
            }
        }

        for binding in &self.watch {
            if binding.patterns.is_empty() {
                return Err(FlowError::InvalidConfig {
                    reason: format!("watch binding for '{}' has no patterns", binding.task),
                });
            }
        }

        Ok(())
    }

    /// Get a task by name
    pub fn get_task(&self, name: &str) -> Option<&TaskConfig> {
        self.tasks.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// List all task names in file order
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|(n, _)| n.as_str()).collect()
    }
}
