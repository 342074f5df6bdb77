//! Step pipelines
//!
//! A pipeline is an ordered list of [`Step`]s. Each step consumes the list of
//! artifacts produced by the previous one and either produces a new list or
//! fails. Steps are composed explicitly at construction time; there is no
//! lookup by name once a pipeline exists.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A file flowing through a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Output path, relative to the output directory
    pub path: PathBuf,
    /// File the artifact was read from, if any
    pub source: Option<PathBuf>,
    pub contents: String,
}

impl Artifact {
    pub fn new(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source: None,
            contents: contents.into(),
        }
    }

    pub fn from_file(path: impl Into<PathBuf>, source: impl Into<PathBuf>, contents: String) -> Self {
        Self {
            path: path.into(),
            source: Some(source.into()),
            contents,
        }
    }

    /// Same artifact with new contents
    pub fn with_contents(self, contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            ..self
        }
    }

    /// Path external tools should see: the source file when there is one
    pub fn origin(&self) -> &Path {
        self.source.as_deref().unwrap_or(&self.path)
    }

    /// File name without directory
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Transform variant selected for every pipeline of a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Compressed,
    Uncompressed,
}

impl Mode {
    pub fn from_uncompressed(uncompressed: bool) -> Self {
        if uncompressed {
            Mode::Uncompressed
        } else {
            Mode::Compressed
        }
    }

    pub fn is_compressed(self) -> bool {
        self == Mode::Compressed
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Compressed => f.write_str("compressed"),
            Mode::Uncompressed => f.write_str("uncompressed"),
        }
    }
}

/// Failure of a single pipeline step
#[derive(Error, Debug)]
pub enum StepError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Command not found: {program}")]
    CommandNotFound { program: String },

    #[error("'{program}' exited with code {code} on {}{}", .path.display(), format_output(.output))]
    CommandFailed {
        program: String,
        path: PathBuf,
        code: i32,
        output: String,
    },

    #[error("Script error in {}: {message}", .path.display())]
    Script { path: PathBuf, message: String },

    #[error("Invalid glob pattern '{pattern}': {message}")]
    Glob { pattern: String, message: String },

    #[error("{0}")]
    Custom(String),
}

impl StepError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        StepError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

fn format_output(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("\n{}", trimmed)
    }
}

/// One transform of an artifact stream
pub trait Step: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    fn apply<'a>(
        &'a self,
        input: Vec<Artifact>,
    ) -> BoxFuture<'a, std::result::Result<Vec<Artifact>, StepError>>;
}

/// An ordered chain of steps
#[derive(Clone, Default)]
pub struct Pipeline {
    steps: Vec<Arc<dyn Step>>,
}

impl Pipeline {
    /// Start a pipeline for the given transform variant
    pub fn builder(mode: Mode) -> PipelineBuilder {
        PipelineBuilder {
            mode,
            steps: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Names of the steps in application order
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step in order, feeding each the previous output
    pub async fn run(&self, input: Vec<Artifact>) -> std::result::Result<Vec<Artifact>, StepError> {
        let mut artifacts = input;
        for step in &self.steps {
            tracing::debug!(step = step.name(), artifacts = artifacts.len(), "applying step");
            artifacts = step.apply(artifacts).await?;
        }
        Ok(artifacts)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.step_names()).finish()
    }
}

/// Builder that drops steps not meant for the selected mode
pub struct PipelineBuilder {
    mode: Mode,
    steps: Vec<Arc<dyn Step>>,
}

impl PipelineBuilder {
    /// Always apply this step
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Apply this step only in the given mode (otherwise it is a no-op)
    pub fn step_for(self, mode: Mode, step: impl Step + 'static) -> Self {
        if self.mode == mode {
            self.step(step)
        } else {
            self
        }
    }

    pub fn compressed(self, step: impl Step + 'static) -> Self {
        self.step_for(Mode::Compressed, step)
    }

    pub fn uncompressed(self, step: impl Step + 'static) -> Self {
        self.step_for(Mode::Uncompressed, step)
    }

    /// Push an already shared step, optionally restricted to one mode
    pub fn shared(mut self, only: Option<Mode>, step: Arc<dyn Step>) -> Self {
        if only.map_or(true, |m| m == self.mode) {
            self.steps.push(step);
        }
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline { steps: self.steps }
    }
}
