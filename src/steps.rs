//! Built-in pipeline steps
//!
//! Only generic plumbing lives here: concatenation, wrapping, renaming, and
//! hand-off to external programs. Style and script transforms themselves
//! (preprocessing, prefixing, minification, linting) are external commands.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::{StepConfig, StepKind};
use crate::error::{FlowError, Result};
use crate::pipeline::{Artifact, Mode, Pipeline, Step, StepError};
use crate::script::ScriptStep;

type StepResult = std::result::Result<Vec<Artifact>, StepError>;

/// Build a pipeline from config steps for the given mode
pub fn pipeline_from_config(task: &str, steps: &[StepConfig], mode: Mode) -> Result<Pipeline> {
    let mut builder = Pipeline::builder(mode);
    for step in steps {
        builder = builder.shared(step.only, step_from_kind(task, &step.kind, mode)?);
    }
    Ok(builder.build())
}

fn step_from_kind(task: &str, kind: &StepKind, mode: Mode) -> Result<Arc<dyn Step>> {
    let step: Arc<dyn Step> = match kind {
        StepKind::Concat { file, separator } => {
            if file.trim().is_empty() {
                return Err(FlowError::InvalidDefinition {
                    task: task.to_string(),
                    reason: "concat step needs a file name".to_string(),
                });
            }
            Arc::new(Concat::new(file).separator(separator))
        }
        StepKind::Wrap { header, footer } => Arc::new(Wrap::new(header, footer)),
        StepKind::Rename {
            basename,
            suffix,
            extname,
        } => Arc::new(Rename {
            basename: basename.clone(),
            suffix: suffix.clone(),
            extname: extname.clone(),
        }),
        StepKind::Exec { program, args } => Arc::new(Exec::new(program, args.clone())),
        StepKind::Check { program, args } => Arc::new(Check::new(program, args.clone())),
        StepKind::Script { source } => Arc::new(ScriptStep::compile(source, mode).map_err(
            |message| FlowError::InvalidDefinition {
                task: task.to_string(),
                reason: format!("script does not compile: {}", message),
            },
        )?),
    };
    Ok(step)
}

/// Joins all artifacts into one
#[derive(Debug, Clone)]
pub struct Concat {
    file: String,
    separator: String,
}

impl Concat {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            separator: "\n".to_string(),
        }
    }

    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }
}

impl Step for Concat {
    fn name(&self) -> &str {
        "concat"
    }

    fn apply<'a>(&'a self, input: Vec<Artifact>) -> BoxFuture<'a, StepResult> {
        Box::pin(async move {
            if input.is_empty() {
                return Ok(input);
            }
            let contents = input
                .iter()
                .map(|a| a.contents.as_str())
                .collect::<Vec<_>>()
                .join(&self.separator);
            Ok(vec![Artifact::new(&self.file, contents)])
        })
    }
}

/// Adds a header and a footer around every artifact
#[derive(Debug, Clone)]
pub struct Wrap {
    header: String,
    footer: String,
}

impl Wrap {
    pub fn new(header: impl Into<String>, footer: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            footer: footer.into(),
        }
    }
}

impl Step for Wrap {
    fn name(&self) -> &str {
        "wrap"
    }

    fn apply<'a>(&'a self, input: Vec<Artifact>) -> BoxFuture<'a, StepResult> {
        Box::pin(async move {
            Ok(input
                .into_iter()
                .map(|a| {
                    let wrapped = format!("{}{}{}", self.header, a.contents, self.footer);
                    a.with_contents(wrapped)
                })
                .collect())
        })
    }
}

/// Rewrites the file name of every artifact, keeping its directory
///
/// `basename` replaces the stem, `suffix` is appended to the stem and
/// `extname` (with its leading dot) replaces the extension.
#[derive(Debug, Clone, Default)]
pub struct Rename {
    pub basename: Option<String>,
    pub suffix: Option<String>,
    pub extname: Option<String>,
}

impl Rename {
    fn rename(&self, path: &Path) -> PathBuf {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        let file = format!(
            "{}{}{}",
            self.basename.as_deref().unwrap_or(&stem),
            self.suffix.as_deref().unwrap_or(""),
            self.extname.as_deref().unwrap_or(&ext),
        );

        match path.parent() {
            Some(parent) => parent.join(file),
            None => PathBuf::from(file),
        }
    }
}

impl Step for Rename {
    fn name(&self) -> &str {
        "rename"
    }

    fn apply<'a>(&'a self, input: Vec<Artifact>) -> BoxFuture<'a, StepResult> {
        Box::pin(async move {
            Ok(input
                .into_iter()
                .map(|mut a| {
                    a.path = self.rename(&a.path);
                    a
                })
                .collect())
        })
    }
}

/// Pipes each artifact through an external program (stdin to stdout)
///
/// `{path}` in an argument expands to the artifact's source file.
#[derive(Debug, Clone)]
pub struct Exec {
    program: String,
    args: Vec<String>,
}

impl Exec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Step for Exec {
    fn name(&self) -> &str {
        &self.program
    }

    fn apply<'a>(&'a self, input: Vec<Artifact>) -> BoxFuture<'a, StepResult> {
        Box::pin(async move {
            if input.is_empty() {
                return Ok(input);
            }
            let program = resolve_program(&self.program)?;
            let mut output = Vec::with_capacity(input.len());
            for artifact in input {
                let stdout = run_program(&program, &self.program, &self.args, &artifact).await?;
                output.push(artifact.with_contents(stdout));
            }
            Ok(output)
        })
    }
}

/// Runs an external checker (linter) on every artifact
///
/// A non-zero exit fails the step with the tool's output; artifacts pass
/// through unchanged otherwise.
#[derive(Debug, Clone)]
pub struct Check {
    program: String,
    args: Vec<String>,
}

impl Check {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Step for Check {
    fn name(&self) -> &str {
        &self.program
    }

    fn apply<'a>(&'a self, input: Vec<Artifact>) -> BoxFuture<'a, StepResult> {
        Box::pin(async move {
            if input.is_empty() {
                return Ok(input);
            }
            let program = resolve_program(&self.program)?;
            for artifact in &input {
                let report = run_program(&program, &self.program, &self.args, artifact).await?;
                if !report.trim().is_empty() {
                    tracing::info!(
                        check = %self.program,
                        file = %artifact.origin().display(),
                        "{}",
                        report.trim_end()
                    );
                }
            }
            Ok(input)
        })
    }
}

fn resolve_program(program: &str) -> std::result::Result<PathBuf, StepError> {
    which::which(program).map_err(|_| StepError::CommandNotFound {
        program: program.to_string(),
    })
}

fn expand_args(args: &[String], artifact: &Artifact) -> Vec<String> {
    let path = artifact.origin().to_string_lossy();
    args.iter().map(|a| a.replace("{path}", &path)).collect()
}

/// Run a program with the artifact on stdin and return its stdout
async fn run_program(
    program: &Path,
    display_name: &str,
    args: &[String],
    artifact: &Artifact,
) -> std::result::Result<String, StepError> {
    let mut child = Command::new(program)
        .args(expand_args(args, artifact))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| StepError::io(program, e))?;

    if let Some(mut stdin) = child.stdin.take() {
        let contents = artifact.contents.clone().into_bytes();
        tokio::spawn(async move {
            // Programs that ignore stdin may close it early
            if let Err(e) = stdin.write_all(&contents).await {
                tracing::debug!("stdin closed early: {}", e);
            }
        });
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| StepError::io(program, e))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(StepError::CommandFailed {
            program: display_name.to_string(),
            path: artifact.origin().to_path_buf(),
            code: output.status.code().unwrap_or(1),
            output: format!("{}{}", stdout, stderr),
        });
    }

    Ok(stdout)
}
