//! Turning a configuration into registered tasks
//!
//! The configuration is resolved once into an immutable [`BuildContext`]
//! (project root, expanded path sets, transform mode). Registration and
//! pipeline construction only read from it.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::config::{Config, TaskConfig};
use crate::error::{FlowError, Result};
use crate::pipeline::{Artifact, Mode, Pipeline, StepError};
use crate::registry::{noop, Action, TaskRegistry};
use crate::steps::pipeline_from_config;
use crate::watch::WatchBinding;

/// Glob set name used when a task does not pick one
pub const DEFAULT_SOURCES: &str = "src";

/// A resolved source/output pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSet {
    /// Named glob lists; always contains `src`
    pub globs: BTreeMap<String, Vec<String>>,
    pub output: Option<PathBuf>,
}

impl PathSet {
    pub fn sources(&self, name: &str) -> Option<&[String]> {
        self.globs.get(name).map(Vec::as_slice)
    }
}

/// Immutable inputs to task registration
#[derive(Debug, Clone)]
pub struct BuildContext {
    root: PathBuf,
    mode: Mode,
    paths: BTreeMap<String, PathSet>,
    task_outputs: Vec<PathBuf>,
}

impl BuildContext {
    /// Resolve path sets from the configuration, expanding `~` and `$VAR`
    pub fn from_config(config: &Config, root: impl Into<PathBuf>, mode: Mode) -> Result<Self> {
        let mut paths = BTreeMap::new();
        for (name, set) in &config.paths {
            let mut globs = BTreeMap::new();
            globs.insert(DEFAULT_SOURCES.to_string(), expand_all(&set.src.to_vec())?);
            for (key, value) in &set.extra {
                globs.insert(key.clone(), expand_all(&value.to_vec())?);
            }
            let output = set.output.as_deref().map(expand).transpose()?.map(PathBuf::from);
            paths.insert(name.clone(), PathSet { globs, output });
        }

        let task_outputs = config
            .tasks
            .iter()
            .filter_map(|(_, task)| task.output.as_deref())
            .map(|output| expand(output).map(PathBuf::from))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            root: root.into(),
            mode,
            paths,
            task_outputs,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn path_set(&self, name: &str) -> Option<&PathSet> {
        self.paths.get(name)
    }

    /// Output directories of every path set and inline task output
    pub fn output_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self
            .paths
            .values()
            .filter_map(|p| p.output.as_deref())
            .chain(self.task_outputs.iter().map(PathBuf::as_path))
            .map(normalize)
            .collect();
        dirs.sort();
        dirs.dedup();
        dirs
    }
}

fn expand(value: &str) -> Result<String> {
    shellexpand::full(value)
        .map(|s| s.into_owned())
        .map_err(|e| FlowError::InvalidConfig {
            reason: format!("cannot expand '{}': {}", value, e),
        })
}

fn expand_all(values: &[String]) -> Result<Vec<String>> {
    values.iter().map(|v| expand(v)).collect()
}

/// Drop `./` components so paths compare cleanly against relativized events
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

fn normalize_pattern(pattern: &str) -> String {
    pattern.trim_start_matches("./").to_string()
}

/// Register every configured task, in file order
pub fn register_config(
    registry: &mut TaskRegistry,
    config: &Config,
    ctx: &BuildContext,
) -> Result<()> {
    for (name, task) in &config.tasks {
        let action = task_action(name, task, ctx)?;
        registry.register_with_description(name, task.depends.clone(), task.desc.clone(), action)?;
    }
    Ok(())
}

fn task_action(name: &str, task: &TaskConfig, ctx: &BuildContext) -> Result<Arc<dyn Action>> {
    let (sources, output) = resolve_io(name, task, ctx)?;

    if sources.is_empty() && task.steps.is_empty() {
        return Ok(noop());
    }

    let pipeline = pipeline_from_config(name, &task.steps, ctx.mode())?;
    let action = PipelineTask::new(name, ctx.root(), sources, output, pipeline)
        .map_err(|e| FlowError::InvalidDefinition {
            task: name.to_string(),
            reason: e.to_string(),
        })?;
    Ok(Arc::new(action))
}

fn resolve_io(
    name: &str,
    task: &TaskConfig,
    ctx: &BuildContext,
) -> Result<(Vec<String>, Option<PathBuf>)> {
    if let Some(set_name) = &task.paths {
        let set = ctx
            .path_set(set_name)
            .ok_or_else(|| FlowError::InvalidDefinition {
                task: name.to_string(),
                reason: format!("unknown path set '{}'", set_name),
            })?;
        let key = task.sources.as_deref().unwrap_or(DEFAULT_SOURCES);
        let sources = set.sources(key).ok_or_else(|| FlowError::InvalidDefinition {
            task: name.to_string(),
            reason: format!("path set '{}' has no '{}' globs", set_name, key),
        })?;
        return Ok((sources.to_vec(), set.output.clone()));
    }

    let sources = match &task.src {
        Some(src) => expand_all(&src.to_vec())?,
        None => Vec::new(),
    };
    let output = task.output.as_deref().map(expand).transpose()?.map(PathBuf::from);
    Ok((sources, output))
}

/// Collect watch bindings: per-task `watch` lists first, then `[[watch]]` blocks
pub fn watch_bindings(config: &Config) -> Result<Vec<WatchBinding>> {
    let mut bindings = Vec::new();
    for (name, task) in &config.tasks {
        if !task.watch.is_empty() {
            bindings.push(WatchBinding::new(name.clone(), task.watch.clone())?);
        }
    }
    for binding in &config.watch {
        bindings.push(WatchBinding::new(binding.task.clone(), binding.patterns.clone())?);
    }
    Ok(bindings)
}

/// Task action: read sources, run the pipeline, write results
#[derive(Clone)]
pub struct PipelineTask {
    inner: Arc<PipelineTaskInner>,
}

struct PipelineTaskInner {
    name: String,
    root: PathBuf,
    sources: Vec<SourceGlob>,
    output: Option<PathBuf>,
    pipeline: Pipeline,
}

/// One source pattern with its literal base directory
#[derive(Debug, Clone)]
struct SourceGlob {
    pattern: String,
    base: PathBuf,
    matcher: GlobSet,
}

impl SourceGlob {
    fn new(pattern: &str) -> std::result::Result<Self, StepError> {
        let pattern = normalize_pattern(pattern);
        let glob = Glob::new(&pattern).map_err(|e| StepError::Glob {
            pattern: pattern.clone(),
            message: e.to_string(),
        })?;
        let matcher = GlobSetBuilder::new()
            .add(glob)
            .build()
            .map_err(|e| StepError::Glob {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            base: literal_base(&pattern),
            pattern,
            matcher,
        })
    }
}

/// Leading path components without glob metacharacters
///
/// For a pattern without any metacharacter this is the parent directory, so
/// a single file is written under its own name. An absolute pattern keeps its
/// leading `/`.
fn literal_base(pattern: &str) -> PathBuf {
    let is_meta = |s: &str| s.contains(['*', '?', '[', '{']);
    let parts: Vec<&str> = pattern.split('/').collect();
    let literal = parts.iter().take_while(|p| !is_meta(p)).count();
    let take = if literal == parts.len() {
        literal.saturating_sub(1)
    } else {
        literal
    };
    let mut base = if pattern.starts_with('/') {
        PathBuf::from("/")
    } else {
        PathBuf::new()
    };
    base.extend(parts[..take].iter().filter(|p| !p.is_empty()));
    base
}

impl PipelineTask {
    pub fn new(
        name: &str,
        root: &Path,
        sources: Vec<String>,
        output: Option<PathBuf>,
        pipeline: Pipeline,
    ) -> std::result::Result<Self, StepError> {
        let sources = sources
            .iter()
            .map(|p| SourceGlob::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self {
            inner: Arc::new(PipelineTaskInner {
                name: name.to_string(),
                root: root.to_path_buf(),
                sources,
                output,
                pipeline,
            }),
        })
    }
}

impl Action for PipelineTask {
    fn call(&self) -> BoxFuture<'static, std::result::Result<(), StepError>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { inner.execute().await })
    }
}

impl PipelineTaskInner {
    async fn execute(&self) -> std::result::Result<(), StepError> {
        let input = self.read_sources().await?;
        if input.is_empty() {
            tracing::warn!(task = %self.name, "no source files matched");
        }

        let artifacts = self.pipeline.run(input).await?;

        if let Some(output) = &self.output {
            let dir = self.root.join(output);
            for artifact in &artifacts {
                let dest = dir.join(&artifact.path);
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| StepError::io(parent, e))?;
                }
                tokio::fs::write(&dest, &artifact.contents)
                    .await
                    .map_err(|e| StepError::io(&dest, e))?;
                tracing::debug!(task = %self.name, file = %dest.display(), "wrote artifact");
            }
        }

        Ok(())
    }

    /// Expand source globs into artifacts, sorted per pattern, without duplicates
    async fn read_sources(&self) -> std::result::Result<Vec<Artifact>, StepError> {
        let mut artifacts = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for source in &self.sources {
            // Absolute patterns (e.g. an expanded `~/`) match full paths
            let absolute = source.base.is_absolute();
            let base = if absolute {
                source.base.clone()
            } else {
                self.root.join(&source.base)
            };
            let mut files: Vec<(PathBuf, PathBuf)> = Vec::new();

            for entry in WalkDir::new(&base)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let rel = if absolute {
                    normalize(path)
                } else {
                    match path.strip_prefix(&self.root) {
                        Ok(rel) => normalize(rel),
                        Err(_) => continue,
                    }
                };
                if source.matcher.is_match(&rel) {
                    let under_base = rel
                        .strip_prefix(normalize(&source.base))
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|_| rel.clone());
                    files.push((path.to_path_buf(), under_base));
                }
            }

            files.sort();
            if files.is_empty() {
                tracing::debug!(task = %self.name, pattern = %source.pattern, "pattern matched nothing");
            }

            for (path, under_base) in files {
                if !seen.insert(path.clone()) {
                    continue;
                }
                let contents = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| StepError::io(&path, e))?;
                artifacts.push(Artifact::from_file(under_base, path, contents));
            }
        }

        Ok(artifacts)
    }
}
