//! assetflow - task-graph builds for static-site assets
//!
//! Reads `assetflow.toml`, registers its tasks and runs them in dependency
//! order, once or on every file change.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use console::style;
use tokio::sync::oneshot;

mod build;
mod cli;
mod config;
mod debounce;
mod error;
mod graph;
mod pipeline;
mod registry;
mod scheduler;
mod script;
mod steps;
mod watch;

use build::{register_config, watch_bindings, BuildContext};
use cli::{Cli, Commands, EffectiveCommand};
use config::Config;
use error::{FlowError, Result};
use graph::DependencyGraph;
use pipeline::Mode;
use registry::TaskRegistry;
use scheduler::{print_results, print_summary, Scheduler, SchedulerOptions};
use watch::{WatchManager, WatchOptions};

const DEFAULT_TASK: &str = "default";

#[tokio::main]
async fn main() -> ExitCode {
    // Set up panic handler for nice error messages
    miette::set_panic_hook();

    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    // Handle --no-color
    if cli.no_color {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {:?}", style("error").red().bold(), miette::Report::new(e));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Change working directory if specified
    if let Some(cwd) = &cli.cwd {
        std::env::set_current_dir(cwd)?;
    }

    match cli.effective_command() {
        EffectiveCommand::Subcommand(cmd) => run_command(cmd, &cli).await,
        EffectiveCommand::RunTasks(tasks) => run_tasks(tasks, false, None, &cli).await,
        EffectiveCommand::Default => run_tasks(&[DEFAULT_TASK.to_string()], false, None, &cli).await,
    }
}

async fn run_command(cmd: &Commands, cli: &Cli) -> Result<()> {
    match cmd {
        Commands::Run {
            tasks,
            json,
            concurrency,
        } => run_tasks(tasks, *json, *concurrency, cli).await,

        Commands::Watch { initial } => watch_tasks(*initial, cli).await,

        Commands::List { deps } => {
            let project = Project::load(cli)?;
            print_task_list(&project.registry, *deps);
            Ok(())
        }

        Commands::Check => {
            let project = Project::load(cli)?;

            // Resolve every task on its own so unreachable cycles are reported too
            for task in project.registry.tasks() {
                DependencyGraph::resolve(&project.registry, &[task.name.as_str()])?;
            }
            let bindings = project.bindings()?;

            println!(
                "{} {} is valid ({} tasks, {} watch bindings)",
                style("✓").green(),
                project.config_path.display(),
                project.registry.len(),
                bindings.len()
            );
            Ok(())
        }

        Commands::Init { force } => init_config(*force),
    }
}

/// Everything derived from one loaded configuration
struct Project {
    config: Config,
    config_path: PathBuf,
    ctx: BuildContext,
    registry: Arc<TaskRegistry>,
}

impl Project {
    fn load(cli: &Cli) -> Result<Self> {
        let (config, config_path) = Config::load(cli.config.as_deref())?;

        let root = match config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let root = root.canonicalize().unwrap_or(root);

        let mode = Mode::from_uncompressed(cli.uncompressed || config.settings.uncompressed);
        let ctx = BuildContext::from_config(&config, root, mode)?;

        let mut registry = TaskRegistry::new();
        register_config(&mut registry, &config, &ctx)?;
        tracing::debug!(
            config = %config_path.display(),
            tasks = registry.len(),
            mode = ?mode,
            "configuration loaded"
        );

        Ok(Self {
            config,
            config_path,
            ctx,
            registry: Arc::new(registry),
        })
    }

    /// Watch bindings whose targets are all registered
    fn bindings(&self) -> Result<Vec<watch::WatchBinding>> {
        let bindings = watch_bindings(&self.config)?;
        for binding in &bindings {
            self.registry.get(binding.task())?;
        }
        Ok(bindings)
    }

    fn scheduler(&self, concurrency: Option<usize>, progress: bool) -> Scheduler {
        let options = SchedulerOptions {
            concurrency: concurrency.unwrap_or(self.config.settings.concurrency),
            progress,
        };
        Scheduler::new(Arc::clone(&self.registry), options)
    }

    fn announce_mode(&self) {
        if !self.ctx.mode().is_compressed() {
            eprintln!(
                "{} {}",
                style("--uncompressed").green(),
                style("flag enabled").magenta()
            );
        }
    }
}

async fn run_tasks(
    tasks: &[String],
    json: bool,
    concurrency: Option<usize>,
    cli: &Cli,
) -> Result<()> {
    let project = Project::load(cli)?;
    if !json {
        project.announce_mode();
    }

    let progress = !json && console::Term::stderr().is_term();
    let scheduler = project.scheduler(concurrency, progress);
    let report = scheduler.run(tasks).await?;

    if json {
        let out = serde_json::to_string_pretty(&report).map_err(std::io::Error::other)?;
        println!("{}", out);
    } else {
        print_results(&report);
        print_summary(&report);
    }

    report.into_result().map(|_| ())
}

async fn watch_tasks(initial: bool, cli: &Cli) -> Result<()> {
    let project = Project::load(cli)?;
    let bindings = project.bindings()?;
    if bindings.is_empty() {
        return Err(FlowError::InvalidConfig {
            reason: "no watch bindings configured (add `watch = [...]` to a task or a [[watch]] block)"
                .to_string(),
        });
    }
    project.announce_mode();

    let scheduler = Arc::new(project.scheduler(None, false));

    if initial {
        let mut targets: Vec<String> = Vec::new();
        for binding in &bindings {
            if !targets.iter().any(|t| t == binding.task()) {
                targets.push(binding.task().to_string());
            }
        }
        println!("{}", style("─".repeat(60)).dim());
        let report = scheduler.run(&targets).await?;
        print_results(&report);
        print_summary(&report);
        println!("{}", style("─".repeat(60)).dim());
    }

    let settings = &project.config.settings;
    let options = WatchOptions {
        debounce: Duration::from_millis(settings.debounce_ms),
        hash_filter: settings.watch_hash,
        ignore: project
            .ctx
            .output_dirs()
            .iter()
            .map(|dir| format!("{}/**", dir.to_string_lossy().replace('\\', "/")))
            .collect(),
        print_reports: true,
    };
    let manager = WatchManager::new(scheduler, project.ctx.root(), options)?;

    println!(
        "{} Watching {}",
        style("👀").cyan(),
        style(manager.root().display()).bold()
    );
    for binding in &bindings {
        println!(
            "   {} {}",
            style(binding.task()).cyan(),
            style(binding.patterns().join(", ")).dim()
        );
    }
    println!();

    let (stop_tx, stop_rx) = oneshot::channel();
    tokio::spawn(watch::stop_on(tokio::signal::ctrl_c(), stop_tx));

    let summary = manager.watch(&bindings, stop_rx).await?;
    println!();
    println!(
        "{} Stopped after {} runs ({} failed)",
        style("■").dim(),
        summary.runs,
        summary.failed_runs
    );
    Ok(())
}

fn print_task_list(registry: &TaskRegistry, show_deps: bool) {
    if registry.is_empty() {
        println!("No tasks defined");
        return;
    }

    println!("{}", style("Available tasks:").bold());
    println!();

    let max_name_len = registry.list().map(str::len).max().unwrap_or(0);

    for task in registry.tasks() {
        let desc = task.desc.as_deref().unwrap_or("");

        print!(
            "  {}{}  {}",
            style(&task.name).cyan().bold(),
            " ".repeat(max_name_len - task.name.len()),
            style(desc).dim()
        );

        if show_deps && !task.depends.is_empty() {
            print!(
                " {}",
                style(format!("[deps: {}]", task.depends.join(", "))).yellow().dim()
            );
        }

        println!();
    }
}

const CONFIG_TEMPLATE: &str = r#"# assetflow.toml - asset build configuration
#
# Browser targets for autoprefixer are read from .browserslistrc,
# e.g. "Firefox > 30, Chrome > 36, IE > 8, iOS > 6, Safari > 6".

[settings]
# concurrency = 0        # Max tasks running at once (0 = unbounded)
# debounce_ms = 100      # Watch debounce window
# watch_hash = false     # Ignore saves that leave content unchanged
# uncompressed = false   # Same as passing -u

[paths.styles_critical]
src = "./src/styles/critical.less"
output = "./_includes"

[paths.styles_noncritical]
src = "./src/styles/noncritical.less"
output = "./assets/styles"

[paths.scripts_critical]
src = "./src/scripts/critical/**/*.js"
output = "./_includes"

[paths.scripts_noncritical]
src = "./src/scripts/noncritical/**/*.js"
output = "./assets/scripts"

[tasks."styles:critical"]
desc = "Inline critical styles into an HTML include"
paths = "styles_critical"
steps = [
  { exec = { program = "lessc", args = ["-"] } },
  { exec = { program = "postcss", args = ["--use", "autoprefixer"] } },
  { exec = { program = "cleancss" }, only = "compressed" },
  { wrap = { header = "<style>", footer = "</style>" } },
  { rename = { basename = "criticalCSS", extname = ".html" } },
]
watch = ["src/styles/critical.less"]

[tasks."styles:noncritical"]
desc = "Build the deferred stylesheet"
paths = "styles_noncritical"
steps = [
  { exec = { program = "lessc", args = ["-"] } },
  { exec = { program = "postcss", args = ["--use", "autoprefixer"] } },
  { exec = { program = "cleancss" }, only = "compressed" },
  { rename = { basename = "styles", suffix = ".min", extname = ".css" } },
]
watch = ["src/styles/noncritical.less"]

[tasks.styles]
desc = "All styles"
depends = ["styles:critical", "styles:noncritical"]

[tasks."scripts:critical"]
desc = "Inline critical scripts into an HTML include"
paths = "scripts_critical"
steps = [
  { concat = { file = "criticalJS.js" } },
  { exec = { program = "uglifyjs" }, only = "compressed" },
  { wrap = { header = "<script>", footer = "</script>" } },
  { rename = { basename = "criticalJS", extname = ".html" } },
]
watch = ["src/scripts/critical/**/*.js"]

[tasks."scripts:lint"]
desc = "Lint the site script entry point"
src = "./src/scripts/noncritical/main.js"
steps = [
  { check = { program = "eslint", args = ["{path}"] } },
]

[tasks."scripts:noncritical"]
desc = "Bundle the deferred site script"
depends = ["scripts:lint"]
paths = "scripts_noncritical"
steps = [
  { concat = { file = "noncriticalJS.js" } },
  { exec = { program = "uglifyjs" }, only = "compressed" },
  { rename = { basename = "site", suffix = ".min" } },
]
watch = ["src/scripts/noncritical/**/*.js"]

[tasks.scripts]
desc = "All scripts"
depends = ["scripts:critical", "scripts:noncritical"]

[tasks.default]
desc = "Build everything"
depends = ["styles", "scripts"]
"#;

fn init_config(force: bool) -> Result<()> {
    let path = Path::new(config::CONFIG_FILES[0]);

    if path.exists() && !force {
        return Err(FlowError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} already exists (use --force to overwrite)", path.display()),
        )));
    }

    std::fs::write(path, CONFIG_TEMPLATE)?;

    println!(
        "{} Created {}",
        style("✓").green(),
        style(path.display()).bold()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_registers_cleanly() {
        let config = Config::parse(CONFIG_TEMPLATE).unwrap();
        config.validate().unwrap();

        let ctx = BuildContext::from_config(&config, "/site", Mode::Compressed).unwrap();
        let mut registry = TaskRegistry::new();
        register_config(&mut registry, &config, &ctx).unwrap();

        assert_eq!(
            registry.list().collect::<Vec<_>>(),
            vec![
                "styles:critical",
                "styles:noncritical",
                "styles",
                "scripts:critical",
                "scripts:lint",
                "scripts:noncritical",
                "scripts",
                "default",
            ]
        );

        let graph = DependencyGraph::resolve(&registry, &[DEFAULT_TASK]).unwrap();
        assert_eq!(graph.len(), 8);
        assert_eq!(watch_bindings(&config).unwrap().len(), 4);
    }
}
