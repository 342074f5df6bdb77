//! File watching for automatic task re-execution
//!
//! `notify` events are forwarded over a channel into a single loop that owns
//! the debounce timers and the in-flight run. Runs are serialized: triggers
//! that fire while a run is in progress are merged into one queued batch.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use console::style;
use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use once_cell::sync::Lazy;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, Instant};

use crate::debounce::Debouncer;
use crate::error::{FlowError, Result};
use crate::scheduler::{print_results, print_summary, RunReport, Scheduler};

/// Directories that never trigger a run
pub const DEFAULT_IGNORES: &[&str] = &["**/.git/**", "**/node_modules/**", "**/target/**"];

static DEFAULT_IGNORE_SET: Lazy<GlobSet> =
    Lazy::new(|| build_globset(DEFAULT_IGNORES).unwrap_or_else(|_| GlobSet::empty()));

fn build_globset<S: AsRef<str>>(patterns: &[S]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let pattern = pattern.as_ref();
        let glob = Glob::new(pattern).map_err(|source| FlowError::Glob {
            pattern: pattern.to_string(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| FlowError::Glob {
        pattern: patterns
            .iter()
            .map(|p| p.as_ref())
            .collect::<Vec<_>>()
            .join(", "),
        source,
    })
}

/// Glob patterns bound to one target task
#[derive(Debug, Clone)]
pub struct WatchBinding {
    task: String,
    patterns: Vec<String>,
    matcher: GlobSet,
}

impl WatchBinding {
    pub fn new(task: String, patterns: Vec<String>) -> Result<Self> {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(|p| p.trim_start_matches("./").to_string())
            .collect();
        let matcher = build_globset(&patterns)?;
        Ok(Self {
            task,
            patterns,
            matcher,
        })
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Match a root-relative path
    pub fn matches(&self, rel: &str) -> bool {
        self.matcher.is_match(rel)
    }
}

/// Drops events for files whose content did not change
#[derive(Debug, Default)]
pub struct ContentFilter {
    hashes: HashMap<PathBuf, blake3::Hash>,
}

impl ContentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `path` differs from the last content seen for it.
    /// Unreadable (e.g. removed) files always count as changed.
    pub fn changed(&mut self, path: &Path) -> bool {
        match std::fs::read(path) {
            Ok(bytes) => {
                let hash = blake3::hash(&bytes);
                self.hashes.insert(path.to_path_buf(), hash) != Some(hash)
            }
            Err(_) => {
                self.hashes.remove(path);
                true
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub debounce: Duration,
    pub hash_filter: bool,
    /// Extra root-relative ignore globs (output directories)
    pub ignore: Vec<String>,
    pub print_reports: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            hash_filter: false,
            ignore: Vec::new(),
            print_reports: false,
        }
    }
}

/// Totals for one watch session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchSummary {
    pub runs: usize,
    pub failed_runs: usize,
}

type RunHandle = JoinHandle<Result<RunReport>>;

pub struct WatchManager {
    scheduler: Arc<Scheduler>,
    root: PathBuf,
    options: WatchOptions,
    ignore: GlobSet,
}

impl WatchManager {
    pub fn new(scheduler: Arc<Scheduler>, root: impl Into<PathBuf>, options: WatchOptions) -> Result<Self> {
        let root = root.into();
        let root = root.canonicalize().unwrap_or(root);
        let ignore = build_globset(&options.ignore)?;
        Ok(Self {
            scheduler,
            root,
            options,
            ignore,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Watch the project root until `stop` resolves
    pub async fn watch(
        &self,
        bindings: &[WatchBinding],
        stop: oneshot::Receiver<()>,
    ) -> Result<WatchSummary> {
        let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    for path in event.paths {
                        // Receiver gone means the loop has ended
                        let _ = tx.send(path);
                    }
                }
                Err(err) => tracing::warn!("file watch error: {}", err),
            },
            notify::Config::default(),
        )
        .map_err(|source| FlowError::Watch { source })?;

        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|source| FlowError::Watch { source })?;

        tracing::info!(root = %self.root.display(), bindings = bindings.len(), "file watcher started");

        let summary = self.run_loop(bindings, rx, stop).await;
        drop(watcher);
        summary
    }

    /// Debounce and dispatch changed paths until `stop` resolves
    ///
    /// Stopping cancels pending timers and discards the queued batch, but an
    /// in-flight run is awaited.
    pub async fn run_loop(
        &self,
        bindings: &[WatchBinding],
        mut events: mpsc::UnboundedReceiver<PathBuf>,
        mut stop: oneshot::Receiver<()>,
    ) -> Result<WatchSummary> {
        let mut debouncer: Debouncer<usize> = Debouncer::new(self.options.debounce);
        let mut filter = ContentFilter::new();
        let mut in_flight: Option<RunHandle> = None;
        let mut queued: Vec<String> = Vec::new();
        let mut summary = WatchSummary::default();
        let mut events_open = true;

        loop {
            let deadline = debouncer.next_deadline();
            let timer = sleep_until(deadline.unwrap_or_else(far_future));

            tokio::select! {
                _ = &mut stop => break,

                path = events.recv(), if events_open => match path {
                    Some(path) => self.on_path(bindings, &path, &mut filter, &mut debouncer),
                    None => events_open = false,
                },

                _ = timer, if deadline.is_some() => {
                    let fired = debouncer.fire(Instant::now());
                    let targets = targets_for(bindings, &fired);
                    if targets.is_empty() {
                        continue;
                    }
                    if in_flight.is_some() {
                        tracing::debug!(tasks = %targets.join(", "), "run in progress, queueing");
                        merge(&mut queued, targets);
                    } else {
                        in_flight = Some(self.start(targets));
                    }
                }

                outcome = join(&mut in_flight) => {
                    self.record(outcome, &mut summary);
                    if !queued.is_empty() {
                        in_flight = Some(self.start(std::mem::take(&mut queued)));
                    }
                }
            }
        }

        debouncer.cancel_all();
        if !queued.is_empty() {
            tracing::debug!(tasks = %queued.join(", "), "dropping queued run");
        }
        if let Some(handle) = in_flight.take() {
            tracing::info!("waiting for the current run to finish");
            self.record(handle.await, &mut summary);
        }

        tracing::info!(runs = summary.runs, failed = summary.failed_runs, "watch stopped");
        Ok(summary)
    }

    fn on_path(
        &self,
        bindings: &[WatchBinding],
        path: &Path,
        filter: &mut ContentFilter,
        debouncer: &mut Debouncer<usize>,
    ) {
        let Some(rel) = relative_str(&self.root, path) else {
            tracing::debug!(path = %path.display(), "path outside watch root");
            return;
        };
        if DEFAULT_IGNORE_SET.is_match(&rel) || self.ignore.is_match(&rel) {
            return;
        }

        let matched: Vec<usize> = bindings
            .iter()
            .enumerate()
            .filter(|(_, b)| b.matches(&rel))
            .map(|(i, _)| i)
            .collect();
        if matched.is_empty() {
            return;
        }

        if self.options.hash_filter && !filter.changed(path) {
            tracing::debug!(path = %rel, "content unchanged");
            return;
        }

        let now = Instant::now();
        for index in matched {
            tracing::debug!(path = %rel, task = %bindings[index].task(), "watch match");
            debouncer.event(index, now);
        }
    }

    fn start(&self, targets: Vec<String>) -> RunHandle {
        if self.options.print_reports {
            println!(
                "{} {}",
                style("↻").cyan(),
                style(targets.join(", ")).bold()
            );
        }
        tracing::info!(tasks = %targets.join(", "), "change detected, running");

        let scheduler = Arc::clone(&self.scheduler);
        tokio::spawn(async move { scheduler.run(&targets).await })
    }

    fn record(&self, outcome: std::result::Result<Result<RunReport>, JoinError>, summary: &mut WatchSummary) {
        summary.runs += 1;
        match outcome {
            Ok(Ok(report)) => {
                if self.options.print_reports {
                    print_results(&report);
                    print_summary(&report);
                }
                if !report.success() {
                    summary.failed_runs += 1;
                    for error in report.errors() {
                        tracing::warn!("{}", error);
                    }
                }
            }
            Ok(Err(e)) => {
                summary.failed_runs += 1;
                if e.is_structural() {
                    tracing::error!("triggered run rejected: {}", e);
                } else {
                    tracing::error!("triggered run failed: {}", e);
                }
            }
            Err(e) => {
                summary.failed_runs += 1;
                tracing::error!("triggered run aborted: {}", e);
            }
        }
    }
}

/// Send on `stop` once `signal` resolves
///
/// If the signal cannot be installed the sender is held forever, so the
/// watch loop keeps running instead of treating the error as a stop.
pub async fn stop_on<F>(signal: F, stop: oneshot::Sender<()>)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            let _ = stop.send(());
        }
        Err(e) => {
            tracing::warn!("cannot listen for the stop signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Target tasks of the fired bindings, deduplicated in binding order
fn targets_for(bindings: &[WatchBinding], fired: &[usize]) -> Vec<String> {
    let mut targets = Vec::new();
    for &index in fired {
        if let Some(binding) = bindings.get(index) {
            merge(&mut targets, vec![binding.task.clone()]);
        }
    }
    targets
}

fn merge(into: &mut Vec<String>, tasks: Vec<String>) {
    for task in tasks {
        if !into.contains(&task) {
            into.push(task);
        }
    }
}

fn join(slot: &mut Option<RunHandle>) -> impl Future<Output = std::result::Result<Result<RunReport>, JoinError>> + '_ {
    async move {
        match slot {
            Some(handle) => {
                let outcome = handle.await;
                *slot = None;
                outcome
            }
            None => std::future::pending().await,
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}

/// Path relative to `root` with forward slashes
fn relative_str(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(rel.to_string_lossy().replace('\\', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StepError;
    use crate::registry::{Action, TaskRegistry};
    use crate::scheduler::SchedulerOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ROOT: &str = "/project";

    fn counting(count: &Arc<AtomicUsize>, delay: Duration, fail: bool) -> Arc<dyn Action> {
        let count = Arc::clone(count);
        Arc::new(move || {
            let count = Arc::clone(&count);
            async move {
                tokio::time::sleep(delay).await;
                count.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(StepError::Custom("lint errors".into()))
                } else {
                    Ok(())
                }
            }
        })
    }

    fn manager(registry: TaskRegistry, root: &Path, options: WatchOptions) -> WatchManager {
        let scheduler = Arc::new(Scheduler::new(Arc::new(registry), SchedulerOptions::default()));
        WatchManager::new(scheduler, root, options).unwrap()
    }

    fn binding(task: &str, patterns: &[&str]) -> WatchBinding {
        WatchBinding::new(task.to_string(), patterns.iter().map(|p| p.to_string()).collect()).unwrap()
    }

    struct Session {
        events: mpsc::UnboundedSender<PathBuf>,
        stop: oneshot::Sender<()>,
        handle: JoinHandle<Result<WatchSummary>>,
    }

    impl Session {
        fn start(manager: WatchManager, bindings: Vec<WatchBinding>) -> Self {
            let (events, rx) = mpsc::unbounded_channel();
            let (stop, stop_rx) = oneshot::channel();
            let handle = tokio::spawn(async move { manager.run_loop(&bindings, rx, stop_rx).await });
            Self { events, stop, handle }
        }

        fn touch(&self, root: &Path, rel: &str) {
            self.events.send(root.join(rel)).unwrap();
        }

        async fn finish(self) -> WatchSummary {
            self.stop.send(()).unwrap();
            self.handle.await.unwrap().unwrap()
        }
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[test]
    fn test_binding_matches_relative_paths() {
        let b = binding("styles", &["./src/styles/**/*.less"]);
        assert_eq!(b.patterns(), &["src/styles/**/*.less".to_string()]);
        assert!(b.matches("src/styles/critical.less"));
        assert!(b.matches("src/styles/partials/grid.less"));
        assert!(!b.matches("src/scripts/app.js"));
    }

    #[test]
    fn test_invalid_binding_pattern() {
        let err = WatchBinding::new("x".into(), vec!["src/[".into()]).unwrap_err();
        assert!(matches!(err, FlowError::Glob { .. }));
    }

    #[test]
    fn test_targets_deduplicated_in_binding_order() {
        let bindings = vec![
            binding("scripts", &["src/**/*.js"]),
            binding("styles", &["src/**/*.less"]),
            binding("scripts", &["lib/**/*.js"]),
        ];
        assert_eq!(targets_for(&bindings, &[0, 1, 2]), vec!["scripts", "styles"]);
    }

    #[test]
    fn test_content_filter() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.less");
        std::fs::write(&file, "a{}").unwrap();

        let mut filter = ContentFilter::new();
        assert!(filter.changed(&file));
        assert!(!filter.changed(&file));
        std::fs::write(&file, "b{}").unwrap();
        assert!(filter.changed(&file));
        std::fs::remove_file(&file).unwrap();
        assert!(filter.changed(&file));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_events_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskRegistry::new();
        registry.register("styles", Vec::<String>::new(), counting(&count, Duration::ZERO, false)).unwrap();

        let root = Path::new(ROOT);
        let session = Session::start(
            manager(registry, root, WatchOptions::default()),
            vec![binding("styles", &["src/styles/*.less"])],
        );

        for _ in 0..5 {
            session.touch(root, "src/styles/critical.less");
            advance(20).await;
        }
        advance(500).await;

        let summary = session.finish().await;
        assert_eq!(summary, WatchSummary { runs: 1, failed_runs: 0 });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bindings_sharing_a_target_run_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskRegistry::new();
        registry.register("scripts", Vec::<String>::new(), counting(&count, Duration::ZERO, false)).unwrap();

        let root = Path::new(ROOT);
        let session = Session::start(
            manager(registry, root, WatchOptions::default()),
            vec![
                binding("scripts", &["src/**/*.js"]),
                binding("scripts", &["src/scripts/*.js"]),
            ],
        );

        session.touch(root, "src/scripts/app.js");
        advance(500).await;

        assert_eq!(session.finish().await.runs, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_during_run_are_queued_and_merged() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskRegistry::new();
        registry.register("styles", Vec::<String>::new(), counting(&count, Duration::from_millis(300), false)).unwrap();

        let root = Path::new(ROOT);
        let session = Session::start(
            manager(registry, root, WatchOptions::default()),
            vec![binding("styles", &["src/**"])],
        );

        // First run fires at 100ms and lasts until 400ms
        session.touch(root, "src/a.less");
        advance(150).await;
        // Both of these fire while the first run is in flight
        session.touch(root, "src/b.less");
        advance(120).await;
        session.touch(root, "src/c.less");
        advance(1000).await;

        let summary = session.finish().await;
        assert_eq!(summary.runs, 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_run() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskRegistry::new();
        registry.register("styles", Vec::<String>::new(), counting(&count, Duration::from_millis(300), false)).unwrap();

        let root = Path::new(ROOT);
        let session = Session::start(
            manager(registry, root, WatchOptions::default()),
            vec![binding("styles", &["src/**"])],
        );

        session.touch(root, "src/a.less");
        advance(200).await;
        // Pending timer that stop must cancel
        session.touch(root, "src/b.less");

        let summary = session.finish().await;
        assert_eq!(summary.runs, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_end_the_loop() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskRegistry::new();
        registry.register("scripts:lint", Vec::<String>::new(), counting(&count, Duration::ZERO, true)).unwrap();

        let root = Path::new(ROOT);
        let session = Session::start(
            manager(registry, root, WatchOptions::default()),
            vec![
                binding("scripts:lint", &["src/**/*.js"]),
                binding("missing", &["docs/**"]),
            ],
        );

        session.touch(root, "src/app.js");
        advance(300).await;
        session.touch(root, "docs/readme.md");
        advance(300).await;
        session.touch(root, "src/app.js");
        advance(300).await;

        let summary = session.finish().await;
        assert_eq!(summary, WatchSummary { runs: 3, failed_runs: 3 });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_paths_do_not_trigger() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskRegistry::new();
        registry.register("all", Vec::<String>::new(), counting(&count, Duration::ZERO, false)).unwrap();

        let root = Path::new(ROOT);
        let options = WatchOptions {
            ignore: vec!["_includes/**".into()],
            ..Default::default()
        };
        let session = Session::start(manager(registry, root, options), vec![binding("all", &["**"])]);

        session.touch(root, "node_modules/less/index.js");
        session.touch(root, ".git/HEAD");
        session.touch(root, "_includes/criticalCSS.html");
        session.events.send(PathBuf::from("/elsewhere/file.js")).unwrap();
        advance(500).await;

        assert_eq!(session.finish().await.runs, 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_on_forwards_the_signal() {
        let (tx, mut rx) = oneshot::channel();
        tokio::spawn(stop_on(async { Ok(()) }, tx));
        advance(10).await;
        assert_eq!(rx.try_recv(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_on_signal_error_keeps_watching() {
        let (tx, mut rx) = oneshot::channel::<()>();
        tokio::spawn(stop_on(async { Err(std::io::Error::other("no signal handler")) }, tx));
        advance(1_000).await;
        assert_eq!(rx.try_recv(), Err(oneshot::error::TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hash_filter_skips_identical_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/site.less"), "a{}").unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskRegistry::new();
        registry.register("styles", Vec::<String>::new(), counting(&count, Duration::ZERO, false)).unwrap();

        let options = WatchOptions {
            hash_filter: true,
            ..Default::default()
        };
        let session = Session::start(manager(registry, &root, options), vec![binding("styles", &["src/*.less"])]);

        session.touch(&root, "src/site.less");
        advance(300).await;
        // Same bytes written again
        std::fs::write(root.join("src/site.less"), "a{}").unwrap();
        session.touch(&root, "src/site.less");
        advance(300).await;
        std::fs::write(root.join("src/site.less"), "b{}").unwrap();
        session.touch(&root, "src/site.less");
        advance(300).await;

        assert_eq!(session.finish().await.runs, 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
