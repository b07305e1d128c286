//! The autonomous loop run by the `worker` subcommand.
//!
//! Task files already waiting in `input/` are handled first, then new ones
//! are picked up as the watcher reports them. Each file goes through
//! read -> validate -> execute -> write result -> archive. At most
//! `max_concurrent_tasks` files are in flight at once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::environment::Environment;
use crate::health::{disk_usage, run_checks, DISK_USAGE_WARN_PERCENT};
use crate::processor::TaskProcessor;
use crate::task::{ResultStatus, TaskRecord};
use crate::{glog, glog_debug, glog_error, glog_trace, glog_warn, Error, Result};

/// What happened to a single task file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Done { task_id: String, status: ResultStatus },
    /// Left in `input/`: unreadable JSON or missing required fields.
    Invalid(String),
    /// The file was gone by the time it was read (already handled).
    Missing,
}

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub completed: usize,
    pub failed: usize,
    pub invalid: usize,
    pub errors: usize,
}

impl LoopStats {
    fn record(&mut self, result: &Result<FileOutcome>) {
        match result {
            Ok(FileOutcome::Done {
                status: ResultStatus::Completed,
                ..
            }) => self.completed += 1,
            Ok(FileOutcome::Done {
                status: ResultStatus::Failed,
                ..
            }) => self.failed += 1,
            Ok(FileOutcome::Invalid(_)) => self.invalid += 1,
            Ok(FileOutcome::Missing) => {}
            Err(_) => self.errors += 1,
        }
    }
}

/// Process one task file end to end.
pub async fn process_task_file(processor: &TaskProcessor, path: &Path) -> Result<FileOutcome> {
    glog!("Processing task file {}", path.display());

    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            glog_debug!("Task file vanished before processing: {}", path.display());
            return Ok(FileOutcome::Missing);
        }
        Err(e) => return Err(e.into()),
    };

    let task = match TaskRecord::from_json(&content) {
        Ok(task) => task,
        Err(e) => {
            glog_error!("Invalid task data in {}: {}", path.display(), e);
            return Ok(FileOutcome::Invalid(e.to_string()));
        }
    };

    let record = processor.execute_and_save(task).await?;
    processor.workspace().archive(path).await?;
    glog!(
        "Task {} finished with status {:?}",
        record.task_id,
        record.status
    );
    Ok(FileOutcome::Done {
        task_id: record.task_id,
        status: record.status,
    })
}

/// `*.json` files currently in `dir`, sorted by name.
pub fn pending_task_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| is_task_file(p) && p.is_file())
        .collect();
    files.sort();
    Ok(files)
}

fn is_task_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

/// Events that mean a task file may now be complete in the directory.
fn is_arrival(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Name(
                RenameMode::To | RenameMode::Both | RenameMode::Any
            ))
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

/// Watch `dir` (non-recursively) and send arriving task files to `tx`.
///
/// The returned watcher must be kept alive for watching to continue.
pub fn watch_input(dir: &Path, tx: mpsc::UnboundedSender<PathBuf>) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) if is_arrival(&event.kind) => {
                for path in event.paths {
                    if is_task_file(&path) && path.is_file() {
                        let _ = tx.send(path);
                    }
                }
            }
            Ok(event) => glog_trace!("Ignoring watch event {:?}", event.kind),
            Err(e) => glog_warn!("Watch error: {}", e),
        },
        notify::Config::default(),
    )?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Paths currently scheduled. The flag records an arrival event for a path
/// that was already in flight; such a path goes through the queue again once
/// the current attempt finishes.
#[derive(Debug, Clone, Default)]
struct InFlight(Arc<Mutex<HashMap<PathBuf, bool>>>);

impl InFlight {
    /// Returns true when `path` was idle and is now claimed.
    fn claim(&self, path: &Path) -> bool {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        match guard.get_mut(path) {
            Some(arrived_again) => {
                *arrived_again = true;
                false
            }
            None => {
                guard.insert(path.to_path_buf(), false);
                true
            }
        }
    }

    /// Release `path`. Returns true when it arrived again while claimed.
    fn release(&self, path: &Path) -> bool {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path)
            .unwrap_or(false)
    }
}

pub struct AgentLoop {
    processor: TaskProcessor,
    env: Environment,
    config: Config,
    max_concurrent: usize,
    health_interval: Duration,
}

impl AgentLoop {
    pub fn new(processor: TaskProcessor, env: Environment, config: Config) -> Self {
        Self {
            max_concurrent: config.max_concurrent_tasks.max(1),
            health_interval: Duration::from_secs(config.health_check_interval.max(1)),
            processor,
            env,
            config,
        }
    }

    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// Run until `shutdown` is cancelled, then wait for in-flight tasks.
    pub async fn run(self, shutdown: CancellationToken) -> Result<LoopStats> {
        let input_dir = self.processor.workspace().input_dir();
        glog!("Starting agent loop on {}", input_dir.display());

        let (tx, mut rx) = mpsc::unbounded_channel();
        // Watch before scanning so files arriving in between are not missed.
        let _watcher = watch_input(&input_dir, tx.clone())?;
        glog!("File monitoring started");

        for path in pending_task_files(&input_dir)? {
            let _ = tx.send(path);
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let in_flight = InFlight::default();
        let mut tasks: JoinSet<Result<FileOutcome>> = JoinSet::new();
        let mut stats = LoopStats::default();
        let mut health = tokio::time::interval(self.health_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    glog!("Agent loop received shutdown request");
                    break;
                }
                Some(path) = rx.recv() => {
                    self.schedule(path, &semaphore, &in_flight, &tx, &mut tasks);
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    stats.record(&flatten(joined));
                }
                _ = health.tick() => self.health_check(),
            }
        }

        if !tasks.is_empty() {
            glog!("Waiting for {} in-flight task(s)", tasks.len());
        }
        while let Some(joined) = tasks.join_next().await {
            stats.record(&flatten(joined));
        }
        glog!("Agent shutdown complete: {:?}", stats);
        Ok(stats)
    }

    fn schedule(
        &self,
        path: PathBuf,
        semaphore: &Arc<Semaphore>,
        in_flight: &InFlight,
        requeue: &mpsc::UnboundedSender<PathBuf>,
        tasks: &mut JoinSet<Result<FileOutcome>>,
    ) {
        if !in_flight.claim(&path) {
            glog_debug!("Already in flight, will revisit: {}", path.display());
            return;
        }

        let processor = self.processor.clone();
        let semaphore = semaphore.clone();
        let in_flight = in_flight.clone();
        let requeue = requeue.clone();
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| Error::TaskJoin(e.to_string()))?;
            let result = process_task_file(&processor, &path).await;
            if let Err(e) = &result {
                glog_error!("Error processing task file {}: {}", path.display(), e);
            }
            if in_flight.release(&path) {
                glog_debug!("Task file changed while in flight: {}", path.display());
                let _ = requeue.send(path);
            }
            result
        });
    }

    fn health_check(&self) {
        let workspace = self.processor.workspace();
        let report = run_checks(workspace, &self.env, &self.config);
        for failure in report.failures() {
            glog_warn!(
                "Health check failed: {} ({})",
                failure.name,
                failure.detail.as_deref().unwrap_or("no detail")
            );
        }

        match disk_usage(workspace.data_root()) {
            Ok(usage) if usage.is_low() => glog_warn!(
                "Low disk space: {:.1}% used (threshold {}%)",
                usage.percent_used(),
                DISK_USAGE_WARN_PERCENT
            ),
            Ok(usage) => glog_debug!("Disk usage {:.1}%", usage.percent_used()),
            Err(e) => glog_warn!("Could not read disk usage: {}", e),
        }
    }
}

fn flatten(
    joined: std::result::Result<Result<FileOutcome>, tokio::task::JoinError>,
) -> Result<FileOutcome> {
    joined.map_err(|e| Error::TaskJoin(e.to_string()))?
}
