//! Queue-based state machine driving tasks to completion.
//!
//! A single coordinating loop owns the task graph and the signature map and
//! issues non-blocking submit/poll calls to the execution backend. Tasks move
//! between four queues keyed by task id (wait, start, run, done) and every
//! status transition happens inside this loop.
//!
//! Each iteration promotes ready tasks out of `wait` (short-circuiting
//! unchanged ones straight to success), issues the next command of every
//! `start` task to the backend, and polls every `run` task. When no queue
//! changes size over a full iteration the loop is quiescent: it checkpoints
//! the signature map and pauses before re-polling. An iteration with no
//! progress, nothing running and tasks still waiting is a deadlock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use camino::Utf8PathBuf;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::backend::{ExecutionBackend, JobHandle, JobState};
use crate::error::ScheduleError;
use crate::graph::{FileRegistry, Task, TaskId, TaskStatus};
use crate::store::{SignatureMap, SignatureMode, SignatureStore};

/// Options for a scheduler run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Location of the persisted signature store.
    pub store_path: Utf8PathBuf,
    /// How signatures are computed.
    pub mode: SignatureMode,
    /// Pause between polls at quiescent points.
    pub poll_interval: Duration,
    /// Draw a progress bar on stderr.
    pub progress: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            store_path: ".kumade.json".into(),
            mode: SignatureMode::default(),
            poll_interval: Duration::from_millis(500),
            progress: true,
        }
    }
}

/// Terminal outcome of one task.
#[derive(Debug, Serialize)]
pub struct ReportEntry {
    pub task: TaskId,
    /// First output path, for humans.
    pub label: String,
    pub status: TaskStatus,
    /// Failure detail, when there is one.
    pub error: Option<String>,
}

/// Full status table of a finished run. The run completes even when tasks
/// fail; inspect the report to find out how it went. Serializes to JSON for
/// machine consumers.
#[derive(Debug, Serialize)]
pub struct RunReport {
    entries: Vec<ReportEntry>,
}

impl RunReport {
    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn is_success(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.status == TaskStatus::Success)
    }

    pub fn status_of(&self, task: TaskId) -> Option<TaskStatus> {
        self.entries
            .iter()
            .find(|e| e.task == task)
            .map(|e| e.status)
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for entry in &self.entries {
            let status = format!("{:>7}", entry.status.to_string());
            let status = match entry.status {
                TaskStatus::Success => style(status).green(),
                TaskStatus::Fail => style(status).red(),
                TaskStatus::DepFail => style(status).yellow(),
                _ => style(status),
            };

            writeln!(f, "{status}  {}", entry.label)?;
            if let Some(error) = &entry.error {
                writeln!(f, "         {error}")?;
            }
        }
        Ok(())
    }
}

pub(crate) struct Scheduler<'a, B: ExecutionBackend> {
    tasks: &'a mut [Task],
    registry: &'a FileRegistry,
    backend: &'a mut B,
    store: SignatureStore,
    poll_interval: Duration,
    progress: bool,
}

impl<'a, B: ExecutionBackend> Scheduler<'a, B> {
    pub(crate) fn new(
        tasks: &'a mut [Task],
        registry: &'a FileRegistry,
        backend: &'a mut B,
        options: &RunOptions,
    ) -> Self {
        Self {
            tasks,
            registry,
            backend,
            store: SignatureStore::new(options.store_path.clone(), options.mode),
            poll_interval: options.poll_interval,
            progress: options.progress,
        }
    }

    pub(crate) fn run(&mut self, abort: Option<&AtomicBool>) -> Result<RunReport, ScheduleError> {
        for task in self.tasks.iter_mut() {
            task.set_status(TaskStatus::Waiting);
            task.cursor = 0;
        }

        let mut saved = self.store.load();
        let fresh = self.snapshot_known_paths();

        // paths whose signature was recomputed this run; fresh is stale for
        // them and must not overwrite
        let mut refreshed: BTreeSet<String> = BTreeSet::new();

        let mut wait: BTreeSet<TaskId> = (0..self.tasks.len()).map(TaskId).collect();
        let mut start: BTreeSet<TaskId> = BTreeSet::new();
        let mut run: BTreeMap<TaskId, JobHandle> = BTreeMap::new();
        let mut done: Vec<TaskId> = Vec::new();
        let mut errors: BTreeMap<TaskId, String> = BTreeMap::new();

        let bar = if self.progress {
            let bar = ProgressBar::new(self.tasks.len() as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                    .expect("Error setting progress bar template")
                    .progress_chars("#>-"),
            );
            bar
        } else {
            ProgressBar::hidden()
        };

        loop {
            if let Some(flag) = abort
                && flag.load(Ordering::Relaxed)
            {
                tracing::info!("abort requested, cancelling in-flight work");

                for &handle in run.values() {
                    self.backend.cancel(handle).ok();
                }
                for id in wait.iter().chain(start.iter()).chain(run.keys()) {
                    self.tasks[id.0].set_status(TaskStatus::Fail);
                    errors.insert(*id, "run aborted".to_string());
                    done.push(*id);
                }
                break;
            }

            let sizes = (wait.len(), start.len(), run.len(), done.len());

            // 1. promote waiting tasks
            for id in wait.clone() {
                match readiness(self.tasks, self.registry, id) {
                    Readiness::Blocked => {}
                    Readiness::DepFailed => {
                        wait.remove(&id);
                        self.tasks[id.0].set_status(TaskStatus::DepFail);
                        done.push(id);
                        bar.inc(1);
                        tracing::debug!(task = %id, "dependency failed");
                    }
                    Readiness::Ready => {
                        wait.remove(&id);

                        if can_skip(&self.tasks[id.0], self.registry, &saved, &fresh) {
                            self.tasks[id.0].set_status(TaskStatus::Success);
                            done.push(id);
                            bar.inc(1);
                            tracing::debug!(task = %id, "up to date, skipping");
                        } else {
                            self.tasks[id.0].set_status(TaskStatus::Running);
                            start.insert(id);
                            tracing::debug!(task = %id, "ready to run");
                        }
                    }
                }
            }

            // 2. issue the next command of each started task, or verify its
            //    outputs once the command queue is drained
            for id in start.clone() {
                start.remove(&id);

                let next_cmd = {
                    let task = &mut self.tasks[id.0];
                    if task.cursor < task.commands.len() {
                        let argv = task.commands[task.cursor].clone();
                        task.cursor += 1;
                        Some(argv)
                    } else {
                        None
                    }
                };

                match next_cmd {
                    Some(argv) => match self.backend.submit(&argv) {
                        Ok(handle) => {
                            tracing::debug!(task = %id, command = ?argv, "submitted");
                            run.insert(id, handle);
                        }
                        Err(err) => {
                            self.tasks[id.0].set_status(TaskStatus::Fail);
                            errors.insert(id, format!("submit failed: {err:#}"));
                            done.push(id);
                            bar.inc(1);
                        }
                    },
                    None => {
                        let outputs: Vec<String> = self.tasks[id.0]
                            .outputs
                            .iter()
                            .map(|&fid| self.registry.path(fid).to_string())
                            .collect();
                        let sums = self.store.snapshot(&outputs);

                        if let Some(missing) = outputs.iter().find(|p| !sums.contains_key(p.as_str())) {
                            self.tasks[id.0].set_status(TaskStatus::Fail);
                            errors.insert(id, format!("output {missing:?} was not generated"));
                            done.push(id);
                            bar.inc(1);
                        } else {
                            self.record_success(id, sums, &fresh, &mut saved, &mut refreshed);
                            done.push(id);
                            bar.inc(1);
                            tracing::debug!(task = %id, "finished");
                        }
                    }
                }
            }

            // 3. poll the backend for every running task
            for (id, handle) in run.clone() {
                match self.backend.poll(handle) {
                    Ok(JobState::Succeeded) => {
                        run.remove(&id);
                        start.insert(id);
                    }
                    Ok(JobState::Failed) => {
                        run.remove(&id);
                        self.tasks[id.0].set_status(TaskStatus::Fail);
                        errors.insert(id, "command exited with failure".to_string());
                        done.push(id);
                        bar.inc(1);
                    }
                    Ok(JobState::Pending | JobState::Running) => {}
                    Err(err) => {
                        run.remove(&id);
                        self.tasks[id.0].set_status(TaskStatus::Fail);
                        errors.insert(id, format!("poll failed: {err:#}"));
                        done.push(id);
                        bar.inc(1);
                    }
                }
            }

            if wait.is_empty() && start.is_empty() && run.is_empty() {
                break;
            }

            if sizes == (wait.len(), start.len(), run.len(), done.len()) {
                if run.is_empty() && start.is_empty() {
                    let stuck = wait
                        .iter()
                        .map(|&id| self.tasks[id.0].label(self.registry))
                        .collect();
                    bar.abandon();
                    return Err(ScheduleError::Deadlock(stuck));
                }

                // quiescent point: checkpoint, then pause before re-polling
                self.store.save(&saved)?;
                std::thread::sleep(self.poll_interval);
            }
        }

        self.store.save(&saved)?;
        bar.finish_and_clear();

        let mut entries: Vec<ReportEntry> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, task)| ReportEntry {
                task: TaskId(i),
                label: task.label(self.registry),
                status: task.status(),
                error: errors.remove(&TaskId(i)),
            })
            .collect();
        entries.sort_by_key(|e| e.task);

        let failed = entries
            .iter()
            .filter(|e| e.status != TaskStatus::Success)
            .count();
        if failed == 0 {
            tracing::info!(tasks = entries.len(), "run complete");
        } else {
            tracing::info!(tasks = entries.len(), failed, "run complete with failures");
        }

        Ok(RunReport { entries })
    }

    /// Fresh signatures of every registered file plus every command's
    /// leading program path, taken once at run start.
    fn snapshot_known_paths(&self) -> SignatureMap {
        let mut paths: BTreeSet<String> =
            self.registry.iter().map(|f| f.path().to_string()).collect();

        for task in self.tasks.iter() {
            for cmd in &task.commands {
                if let Some(program) = cmd.first() {
                    paths.insert(program.clone());
                }
            }
        }

        let paths: Vec<String> = paths.into_iter().collect();
        self.store.snapshot(&paths)
    }

    /// Marks a task successful and folds its signatures into the persisted
    /// map: freshly computed output signatures, plus the run-start signatures
    /// of its inputs and programs so the next run can recognize them as
    /// unchanged.
    fn record_success(
        &mut self,
        id: TaskId,
        output_sums: SignatureMap,
        fresh: &SignatureMap,
        saved: &mut SignatureMap,
        refreshed: &mut BTreeSet<String>,
    ) {
        self.tasks[id.0].set_status(TaskStatus::Success);

        let task = &self.tasks[id.0];
        let mut tracked: Vec<&str> = task
            .inputs
            .iter()
            .map(|&fid| self.registry.path(fid).as_str())
            .collect();
        tracked.extend(task.commands.iter().filter_map(|cmd| cmd.first()).map(String::as_str));

        for path in tracked {
            if refreshed.contains(path) {
                continue;
            }
            if let Some(sig) = fresh.get(path) {
                saved.insert(path.to_string(), sig.clone());
            }
        }

        for (path, sig) in output_sums {
            refreshed.insert(path.clone());
            saved.insert(path, sig);
        }
    }
}

enum Readiness {
    Ready,
    Blocked,
    DepFailed,
}

/// A waiting task is ready when every input's producer succeeded or the
/// input has no producer at all. A failed producer condemns the task.
fn readiness(tasks: &[Task], registry: &FileRegistry, id: TaskId) -> Readiness {
    let mut blocked = false;

    for &fid in &tasks[id.0].inputs {
        if let Some(producer) = registry.get(fid).producer() {
            match tasks[producer.0].status() {
                TaskStatus::Fail | TaskStatus::DepFail => return Readiness::DepFailed,
                TaskStatus::Success => {}
                _ => blocked = true,
            }
        }
    }

    if blocked {
        Readiness::Blocked
    } else {
        Readiness::Ready
    }
}

/// A ready task short-circuits to success when nothing it depends on changed
/// since the last successful run: every input has equal signatures in the
/// persisted map and the fresh snapshot, every command's program is either
/// untracked or likewise unchanged, and every declared output still exists.
fn can_skip(
    task: &Task,
    registry: &FileRegistry,
    saved: &SignatureMap,
    fresh: &SignatureMap,
) -> bool {
    for &fid in &task.inputs {
        let path = registry.path(fid).as_str();
        match (saved.get(path), fresh.get(path)) {
            (Some(a), Some(b)) if a == b => {}
            _ => return false,
        }
    }

    for cmd in &task.commands {
        if let Some(program) = cmd.first() {
            match (saved.get(program), fresh.get(program)) {
                (Some(a), Some(b)) if a == b => {}
                // programs resolved through PATH never appear in either
                // snapshot and don't block skipping
                (None, None) => {}
                _ => return false,
            }
        }
    }

    task.outputs
        .iter()
        .all(|&fid| fresh.contains_key(registry.path(fid).as_str()))
}
