//! Execution backends: where resolved commands actually run.
//!
//! The scheduler only ever talks to a backend through non-blocking
//! submit/poll/cancel calls, so batch systems with long round-trip latency
//! fit behind the same trait as local child processes. Retry policy, if any,
//! belongs to the backend; the scheduler treats a reported failure as final.

use std::collections::HashMap;
use std::process::{Child, Command};

use anyhow::{Context, bail};

/// Backend-reported state of a submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Opaque identifier for a submitted command, scoped to one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle(pub u64);

/// A remote/batch job runner consulted through submit/poll/cancel
/// primitives. Implementations are user-supplied; errors are `anyhow` like
/// any other userland failure.
pub trait ExecutionBackend {
    /// Queues one command for execution. The argv is never empty.
    fn submit(&mut self, argv: &[String]) -> anyhow::Result<JobHandle>;

    /// Non-blocking status check for a previously submitted command.
    fn poll(&mut self, handle: JobHandle) -> anyhow::Result<JobState>;

    /// Best-effort cancellation of an in-flight command.
    fn cancel(&mut self, handle: JobHandle) -> anyhow::Result<()>;
}

/// Runs commands as child processes on the local machine. The reference
/// backend, and the natural one for development.
#[derive(Debug, Default)]
pub struct LocalBackend {
    next: u64,
    jobs: HashMap<u64, LocalJob>,
}

#[derive(Debug)]
enum LocalJob {
    Running(Child),
    Done(JobState),
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionBackend for LocalBackend {
    fn submit(&mut self, argv: &[String]) -> anyhow::Result<JobHandle> {
        let Some((program, args)) = argv.split_first() else {
            bail!("cannot submit an empty command");
        };

        let child = Command::new(program)
            .args(args)
            .spawn()
            .with_context(|| format!("failed to spawn {program:?}"))?;

        let id = self.next;
        self.next += 1;
        self.jobs.insert(id, LocalJob::Running(child));

        Ok(JobHandle(id))
    }

    fn poll(&mut self, handle: JobHandle) -> anyhow::Result<JobState> {
        let Some(job) = self.jobs.get_mut(&handle.0) else {
            bail!("unknown job handle {handle:?}");
        };

        match job {
            LocalJob::Done(state) => Ok(*state),
            LocalJob::Running(child) => match child.try_wait()? {
                None => Ok(JobState::Running),
                Some(status) => {
                    let state = if status.success() {
                        JobState::Succeeded
                    } else {
                        JobState::Failed
                    };
                    *job = LocalJob::Done(state);
                    Ok(state)
                }
            },
        }
    }

    fn cancel(&mut self, handle: JobHandle) -> anyhow::Result<()> {
        if let Some(job) = self.jobs.get_mut(&handle.0)
            && let LocalJob::Running(child) = job
        {
            child.kill().ok();
            child.wait().ok();
            *job = LocalJob::Done(JobState::Failed);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn wait_terminal(backend: &mut LocalBackend, handle: JobHandle) -> JobState {
        for _ in 0..500 {
            let state = backend.poll(handle).unwrap();
            if state.is_terminal() {
                return state;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("job never finished");
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn exit_codes_map_to_job_states() {
        let mut backend = LocalBackend::new();

        let ok = backend.submit(&argv(&["true"])).unwrap();
        assert_eq!(wait_terminal(&mut backend, ok), JobState::Succeeded);

        let bad = backend.submit(&argv(&["false"])).unwrap();
        assert_eq!(wait_terminal(&mut backend, bad), JobState::Failed);

        // polling after completion stays terminal
        assert_eq!(backend.poll(ok).unwrap(), JobState::Succeeded);
    }

    #[test]
    fn empty_and_unknown_submissions_are_errors() {
        let mut backend = LocalBackend::new();
        assert!(backend.submit(&[]).is_err());
        assert!(backend.submit(&argv(&["no-such-binary-kumade"])).is_err());
        assert!(backend.poll(JobHandle(999)).is_err());
    }

    #[test]
    fn cancel_kills_a_running_job() {
        let mut backend = LocalBackend::new();
        let handle = backend.submit(&argv(&["sleep", "30"])).unwrap();

        backend.cancel(handle).unwrap();
        assert_eq!(backend.poll(handle).unwrap(), JobState::Failed);
    }
}
