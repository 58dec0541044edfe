use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors raised while parsing a rule file, before any task exists.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line {line}: unrecognized line: {text:?}")]
    Malformed { line: usize, text: String },

    #[error("line {line}: command line has no preceding rule: {text:?}")]
    OrphanCommand { line: usize, text: String },

    #[error("line {line}: redefined variable {name:?}")]
    Redefined { line: usize, name: String },

    #[error("line {line}: variable definition with an empty name")]
    EmptyName { line: usize },
}

/// Errors raised while expanding a rule template into concrete tasks.
#[derive(Debug, Error)]
pub enum ExpandError {
    #[error("unknown variable {name:?} referenced in {expr:?}")]
    UnknownVariable { name: String, expr: String },

    #[error("{kind} index {index} out of range (task has {len}) in {expr:?}")]
    IndexOutOfRange {
        kind: &'static str,
        index: usize,
        len: usize,
        expr: String,
    },

    #[error("circular variable reference while expanding {expr:?}")]
    CircularReference { expr: String },

    #[error("file {path:?} is produced by more than one task")]
    DuplicateProducer { path: Utf8PathBuf },
}

/// Errors raised by [`crate::Project::load`].
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("couldn't read rule file:\n{0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Expand(#[from] ExpandError),
}

/// Errors raised while persisting the signature store. Loading is lenient
/// (a missing or corrupt store reads as empty) and has no error type.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("couldn't write signature store:\n{0}")]
    Io(#[from] std::io::Error),

    #[error("couldn't serialize signature store:\n{0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors raised by [`crate::Project::plan`].
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("dependency cycle through task {task:?}")]
    Cycle { task: String },
}

/// Errors that abort a scheduler run. Ordinary task failures do not abort;
/// they are reported through the run report instead.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("no task can make progress; stuck tasks: {}", .0.join(", "))]
    Deadlock(Vec<String>),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Top-level error type covering every way a build can go wrong.
#[derive(Debug, Error)]
pub enum KumadeError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
