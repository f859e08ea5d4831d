use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors raised while building or resolving the task graph. All of them
/// abort the run before any task starts.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Cycle detected between tasks: {}", members.join(", "))]
    Cycle { members: Vec<String> },

    #[error("Tasks '{first}' and '{second}' both declare output '{path}'")]
    OutputConflict {
        path: Utf8PathBuf,
        first: String,
        second: String,
    },

    #[error("Task '{0}' is registered twice")]
    DuplicateTask(String),

    #[error("Task '{0}' not found")]
    UnknownTarget(String),

    #[error("Task '{id}' not found, referenced by '{referenced_by}'")]
    UnknownDependency { id: String, referenced_by: String },

    #[error("Task '{task}' has no output '{property}'")]
    UnknownOutput { task: String, property: String },

    #[error("Rule '{rule}' was asked for '{requested}' but produced '{produced}'")]
    RuleMismatch {
        rule: String,
        requested: String,
        produced: String,
    },

    #[error("Plan was resolved from a different task graph")]
    ForeignPlan,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode history of task '{task}': {reason}")]
    Encode { task: String, reason: String },

    #[error("History of task '{task}' is corrupt: {reason}")]
    Corrupt { task: String, reason: String },
}

/// The reason a single task ended up `FAILED`.
#[derive(Debug, Error)]
pub enum TaskFailure {
    #[error("{0:#}")]
    Action(anyhow::Error),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Task exceeded its timeout of {0:?}")]
    TimeoutExceeded(Duration),

    #[error("Dependency '{0}' failed")]
    DependencyFailed(String),

    #[error("Run was cancelled")]
    Cancelled,

    #[error("Couldn't start action thread:\n{0}")]
    Spawn(std::io::Error),

    #[error("Couldn't fingerprint files:\n{0}")]
    Snapshot(std::io::Error),

    #[error("Couldn't record history:\n{0}")]
    Commit(StoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    #[error("Task '{task}' uses unknown action '{action}'")]
    UnknownAction { task: String, action: String },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to build worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[cfg(feature = "watch")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Notify(#[from] notify::Error),
}
