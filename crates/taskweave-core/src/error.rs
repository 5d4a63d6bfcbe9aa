use thiserror::Error;

/// Top-level error type for the taskweave engine.
///
/// Each variant corresponds to a subsystem that can produce errors. Only
/// configuration-time failures abort a run; task-level failures are captured
/// into run state instead of being returned.
#[derive(Error, Debug)]
pub enum TaskweaveError {
    /// Invalid or missing configuration (fatal, raised before any task runs).
    #[error("Config error: {0}")]
    Config(String),

    /// A strategy could not be resolved or constructed from the module registry.
    #[error("Registry error: {0}")]
    Registry(String),

    /// The task graph handed to the engine is malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A scheduling decision could not be applied.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// No worker profile can serve a task.
    #[error("Routing error: {0}")]
    Routing(String),

    /// The execution backend failed to run a task.
    #[error("Execution error: {0}")]
    Execution(String),

    /// A dispatched execution exceeded its deadline.
    #[error("Execution timed out after {0}s")]
    Timeout(u64),

    /// The judge (or its rubric evaluator) failed.
    #[error("Judge error: {0}")]
    Judge(String),

    /// An invariant of the orchestration loop was violated.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl TaskweaveError {
    /// Whether the failure is worth another attempt.
    ///
    /// Execution, timeout and judge failures feed the retry path; everything
    /// else is a configuration or programming error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TaskweaveError::Execution(_) | TaskweaveError::Timeout(_) | TaskweaveError::Judge(_)
        )
    }
}

/// A convenience `Result` alias using [`TaskweaveError`].
pub type TaskweaveResult<T> = Result<T, TaskweaveError>;
