use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;
use uuid::Uuid;

/// Ordinal complexity estimate attached to a task by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Complexity {
    Trivial,
    Simple,
    Moderate,
    Complex,
    VeryComplex,
}

impl Complexity {
    /// Normalised level in `[0, 1]`, trivial = 0 and very-complex = 1.
    pub fn level(self) -> f64 {
        match self {
            Complexity::Trivial => 0.0,
            Complexity::Simple => 0.25,
            Complexity::Moderate => 0.5,
            Complexity::Complex => 0.75,
            Complexity::VeryComplex => 1.0,
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Complexity::Trivial => write!(f, "trivial"),
            Complexity::Simple => write!(f, "simple"),
            Complexity::Moderate => write!(f, "moderate"),
            Complexity::Complex => write!(f, "complex"),
            Complexity::VeryComplex => write!(f, "very-complex"),
        }
    }
}

/// How an acceptance criterion is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CriterionKind {
    Deterministic,
    LlmEvaluated,
}

/// One acceptance criterion of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub kind: CriterionKind,
    /// Relative weight in `[0, 1]`.
    pub weight: f64,
    pub description: String,
}

/// Immutable description of a unit of work, produced once by a planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub description: String,
    #[serde(default)]
    pub required_skills: BTreeSet<String>,
    #[serde(default)]
    pub required_tools: BTreeSet<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_complexity")]
    pub complexity: Complexity,
    /// Execution deadline in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_complexity() -> Complexity {
    Complexity::Moderate
}

fn default_timeout_secs() -> u64 {
    300
}

impl TaskDefinition {
    pub fn new(
        id: impl Into<String>,
        task_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            description: description.into(),
            required_skills: BTreeSet::new(),
            required_tools: BTreeSet::new(),
            acceptance_criteria: Vec::new(),
            dependencies: Vec::new(),
            complexity: default_complexity(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_criterion(
        mut self,
        kind: CriterionKind,
        weight: f64,
        description: impl Into<String>,
    ) -> Self {
        self.acceptance_criteria.push(AcceptanceCriterion {
            kind,
            weight,
            description: description.into(),
        });
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Queued,
    Assigned,
    Executing,
    Evaluating,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Completed and failed are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::Executing => write!(f, "executing"),
            TaskStatus::Evaluating => write!(f, "evaluating"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One execution try of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub worker_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tokens_used: u64,
    pub error: Option<String>,
}

/// Output accepted by the judge for a completed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub worker_id: Uuid,
    pub output: Option<String>,
    pub verdict: JudgeResult,
}

/// Mutable runtime record of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub task: TaskDefinition,
    pub status: TaskStatus,
    pub assigned_worker_id: Option<Uuid>,
    /// Profile the router picked for the current or last attempt.
    pub assigned_profile_id: Option<String>,
    /// Append-only.
    pub attempts: Vec<TaskAttempt>,
    pub result: Option<TaskResult>,
    /// Judge feedback from the most recent rejected attempt.
    #[serde(default)]
    pub feedback: Vec<String>,
}

impl TaskState {
    pub fn new(task: TaskDefinition) -> Self {
        Self {
            task,
            status: TaskStatus::Pending,
            assigned_worker_id: None,
            assigned_profile_id: None,
            attempts: Vec::new(),
            result: None,
            feedback: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.task.id
    }

    /// Attempts that have finished, successfully or not.
    pub fn finished_attempts(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.completed_at.is_some())
            .count()
    }

    /// Error of the most recent finished attempt, if it failed.
    pub fn last_error(&self) -> Option<&str> {
        self.attempts
            .iter()
            .rev()
            .find(|a| a.completed_at.is_some())
            .and_then(|a| a.error.as_deref())
    }

    /// Pending and every dependency is in `completed_ids`.
    pub fn is_ready(&self, completed_ids: &HashSet<&str>) -> bool {
        self.status == TaskStatus::Pending
            && self
                .task
                .dependencies
                .iter()
                .all(|dep| completed_ids.contains(dep.as_str()))
    }
}

/// Model a worker profile runs on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            provider: "claude-code".to_string(),
            model: "sonnet".to_string(),
            max_tokens: None,
        }
    }
}

/// What a worker profile is able to do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub skills: BTreeSet<String>,
    #[serde(default)]
    pub tool_access: BTreeSet<String>,
}

/// How often a task routed to a profile may be re-attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; a task gets `max_retries + 1` attempts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

/// Operational limits of a worker profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operational {
    #[serde(default = "default_max_runtime_secs")]
    pub max_runtime_secs: u64,
    /// Episodic workers are destroyed after every task; persistent ones are reused.
    #[serde(default)]
    pub episodic_reset: bool,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

fn default_max_runtime_secs() -> u64 {
    1800
}

impl Default for Operational {
    fn default() -> Self {
        Self {
            max_runtime_secs: default_max_runtime_secs(),
            episodic_reset: false,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Configuration-defined worker template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub model: ModelSpec,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub operational: Operational,
    /// Prepended to every prompt dispatched to this profile.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl WorkerProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            model: ModelSpec::default(),
            capabilities: Capabilities::default(),
            operational: Operational::default(),
            system_prompt: None,
        }
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.tool_access = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn episodic(mut self, episodic: bool) -> Self {
        self.operational.episodic_reset = episodic;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.operational.retry_policy.max_retries = max_retries;
        self
    }

    pub fn with_model(mut self, model: ModelSpec) -> Self {
        self.model = model;
        self
    }

    /// Attempts a task routed here may consume in total.
    pub fn max_attempts(&self) -> usize {
        self.operational.retry_policy.max_retries as usize + 1
    }

    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.operational.max_runtime_secs)
    }
}

/// Lifecycle status of a worker instance. `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Working,
    Completed,
    Failed,
    Terminated,
}

/// Metrics accumulated by one worker instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub total_runtime_ms: u64,
    pub total_tokens_used: u64,
    /// Running mean over judged tasks only.
    pub average_quality_score: f64,
    #[serde(default)]
    pub judged_tasks: u32,
}

impl WorkerMetrics {
    pub(crate) fn record(&mut self, outcome: &WorkOutcome) {
        if outcome.success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        self.total_runtime_ms += outcome.runtime_ms;
        self.total_tokens_used += outcome.tokens_used;
        if let Some(score) = outcome.quality_score {
            let n = f64::from(self.judged_tasks);
            self.average_quality_score = (self.average_quality_score * n + score) / (n + 1.0);
            self.judged_tasks += 1;
        }
    }
}

/// What a worker reports back to the pool when it finishes a task.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkOutcome {
    pub success: bool,
    pub runtime_ms: u64,
    pub tokens_used: u64,
    pub quality_score: Option<f64>,
}

/// Runtime worker, owned by the [`WorkerPool`](crate::pool::WorkerPool).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInstance {
    pub id: Uuid,
    pub profile_id: String,
    pub status: WorkerStatus,
    /// Set iff `status == Working`.
    pub current_task_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub metrics: WorkerMetrics,
}

/// Verdict of the judge on one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeResult {
    pub passed: bool,
    /// In `[0, 1]`.
    pub score: f64,
    pub breakdown: BTreeMap<String, f64>,
    pub feedback: Vec<String>,
    pub should_retry: bool,
}

/// A task-level failure surfaced in the run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowError {
    pub timestamp: DateTime<Utc>,
    pub task_id: Option<String>,
    /// Component that reported the failure (`executor`, `judge`, `scheduler`, ...).
    pub module_id: String,
    pub message: String,
    pub recoverable: bool,
}

impl WorkflowError {
    pub fn new(
        task_id: Option<&str>,
        module_id: impl Into<String>,
        message: impl Into<String>,
        recoverable: bool,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            task_id: task_id.map(str::to_string),
            module_id: module_id.into(),
            message: message.into(),
            recoverable,
        }
    }
}
