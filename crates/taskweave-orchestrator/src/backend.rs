//! Boundaries to the collaborators the engine drives but does not own: the
//! execution backend that runs agent work, the cost tracker, and the planner.

use crate::types::{
    CriterionKind, ModelSpec, TaskDefinition, TaskState, WorkerInstance, WorkerProfile,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use taskweave_core::TaskweaveResult;

/// Token usage reported by the backend for one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

/// Per-dispatch settings handed to the backend.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub model: ModelSpec,
    /// The engine enforces this deadline itself; backends may use it as a hint.
    pub timeout: Duration,
    /// 1-based attempt number.
    pub attempt: usize,
}

/// What the backend returns for one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub success: bool,
    pub output: Option<String>,
    #[serde(default)]
    pub tokens: TokenUsage,
    pub error: Option<String>,
    /// `None` when the work produced no test signal.
    #[serde(default)]
    pub tests_passed: Option<bool>,
    #[serde(default)]
    pub lint_passed: Option<bool>,
}

impl ExecutionOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_tokens(mut self, input: u64, output: u64) -> Self {
        self.tokens = TokenUsage { input, output };
        self
    }

    pub fn with_tests(mut self, passed: bool) -> Self {
        self.tests_passed = Some(passed);
        self
    }

    pub fn with_lint(mut self, passed: bool) -> Self {
        self.lint_passed = Some(passed);
        self
    }
}

/// Runs agent work for a worker instance. Opaque to the engine.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn execute(
        &self,
        worker: &WorkerInstance,
        prompt: &str,
        options: &ExecutionOptions,
    ) -> TaskweaveResult<ExecutionOutput>;
}

/// Result of recording spend with a [`CostTracker`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostStatus {
    pub budget_exceeded: bool,
    pub warning_triggered: bool,
}

/// Accumulates spend; the engine stops scheduling once the budget is exceeded.
pub trait CostTracker: Send + Sync {
    fn record(&self, model: &str, input_tokens: u64, output_tokens: u64) -> CostStatus;
}

/// Token-count budget with a warning threshold.
pub struct TokenBudget {
    limit: u64,
    warning_ratio: f64,
    used: Mutex<u64>,
}

impl TokenBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            warning_ratio: 0.8,
            used: Mutex::new(0),
        }
    }

    /// Fraction of the limit at which warnings start (default 0.8).
    pub fn with_warning_ratio(mut self, ratio: f64) -> Self {
        self.warning_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn used(&self) -> u64 {
        *self.used.lock()
    }
}

impl CostTracker for TokenBudget {
    fn record(&self, _model: &str, input_tokens: u64, output_tokens: u64) -> CostStatus {
        let mut used = self.used.lock();
        *used = used.saturating_add(input_tokens + output_tokens);
        let warn_at = (self.limit as f64 * self.warning_ratio) as u64;
        CostStatus {
            budget_exceeded: *used > self.limit,
            warning_triggered: *used >= warn_at,
        }
    }
}

/// Turns a goal into the task graph for one run.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, goal: &str) -> TaskweaveResult<Vec<TaskDefinition>>;
}

/// Longest slice of a previous error carried into a retry prompt.
const MAX_ERROR_CHARS: usize = 200;

/// Build the prompt dispatched for `state` on a worker of `profile`.
///
/// Retries carry the number of finished attempts, the last error and any
/// judge feedback so the worker does not repeat the same mistake.
pub fn build_prompt(state: &TaskState, profile: &WorkerProfile) -> String {
    let task = &state.task;
    let mut prompt = String::new();
    if let Some(system) = &profile.system_prompt {
        prompt.push_str(system);
        prompt.push_str("\n\n");
    }
    prompt.push_str(&format!("## TASK {} ({})\n\n", task.id, task.task_type));
    prompt.push_str(&task.description);
    prompt.push('\n');

    if !task.required_skills.is_empty() {
        let skills: Vec<&str> = task.required_skills.iter().map(String::as_str).collect();
        prompt.push_str(&format!("\nSkills: {}\n", skills.join(", ")));
    }
    if !task.required_tools.is_empty() {
        let tools: Vec<&str> = task.required_tools.iter().map(String::as_str).collect();
        prompt.push_str(&format!("Tools: {}\n", tools.join(", ")));
    }
    if !task.dependencies.is_empty() {
        prompt.push_str(&format!(
            "Completed dependencies: {}\n",
            task.dependencies.join(", ")
        ));
    }

    if !task.acceptance_criteria.is_empty() {
        prompt.push_str("\n## ACCEPTANCE CRITERIA\n\n");
        for criterion in &task.acceptance_criteria {
            let check = match criterion.kind {
                CriterionKind::Deterministic => "checked automatically",
                CriterionKind::LlmEvaluated => "reviewed",
            };
            prompt.push_str(&format!(
                "- {} (weight {:.2}, {check})\n",
                criterion.description, criterion.weight
            ));
        }
    }

    let previous = state.finished_attempts();
    if previous > 0 {
        prompt.push_str("\n## RETRY INFO\n\n");
        prompt.push_str(&format!("- Previous attempts: {previous}\n"));
        if let Some(error) = state.last_error() {
            let error: String = error.chars().take(MAX_ERROR_CHARS).collect();
            prompt.push_str(&format!("- Last error: {error}\n"));
        }
        for note in &state.feedback {
            prompt.push_str(&format!("- Reviewer feedback: {note}\n"));
        }
    }
    prompt
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_token_budget_thresholds() {
        let budget = TokenBudget::new(1_000);
        let status = budget.record("sonnet", 300, 200);
        assert!(!status.budget_exceeded);
        assert!(!status.warning_triggered);

        let status = budget.record("sonnet", 200, 150);
        assert!(!status.budget_exceeded);
        assert!(status.warning_triggered);

        let status = budget.record("sonnet", 100, 100);
        assert!(status.budget_exceeded);
        assert_eq!(budget.used(), 1_050);
    }

    #[test]
    fn test_prompt_contains_task_context() {
        let task = TaskDefinition::new("parser", "implement", "Write a TOML parser")
            .with_skills(["rust"])
            .with_tools(["edit", "shell"])
            .with_criterion(CriterionKind::Deterministic, 0.6, "unit tests pass")
            .with_criterion(CriterionKind::LlmEvaluated, 0.4, "idiomatic code");
        let mut profile = WorkerProfile::new("coder", "Coder");
        profile.system_prompt = Some("You are a careful Rust engineer.".into());

        let prompt = build_prompt(&TaskState::new(task), &profile);
        assert!(prompt.starts_with("You are a careful Rust engineer."));
        assert!(prompt.contains("## TASK parser (implement)"));
        assert!(prompt.contains("Tools: edit, shell"));
        assert!(prompt.contains("- unit tests pass (weight 0.60, checked automatically)"));
        assert!(prompt.contains("- idiomatic code (weight 0.40, reviewed)"));
    }

    #[test]
    fn test_retry_prompt_carries_previous_failure() {
        let task = TaskDefinition::new("api", "implement", "Add the endpoint")
            .with_dependencies(["schema"]);
        let profile = WorkerProfile::new("coder", "Coder");
        let mut state = TaskState::new(task);

        let first = build_prompt(&state, &profile);
        assert!(first.contains("Completed dependencies: schema"));
        assert!(!first.contains("RETRY INFO"));

        state.attempts.push(crate::types::TaskAttempt {
            worker_id: uuid::Uuid::new_v4(),
            started_at: chrono::Utc::now(),
            completed_at: Some(chrono::Utc::now()),
            tokens_used: 0,
            error: Some("cargo build failed: missing field `id`".to_string()),
        });
        state.feedback = vec!["handle the empty body case".to_string()];

        let retry = build_prompt(&state, &profile);
        assert!(retry.contains("## RETRY INFO"));
        assert!(retry.contains("- Previous attempts: 1"));
        assert!(retry.contains("- Last error: cargo build failed: missing field `id`"));
        assert!(retry.contains("- Reviewer feedback: handle the empty body case"));
    }

    #[test]
    fn test_execution_output_builders() {
        let out = ExecutionOutput::success("ok")
            .with_tokens(10, 5)
            .with_tests(true);
        assert!(out.success);
        assert_eq!(out.tokens.total(), 15);
        assert_eq!(out.tests_passed, Some(true));
        assert_eq!(out.lint_passed, None);

        let failed = ExecutionOutput::failure("exit code 2");
        assert!(!failed.success);
        assert!(failed.output.is_none());
    }
}
