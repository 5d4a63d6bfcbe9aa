use crate::types::{TaskDefinition, WorkerProfile};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use taskweave_core::{TaskweaveError, TaskweaveResult};

/// One finding about a planned task graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub task_id: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    fn new(task_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.map(str::to_string),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.task_id {
            Some(id) => write!(f, "{id}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Errors block a run; warnings are only logged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Fold every error into a single [`TaskweaveError::Validation`].
    pub fn ensure_valid(&self) -> TaskweaveResult<()> {
        if self.is_valid() {
            return Ok(());
        }
        let messages: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
        Err(TaskweaveError::Validation(messages.join("; ")))
    }
}

/// Check a planned task graph against the configured profiles.
pub fn validate_tasks(tasks: &[TaskDefinition], profiles: &[WorkerProfile]) -> ValidationReport {
    let mut report = ValidationReport::default();

    let mut ids = HashSet::new();
    for task in tasks {
        if task.id.trim().is_empty() {
            report
                .errors
                .push(ValidationIssue::new(None, "task id cannot be empty"));
        } else if !ids.insert(task.id.as_str()) {
            report.errors.push(ValidationIssue::new(
                Some(&task.id),
                "duplicate task id",
            ));
        }
    }

    for task in tasks {
        for dep in &task.dependencies {
            if dep == &task.id {
                report.errors.push(ValidationIssue::new(
                    Some(&task.id),
                    "task depends on itself",
                ));
            } else if !ids.contains(dep.as_str()) {
                report.errors.push(ValidationIssue::new(
                    Some(&task.id),
                    format!("unknown dependency '{dep}'"),
                ));
            }
        }
        if task.timeout_secs == 0 {
            report
                .errors
                .push(ValidationIssue::new(Some(&task.id), "timeout must be positive"));
        }
        for criterion in &task.acceptance_criteria {
            if !(0.0..=1.0).contains(&criterion.weight) {
                report.errors.push(ValidationIssue::new(
                    Some(&task.id),
                    format!(
                        "criterion '{}' weight {} is outside [0, 1]",
                        criterion.description, criterion.weight
                    ),
                ));
            }
        }

        let uncovered: Vec<&str> = task
            .required_skills
            .iter()
            .filter(|s| !profiles.iter().any(|p| p.capabilities.skills.contains(*s)))
            .map(String::as_str)
            .collect();
        if !uncovered.is_empty() {
            report.warnings.push(ValidationIssue::new(
                Some(&task.id),
                format!("no worker profile offers {}", uncovered.join(", ")),
            ));
        }
    }

    if let Some(id) = find_cycle(tasks) {
        report.errors.push(ValidationIssue::new(
            Some(id),
            "dependency cycle detected",
        ));
    }

    report
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// First task found on a dependency cycle, by depth-first search.
fn find_cycle(tasks: &[TaskDefinition]) -> Option<&str> {
    let by_id: HashMap<&str, &TaskDefinition> =
        tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    for task in tasks {
        if dfs_cycle(task.id.as_str(), &by_id, &mut marks) {
            return Some(task.id.as_str());
        }
    }
    None
}

fn dfs_cycle<'a>(
    id: &'a str,
    by_id: &HashMap<&'a str, &'a TaskDefinition>,
    marks: &mut HashMap<&'a str, Mark>,
) -> bool {
    match marks.get(id) {
        Some(Mark::InProgress) => return true, // back edge
        Some(Mark::Done) => return false,
        None => {}
    }
    marks.insert(id, Mark::InProgress);
    if let Some(&task) = by_id.get(id) {
        for dep in &task.dependencies {
            if dfs_cycle(dep.as_str(), by_id, marks) {
                return true;
            }
        }
    }
    marks.insert(id, Mark::Done);
    false
}
