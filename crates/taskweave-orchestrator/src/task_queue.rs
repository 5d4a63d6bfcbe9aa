use crate::types::{TaskAttempt, TaskDefinition, TaskResult, TaskState, TaskStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use taskweave_core::{TaskweaveError, TaskweaveResult};
use uuid::Uuid;

/// Stable handle to a task record: its index in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskHandle(pub usize);

impl TaskHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Per-status task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub queued: usize,
    pub assigned: usize,
    pub executing: usize,
    pub evaluating: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending
            + self.queued
            + self.assigned
            + self.executing
            + self.evaluating
            + self.completed
            + self.failed
    }
}

/// Arena of task records addressed by [`TaskHandle`].
///
/// Records are never removed, so handles stay valid for the whole run and the
/// backing slice preserves planner insertion order. Every status change goes
/// through a checked transition.
#[derive(Debug, Clone, Default)]
pub struct TaskQueue {
    states: Vec<TaskState>,
    index: HashMap<String, TaskHandle>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a queue from planner output, rejecting duplicate ids.
    pub fn from_definitions(tasks: Vec<TaskDefinition>) -> TaskweaveResult<Self> {
        let mut queue = Self::new();
        for task in tasks {
            queue.add(task)?;
        }
        Ok(queue)
    }

    /// Add a task to the queue.
    pub fn add(&mut self, task: TaskDefinition) -> TaskweaveResult<TaskHandle> {
        if self.index.contains_key(&task.id) {
            return Err(TaskweaveError::Validation(format!(
                "duplicate task id '{}'",
                task.id
            )));
        }
        let handle = TaskHandle(self.states.len());
        self.index.insert(task.id.clone(), handle);
        self.states.push(TaskState::new(task));
        Ok(handle)
    }

    pub fn handle(&self, id: &str) -> Option<TaskHandle> {
        self.index.get(id).copied()
    }

    pub fn get(&self, handle: TaskHandle) -> Option<&TaskState> {
        self.states.get(handle.0)
    }

    pub fn get_by_id(&self, id: &str) -> Option<&TaskState> {
        self.handle(id).and_then(|h| self.get(h))
    }

    /// All records in insertion order; position `i` is `TaskHandle(i)`.
    pub fn states(&self) -> &[TaskState] {
        &self.states
    }

    pub fn into_states(self) -> Vec<TaskState> {
        self.states
    }

    pub fn completed_ids(&self) -> HashSet<&str> {
        self.states
            .iter()
            .filter(|s| s.status == TaskStatus::Completed)
            .map(TaskState::id)
            .collect()
    }


    /// First dependency of `handle` that has permanently failed.
    pub fn failed_dependency(&self, handle: TaskHandle) -> Option<&str> {
        let state = self.get(handle)?;
        state.task.dependencies.iter().find_map(|dep| {
            self.get_by_id(dep)
                .filter(|d| d.status == TaskStatus::Failed)
                .map(|d| d.id())
        })
    }

    fn transition(
        &mut self,
        handle: TaskHandle,
        from: &[TaskStatus],
        to: TaskStatus,
    ) -> TaskweaveResult<&mut TaskState> {
        let state = self.states.get_mut(handle.0).ok_or_else(|| {
            TaskweaveError::Orchestrator(format!("unknown task handle {}", handle.0))
        })?;
        if !from.contains(&state.status) {
            return Err(TaskweaveError::Orchestrator(format!(
                "task '{}' cannot move from {} to {}",
                state.task.id, state.status, to
            )));
        }
        state.status = to;
        Ok(state)
    }

    /// Pending → queued. Refused unless every dependency is completed.
    pub fn mark_queued(&mut self, handle: TaskHandle) -> TaskweaveResult<()> {
        let completed = self.completed_ids();
        let ready = self
            .get(handle)
            .map(|s| s.is_ready(&completed))
            .unwrap_or(false);
        if !ready {
            let id = self.get(handle).map(|s| s.id().to_string()).unwrap_or_default();
            return Err(TaskweaveError::Scheduler(format!(
                "task '{id}' is not eligible for queueing"
            )));
        }
        self.transition(handle, &[TaskStatus::Pending], TaskStatus::Queued)?;
        Ok(())
    }

    /// Queued or assigned → pending, used when no worker could be acquired.
    pub fn return_to_pending(&mut self, handle: TaskHandle) -> TaskweaveResult<()> {
        let state = self.transition(
            handle,
            &[TaskStatus::Queued, TaskStatus::Assigned],
            TaskStatus::Pending,
        )?;
        state.assigned_worker_id = None;
        Ok(())
    }

    /// Return every queued task to pending so the scheduler reconsiders it.
    pub fn release_queued(&mut self) -> usize {
        let mut released = 0;
        for state in &mut self.states {
            if state.status == TaskStatus::Queued {
                state.status = TaskStatus::Pending;
                released += 1;
            }
        }
        released
    }

    pub fn mark_assigned(
        &mut self,
        handle: TaskHandle,
        worker_id: Uuid,
        profile_id: &str,
    ) -> TaskweaveResult<()> {
        let state = self.transition(handle, &[TaskStatus::Queued], TaskStatus::Assigned)?;
        state.assigned_worker_id = Some(worker_id);
        state.assigned_profile_id = Some(profile_id.to_string());
        Ok(())
    }

    /// Assigned → executing; opens a new attempt.
    pub fn mark_executing(&mut self, handle: TaskHandle) -> TaskweaveResult<()> {
        let state = self.transition(handle, &[TaskStatus::Assigned], TaskStatus::Executing)?;
        let worker_id = state.assigned_worker_id.ok_or_else(|| {
            TaskweaveError::Orchestrator(format!("task '{}' has no worker", state.task.id))
        })?;
        state.attempts.push(TaskAttempt {
            worker_id,
            started_at: Utc::now(),
            completed_at: None,
            tokens_used: 0,
            error: None,
        });
        Ok(())
    }

    /// Executing → evaluating; records token usage on the open attempt.
    pub fn mark_evaluating(&mut self, handle: TaskHandle, tokens_used: u64) -> TaskweaveResult<()> {
        let state = self.transition(handle, &[TaskStatus::Executing], TaskStatus::Evaluating)?;
        if let Some(attempt) = state.attempts.last_mut() {
            attempt.tokens_used = tokens_used;
        }
        Ok(())
    }

    /// Close the open attempt, optionally with an error.
    pub fn close_attempt(
        &mut self,
        handle: TaskHandle,
        tokens_used: Option<u64>,
        error: Option<String>,
    ) -> TaskweaveResult<()> {
        let state = self.states.get_mut(handle.0).ok_or_else(|| {
            TaskweaveError::Orchestrator(format!("unknown task handle {}", handle.0))
        })?;
        let attempt = state.attempts.last_mut().ok_or_else(|| {
            TaskweaveError::Orchestrator(format!("task '{}' has no open attempt", state.task.id))
        })?;
        attempt.completed_at = Some(Utc::now());
        if let Some(tokens) = tokens_used {
            attempt.tokens_used = tokens;
        }
        attempt.error = error;
        Ok(())
    }

    /// Keep the judge's feedback for the next attempt's prompt.
    pub fn record_feedback(
        &mut self,
        handle: TaskHandle,
        feedback: Vec<String>,
    ) -> TaskweaveResult<()> {
        let state = self.states.get_mut(handle.0).ok_or_else(|| {
            TaskweaveError::Orchestrator(format!("unknown task handle {}", handle.0))
        })?;
        state.feedback = feedback;
        Ok(())
    }

    /// Evaluating → completed.
    pub fn mark_completed(&mut self, handle: TaskHandle, result: TaskResult) -> TaskweaveResult<()> {
        let state = self.transition(handle, &[TaskStatus::Evaluating], TaskStatus::Completed)?;
        state.assigned_worker_id = None;
        state.result = Some(result);
        Ok(())
    }

    /// Back to pending after a retryable failure; attempts are kept.
    pub fn mark_retry(&mut self, handle: TaskHandle) -> TaskweaveResult<()> {
        let state = self.transition(
            handle,
            &[TaskStatus::Executing, TaskStatus::Evaluating],
            TaskStatus::Pending,
        )?;
        state.assigned_worker_id = None;
        Ok(())
    }

    /// Permanent failure from any non-terminal state.
    pub fn mark_failed(&mut self, handle: TaskHandle) -> TaskweaveResult<()> {
        let state = self.transition(
            handle,
            &[
                TaskStatus::Pending,
                TaskStatus::Queued,
                TaskStatus::Assigned,
                TaskStatus::Executing,
                TaskStatus::Evaluating,
            ],
            TaskStatus::Failed,
        )?;
        state.assigned_worker_id = None;
        Ok(())
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for state in &self.states {
            match state.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Queued => counts.queued += 1,
                TaskStatus::Assigned => counts.assigned += 1,
                TaskStatus::Executing => counts.executing += 1,
                TaskStatus::Evaluating => counts.evaluating += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Total number of tasks.
    pub fn total_count(&self) -> usize {
        self.states.len()
    }

    /// Check if all tasks are in a terminal state.
    pub fn is_done(&self) -> bool {
        self.states.iter().all(|s| s.status.is_terminal())
    }
}
