use crate::config::PriorityWeights;
use crate::task_queue::TaskHandle;
use crate::types::{TaskState, TaskStatus};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};

/// Tasks chosen by a scheduler for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDecision {
    /// Dispatch now; never more than the available worker count.
    pub scheduled: Vec<TaskHandle>,
    /// Eligible overflow that waits for a worker; never more than the queue size.
    pub queued: Vec<TaskHandle>,
}

impl ScheduleDecision {
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty() && self.queued.is_empty()
    }
}

/// Selects which eligible tasks advance this tick.
///
/// Implementations must be deterministic: identical input yields identical
/// output. Handles index into `tasks`.
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &str;

    fn schedule(&self, tasks: &[TaskState], available: usize) -> ScheduleDecision;
}

/// Indices of pending tasks whose dependencies are all completed, in order.
pub fn eligible_indices(tasks: &[TaskState]) -> Vec<usize> {
    let completed: HashSet<&str> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .map(TaskState::id)
        .collect();
    tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| t.is_ready(&completed))
        .map(|(i, _)| i)
        .collect()
}

/// Cut an ordered candidate list into scheduled and queued.
pub fn split_ordered(order: &[usize], available: usize, max_queue_size: usize) -> ScheduleDecision {
    let take = available.min(order.len());
    let scheduled = order[..take].iter().map(|&i| TaskHandle(i)).collect();
    let queued = order[take..]
        .iter()
        .take(max_queue_size)
        .map(|&i| TaskHandle(i))
        .collect();
    ScheduleDecision { scheduled, queued }
}

/// Stable descending sort of `order` by `scores`; ties keep insertion order.
fn sort_by_score_desc(order: &mut [usize], scores: &HashMap<usize, f64>) {
    order.sort_by(|a, b| {
        let sa = scores.get(a).copied().unwrap_or(0.0);
        let sb = scores.get(b).copied().unwrap_or(0.0);
        sb.partial_cmp(&sa).unwrap_or(Ordering::Equal)
    });
}

/// First come, first served in planner order.
pub struct FifoScheduler {
    max_queue_size: usize,
}

impl FifoScheduler {
    pub fn new(max_queue_size: usize) -> Self {
        Self { max_queue_size }
    }
}

impl Scheduler for FifoScheduler {
    fn name(&self) -> &str {
        "fifo"
    }

    fn schedule(&self, tasks: &[TaskState], available: usize) -> ScheduleDecision {
        split_ordered(&eligible_indices(tasks), available, self.max_queue_size)
    }
}

/// Weighted score over urgency, complexity and dependency count.
pub struct PriorityScheduler {
    weights: PriorityWeights,
    max_queue_size: usize,
}

impl PriorityScheduler {
    pub fn new(weights: PriorityWeights, max_queue_size: usize) -> Self {
        Self {
            weights,
            max_queue_size,
        }
    }

    /// `wU / timeout_minutes + wC * complexity + wD / (1 + dependencies)`.
    pub fn score(&self, task: &TaskState) -> f64 {
        let timeout_minutes = (task.task.timeout_secs.max(1) as f64) / 60.0;
        let urgency = 1.0 / timeout_minutes;
        let complexity = task.task.complexity.level();
        let dependency = 1.0 / (1.0 + task.task.dependencies.len() as f64);
        self.weights.urgency * urgency
            + self.weights.complexity * complexity
            + self.weights.dependency * dependency
    }
}

impl Scheduler for PriorityScheduler {
    fn name(&self) -> &str {
        "priority"
    }

    fn schedule(&self, tasks: &[TaskState], available: usize) -> ScheduleDecision {
        let mut order = eligible_indices(tasks);
        let scores: HashMap<usize, f64> =
            order.iter().map(|&i| (i, self.score(&tasks[i]))).collect();
        sort_by_score_desc(&mut order, &scores);
        split_ordered(&order, available, self.max_queue_size)
    }
}

/// Prefers tasks that unblock the most unfinished downstream work.
pub struct CriticalPathScheduler {
    max_queue_size: usize,
}

impl CriticalPathScheduler {
    pub fn new(max_queue_size: usize) -> Self {
        Self { max_queue_size }
    }

    /// Number of transitive, non-terminal dependents of every task.
    fn dependents(tasks: &[TaskState]) -> HashMap<usize, usize> {
        let by_id: HashMap<&str, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id(), i))
            .collect();
        let mut reverse: HashMap<usize, Vec<usize>> = HashMap::new();
        for (i, task) in tasks.iter().enumerate() {
            for dep in &task.task.dependencies {
                if let Some(&d) = by_id.get(dep.as_str()) {
                    reverse.entry(d).or_default().push(i);
                }
            }
        }

        let mut counts = HashMap::new();
        for root in 0..tasks.len() {
            let mut seen = HashSet::new();
            let mut frontier: VecDeque<usize> =
                reverse.get(&root).cloned().unwrap_or_default().into();
            while let Some(next) = frontier.pop_front() {
                if !seen.insert(next) {
                    continue;
                }
                if let Some(children) = reverse.get(&next) {
                    frontier.extend(children.iter().copied());
                }
            }
            let open = seen
                .iter()
                .filter(|&&i| !tasks[i].status.is_terminal())
                .count();
            counts.insert(root, open);
        }
        counts
    }
}

impl Scheduler for CriticalPathScheduler {
    fn name(&self) -> &str {
        "critical-path"
    }

    fn schedule(&self, tasks: &[TaskState], available: usize) -> ScheduleDecision {
        let mut order = eligible_indices(tasks);
        if order.is_empty() {
            return ScheduleDecision::default();
        }
        let dependents = Self::dependents(tasks);
        let scores: HashMap<usize, f64> = order
            .iter()
            .map(|&i| (i, dependents.get(&i).copied().unwrap_or(0) as f64))
            .collect();
        sort_by_score_desc(&mut order, &scores);
        split_ordered(&order, available, self.max_queue_size)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{Complexity, TaskDefinition};

    fn state(id: &str, deps: &[&str]) -> TaskState {
        TaskState::new(
            TaskDefinition::new(id, "implement", format!("Task {id}")).with_dependencies(deps.to_vec()),
        )
    }

    fn ids(tasks: &[TaskState], handles: &[TaskHandle]) -> Vec<String> {
        handles
            .iter()
            .map(|h| tasks[h.index()].id().to_string())
            .collect()
    }

    #[test]
    fn test_fifo_takes_first_k_in_insertion_order() {
        let tasks: Vec<TaskState> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|id| state(id, &[]))
            .collect();
        let scheduler = FifoScheduler::new(10);
        for _ in 0..5 {
            let decision = scheduler.schedule(&tasks, 2);
            assert_eq!(ids(&tasks, &decision.scheduled), vec!["a", "b"]);
            assert_eq!(ids(&tasks, &decision.queued), vec!["c", "d", "e"]);
        }
    }

    #[test]
    fn test_fifo_skips_ineligible() {
        let mut tasks = vec![state("a", &[]), state("b", &[]), state("c", &["a", "b"])];
        let scheduler = FifoScheduler::new(10);
        let decision = scheduler.schedule(&tasks, 3);
        assert_eq!(ids(&tasks, &decision.scheduled), vec!["a", "b"]);

        tasks[0].status = TaskStatus::Completed;
        let decision = scheduler.schedule(&tasks, 3);
        assert_eq!(ids(&tasks, &decision.scheduled), vec!["b"]);

        tasks[1].status = TaskStatus::Completed;
        let decision = scheduler.schedule(&tasks, 3);
        assert_eq!(ids(&tasks, &decision.scheduled), vec!["c"]);
    }

    #[test]
    fn test_queue_size_caps_overflow() {
        let tasks: Vec<TaskState> = (0..6).map(|i| state(&format!("t{i}"), &[])).collect();
        let decision = FifoScheduler::new(2).schedule(&tasks, 1);
        assert_eq!(decision.scheduled.len(), 1);
        assert_eq!(ids(&tasks, &decision.queued), vec!["t1", "t2"]);
    }

    #[test]
    fn test_no_capacity_schedules_nothing() {
        let tasks = vec![state("a", &[])];
        let decision = FifoScheduler::new(4).schedule(&tasks, 0);
        assert!(decision.scheduled.is_empty());
        assert_eq!(decision.queued.len(), 1);
    }

    #[test]
    fn test_no_eligible_tasks_is_empty() {
        let mut tasks = vec![state("a", &[])];
        tasks[0].status = TaskStatus::Executing;
        assert!(FifoScheduler::new(4).schedule(&tasks, 4).is_empty());
        assert!(PriorityScheduler::new(PriorityWeights::default(), 4)
            .schedule(&tasks, 4)
            .is_empty());
        assert!(CriticalPathScheduler::new(4).schedule(&tasks, 4).is_empty());
    }

    #[test]
    fn test_priority_prefers_more_complex_task() {
        let mut trivial = state("trivial", &[]);
        trivial.task.complexity = Complexity::Trivial;
        let mut hard = state("hard", &[]);
        hard.task.complexity = Complexity::VeryComplex;
        let tasks = vec![trivial, hard];

        let scheduler = PriorityScheduler::new(PriorityWeights::default(), 0);
        assert!(scheduler.score(&tasks[1]) > scheduler.score(&tasks[0]));
        let decision = scheduler.schedule(&tasks, 1);
        assert_eq!(ids(&tasks, &decision.scheduled), vec!["hard"]);
    }

    #[test]
    fn test_priority_score_formula() {
        let mut task = state("a", &[]);
        task.task.timeout_secs = 120;
        task.task.complexity = Complexity::Moderate;
        let scheduler = PriorityScheduler::new(
            PriorityWeights {
                urgency: 1.0,
                complexity: 1.0,
                dependency: 1.0,
            },
            0,
        );
        // 1/2 + 0.5 + 1/(1+0)
        assert!((scheduler.score(&task) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_priority_ties_keep_insertion_order() {
        let tasks: Vec<TaskState> = ["x", "y", "z"].iter().map(|id| state(id, &[])).collect();
        let scheduler = PriorityScheduler::new(PriorityWeights::default(), 10);
        let decision = scheduler.schedule(&tasks, 2);
        assert_eq!(ids(&tasks, &decision.scheduled), vec!["x", "y"]);
        assert_eq!(ids(&tasks, &decision.queued), vec!["z"]);
    }

    #[test]
    fn test_critical_path_prefers_task_with_most_dependents() {
        let tasks = vec![
            state("leaf", &[]),
            state("root", &[]),
            state("mid", &["root"]),
            state("top", &["mid"]),
        ];
        let decision = CriticalPathScheduler::new(10).schedule(&tasks, 1);
        assert_eq!(ids(&tasks, &decision.scheduled), vec!["root"]);
        assert_eq!(ids(&tasks, &decision.queued), vec!["leaf"]);
    }
}
