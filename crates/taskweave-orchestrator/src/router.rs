use crate::types::{TaskDefinition, WorkerProfile};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Skill overlap weight in the capability match score.
pub const SKILL_WEIGHT: f64 = 0.7;
/// Tool overlap weight in the capability match score.
pub const TOOL_WEIGHT: f64 = 0.3;

/// Which profile should serve a task, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    /// `None` only when there are no profiles at all.
    pub profile_id: Option<String>,
    pub match_score: f64,
    pub reason: String,
    /// The pick is a best-effort fallback rather than a qualified match.
    pub fallback: bool,
}

impl RouteDecision {
    fn none() -> Self {
        Self {
            profile_id: None,
            match_score: 0.0,
            reason: "no worker profiles configured".to_string(),
            fallback: true,
        }
    }
}

/// Chooses a worker profile for a task.
pub trait Router: Send + Sync {
    fn name(&self) -> &str;

    fn route(&self, task: &TaskDefinition, profiles: &[WorkerProfile]) -> RouteDecision;
}

fn overlap_ratio(required: &BTreeSet<String>, offered: &BTreeSet<String>) -> f64 {
    if required.is_empty() {
        return 1.0;
    }
    let covered = required.iter().filter(|r| offered.contains(*r)).count();
    covered as f64 / required.len() as f64
}

/// `0.7 * skill coverage + 0.3 * tool coverage`, each 1.0 when nothing is required.
pub fn capability_match(task: &TaskDefinition, profile: &WorkerProfile) -> f64 {
    SKILL_WEIGHT * overlap_ratio(&task.required_skills, &profile.capabilities.skills)
        + TOOL_WEIGHT * overlap_ratio(&task.required_tools, &profile.capabilities.tool_access)
}

/// True when the task requires nothing, or the profile offers at least one
/// required skill or tool.
fn covers_any(task: &TaskDefinition, profile: &WorkerProfile) -> bool {
    if task.required_skills.is_empty() && task.required_tools.is_empty() {
        return true;
    }
    task.required_skills
        .iter()
        .any(|s| profile.capabilities.skills.contains(s))
        || task
            .required_tools
            .iter()
            .any(|t| profile.capabilities.tool_access.contains(t))
}

/// Fixed task-type → profile table.
pub struct StaticRouter {
    table: HashMap<String, String>,
}

impl StaticRouter {
    pub fn new(table: HashMap<String, String>) -> Self {
        Self { table }
    }
}

impl Router for StaticRouter {
    fn name(&self) -> &str {
        "static"
    }

    fn route(&self, task: &TaskDefinition, profiles: &[WorkerProfile]) -> RouteDecision {
        let mapped = self
            .table
            .get(&task.task_type)
            .and_then(|id| profiles.iter().find(|p| &p.id == id));
        if let Some(profile) = mapped {
            return RouteDecision {
                profile_id: Some(profile.id.clone()),
                match_score: 1.0,
                reason: format!("static mapping for type '{}'", task.task_type),
                fallback: false,
            };
        }
        match profiles.first() {
            Some(first) => RouteDecision {
                profile_id: Some(first.id.clone()),
                match_score: 0.5,
                reason: format!(
                    "no mapping for type '{}', using first profile",
                    task.task_type
                ),
                fallback: true,
            },
            None => RouteDecision::none(),
        }
    }
}

/// Best capability match, falling back to the best profile below threshold.
pub struct CapabilityRouter {
    threshold: f64,
}

impl CapabilityRouter {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl Router for CapabilityRouter {
    fn name(&self) -> &str {
        "capability"
    }

    fn route(&self, task: &TaskDefinition, profiles: &[WorkerProfile]) -> RouteDecision {
        let mut best: Option<(&WorkerProfile, f64)> = None;
        for profile in profiles {
            let score = capability_match(task, profile);
            // Strict comparison: the earlier profile wins ties.
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((profile, score));
            }
        }
        let Some((profile, score)) = best else {
            return RouteDecision::none();
        };
        if score >= self.threshold {
            RouteDecision {
                profile_id: Some(profile.id.clone()),
                match_score: score,
                reason: "capability match".to_string(),
                fallback: false,
            }
        } else {
            RouteDecision {
                profile_id: Some(profile.id.clone()),
                match_score: score,
                reason: "below threshold".to_string(),
                fallback: true,
            }
        }
    }
}

/// Rotates through the profiles that cover any of the task's requirements.
pub struct RoundRobinRouter {
    cursor: AtomicUsize,
}

impl RoundRobinRouter {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl Router for RoundRobinRouter {
    fn name(&self) -> &str {
        "round-robin"
    }

    fn route(&self, task: &TaskDefinition, profiles: &[WorkerProfile]) -> RouteDecision {
        if profiles.is_empty() {
            return RouteDecision::none();
        }
        let mut candidates: Vec<&WorkerProfile> =
            profiles.iter().filter(|p| covers_any(task, p)).collect();
        let fallback = candidates.is_empty();
        if fallback {
            candidates = profiles.iter().collect();
        }
        let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
        let profile = candidates[turn % candidates.len()];
        RouteDecision {
            profile_id: Some(profile.id.clone()),
            match_score: capability_match(task, profile),
            reason: format!("round robin turn {turn}"),
            fallback,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn profiles() -> Vec<WorkerProfile> {
        vec![
            WorkerProfile::new("generalist", "Generalist").with_skills(["writing"]),
            WorkerProfile::new("coder", "Coder")
                .with_skills(["rust", "python"])
                .with_tools(["edit"]),
            WorkerProfile::new("tester", "Tester")
                .with_skills(["testing"])
                .with_tools(["shell"]),
        ]
    }

    #[test]
    fn test_capability_score_full_skills_half_tools() {
        let task = TaskDefinition::new("t", "implement", "x")
            .with_skills(["rust"])
            .with_tools(["edit", "shell"]);
        let all = profiles();
        let score = capability_match(&task, &all[1]);
        assert!((score - 0.85).abs() < 1e-9);

        let decision = CapabilityRouter::new(0.85).route(&task, &profiles());
        assert_eq!(decision.profile_id.as_deref(), Some("coder"));
        assert!((decision.match_score - 0.85).abs() < 1e-9);
        assert!(!decision.fallback);
    }

    #[test]
    fn test_capability_empty_requirements_score_one() {
        let task = TaskDefinition::new("t", "chore", "x");
        assert_eq!(capability_match(&task, &profiles()[0]), 1.0);
        // All tie at 1.0, so the first profile wins.
        let decision = CapabilityRouter::new(0.6).route(&task, &profiles());
        assert_eq!(decision.profile_id.as_deref(), Some("generalist"));
    }

    #[test]
    fn test_capability_below_threshold_still_routes() {
        let task = TaskDefinition::new("t", "implement", "x")
            .with_skills(["haskell"])
            .with_tools(["edit"]);
        let decision = CapabilityRouter::new(0.9).route(&task, &profiles());
        assert_eq!(decision.profile_id.as_deref(), Some("coder"));
        assert_eq!(decision.reason, "below threshold");
        assert!(decision.fallback);
        assert!((decision.match_score - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_no_profiles_returns_none() {
        let task = TaskDefinition::new("t", "implement", "x");
        assert!(CapabilityRouter::new(0.5).route(&task, &[]).profile_id.is_none());
        assert!(StaticRouter::new(HashMap::new())
            .route(&task, &[])
            .profile_id
            .is_none());
        assert!(RoundRobinRouter::new().route(&task, &[]).profile_id.is_none());
    }

    #[test]
    fn test_static_mapping_and_fallback() {
        let router = StaticRouter::new(HashMap::from([(
            "test".to_string(),
            "tester".to_string(),
        )]));
        let hit = router.route(&TaskDefinition::new("t", "test", "x"), &profiles());
        assert_eq!(hit.profile_id.as_deref(), Some("tester"));
        assert_eq!(hit.match_score, 1.0);
        assert!(!hit.fallback);

        let miss = router.route(&TaskDefinition::new("t", "deploy", "x"), &profiles());
        assert_eq!(miss.profile_id.as_deref(), Some("generalist"));
        assert_eq!(miss.match_score, 0.5);
        assert!(miss.fallback);
    }

    #[test]
    fn test_round_robin_rotates_over_capable_profiles() {
        let router = RoundRobinRouter::new();
        let task = TaskDefinition::new("t", "implement", "x").with_skills(["rust", "testing"]);
        let picks: Vec<String> = (0..4)
            .map(|_| router.route(&task, &profiles()).profile_id.unwrap())
            .collect();
        assert_eq!(picks, vec!["coder", "tester", "coder", "tester"]);
    }
}
