use crate::types::WorkerProfile;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use taskweave_core::{TaskweaveError, TaskweaveResult};

/// Weights of the priority scheduler's score terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    pub urgency: f64,
    pub complexity: f64,
    pub dependency: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            urgency: 0.4,
            complexity: 0.4,
            dependency: 0.2,
        }
    }
}

impl PriorityWeights {
    fn validate(&self) -> TaskweaveResult<()> {
        let all = [self.urgency, self.complexity, self.dependency];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(TaskweaveError::Config(
                "priority weights must be finite and non-negative".to_string(),
            ));
        }
        if all.iter().all(|w| *w == 0.0) {
            return Err(TaskweaveError::Config(
                "priority weights cannot all be zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Scheduler selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SchedulerConfig {
    #[default]
    Fifo,
    Priority {
        #[serde(default)]
        weights: PriorityWeights,
    },
    CriticalPath,
    /// Resolved through the module registry by `name`.
    Custom {
        name: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

impl SchedulerConfig {
    /// Registry key of the implementation this config selects.
    pub fn implementation_name(&self) -> &str {
        match self {
            SchedulerConfig::Fifo => "fifo",
            SchedulerConfig::Priority { .. } => "priority",
            SchedulerConfig::CriticalPath => "critical-path",
            SchedulerConfig::Custom { name, .. } => name,
        }
    }
}

fn default_capability_threshold() -> f64 {
    0.5
}

/// Router selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RouterConfig {
    /// Task type → profile id.
    Static {
        #[serde(default)]
        table: HashMap<String, String>,
    },
    Capability {
        #[serde(default = "default_capability_threshold")]
        threshold: f64,
    },
    RoundRobin,
    Custom {
        name: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig::Capability {
            threshold: default_capability_threshold(),
        }
    }
}

impl RouterConfig {
    pub fn implementation_name(&self) -> &str {
        match self {
            RouterConfig::Static { .. } => "static",
            RouterConfig::Capability { .. } => "capability",
            RouterConfig::RoundRobin => "round-robin",
            RouterConfig::Custom { name, .. } => name,
        }
    }
}

/// One weighted dimension of an evaluation rubric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricDimension {
    pub name: String,
    pub weight: f64,
    #[serde(default)]
    pub description: String,
}

impl RubricDimension {
    pub fn new(name: impl Into<String>, weight: f64, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight,
            description: description.into(),
        }
    }
}

/// Judge selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum JudgeStrategy {
    #[default]
    Deterministic,
    LlmEval {
        #[serde(default)]
        rubric: Vec<RubricDimension>,
    },
    /// Tests gate first, then the rubric.
    Hybrid {
        #[serde(default)]
        rubric: Vec<RubricDimension>,
    },
    Custom {
        name: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

impl JudgeStrategy {
    pub fn implementation_name(&self) -> &str {
        match self {
            JudgeStrategy::Deterministic => "deterministic",
            JudgeStrategy::LlmEval { .. } => "llm-eval",
            JudgeStrategy::Hybrid { .. } => "hybrid",
            JudgeStrategy::Custom { name, .. } => name,
        }
    }

    fn rubric(&self) -> &[RubricDimension] {
        match self {
            JudgeStrategy::LlmEval { rubric } | JudgeStrategy::Hybrid { rubric } => rubric,
            _ => &[],
        }
    }
}

fn default_judge_threshold() -> f64 {
    0.7
}

fn default_retry_on_failure() -> bool {
    true
}

/// Judge strategy plus the pass threshold and retry switch every strategy shares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeConfig {
    #[serde(default)]
    pub strategy: JudgeStrategy,
    #[serde(default = "default_judge_threshold")]
    pub threshold: f64,
    #[serde(default = "default_retry_on_failure")]
    pub retry_on_failure: bool,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            strategy: JudgeStrategy::default(),
            threshold: default_judge_threshold(),
            retry_on_failure: default_retry_on_failure(),
        }
    }
}

fn default_max_concurrent_workers() -> usize {
    4
}

fn default_max_queue_size() -> usize {
    16
}

/// Everything [`Orchestrator::configure`](crate::engine::Orchestrator::configure)
/// needs. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_concurrent_workers")]
    pub max_concurrent_workers: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub judge: JudgeConfig,
    #[serde(default)]
    pub profiles: Vec<WorkerProfile>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: default_max_concurrent_workers(),
            max_queue_size: default_max_queue_size(),
            scheduler: SchedulerConfig::default(),
            router: RouterConfig::default(),
            judge: JudgeConfig::default(),
            profiles: Vec::new(),
        }
    }
}

fn check_unit_interval(what: &str, value: f64) -> TaskweaveResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(TaskweaveError::Config(format!(
            "{what} must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}

fn check_custom_name(stage: &str, name: &str) -> TaskweaveResult<()> {
    if name.trim().is_empty() {
        return Err(TaskweaveError::Config(format!(
            "custom {stage} needs a non-empty name"
        )));
    }
    Ok(())
}

impl OrchestratorConfig {
    pub fn new(profiles: Vec<WorkerProfile>) -> Self {
        Self {
            profiles,
            ..Self::default()
        }
    }

    pub fn with_max_concurrent_workers(mut self, max: usize) -> Self {
        self.max_concurrent_workers = max;
        self
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_router(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    pub fn with_judge(mut self, judge: JudgeConfig) -> Self {
        self.judge = judge;
        self
    }

    pub fn from_toml_str(source: &str) -> TaskweaveResult<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn from_json_str(source: &str) -> TaskweaveResult<Self> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn profile(&self, id: &str) -> Option<&WorkerProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    /// Reject invalid field combinations before any component is built.
    ///
    /// Implementation names of custom strategies are checked later, against
    /// the registry the orchestrator was constructed with.
    pub fn validate(&self) -> TaskweaveResult<()> {
        if self.max_concurrent_workers == 0 {
            return Err(TaskweaveError::Config(
                "max_concurrent_workers must be at least 1".to_string(),
            ));
        }
        if self.profiles.is_empty() {
            return Err(TaskweaveError::Config(
                "at least one worker profile is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for profile in &self.profiles {
            if profile.id.trim().is_empty() {
                return Err(TaskweaveError::Config(
                    "worker profile id cannot be empty".to_string(),
                ));
            }
            if !seen.insert(profile.id.as_str()) {
                return Err(TaskweaveError::Config(format!(
                    "duplicate worker profile id '{}'",
                    profile.id
                )));
            }
            if profile.operational.max_runtime_secs == 0 {
                return Err(TaskweaveError::Config(format!(
                    "worker profile '{}' has a zero max runtime",
                    profile.id
                )));
            }
        }

        match &self.scheduler {
            SchedulerConfig::Priority { weights } => weights.validate()?,
            SchedulerConfig::Custom { name, .. } => check_custom_name("scheduler", name)?,
            SchedulerConfig::Fifo | SchedulerConfig::CriticalPath => {}
        }

        match &self.router {
            RouterConfig::Static { table } => {
                for (task_type, profile_id) in table {
                    if !seen.contains(profile_id.as_str()) {
                        return Err(TaskweaveError::Config(format!(
                            "static route '{task_type}' points at unknown profile '{profile_id}'"
                        )));
                    }
                }
            }
            RouterConfig::Capability { threshold } => {
                check_unit_interval("capability threshold", *threshold)?
            }
            RouterConfig::Custom { name, .. } => check_custom_name("router", name)?,
            RouterConfig::RoundRobin => {}
        }

        check_unit_interval("judge threshold", self.judge.threshold)?;
        if let JudgeStrategy::Custom { name, .. } = &self.judge.strategy {
            check_custom_name("judge", name)?;
        }
        let mut dimensions = HashSet::new();
        for dimension in self.judge.strategy.rubric() {
            if dimension.name.trim().is_empty() {
                return Err(TaskweaveError::Config(
                    "rubric dimension name cannot be empty".to_string(),
                ));
            }
            if !dimensions.insert(dimension.name.as_str()) {
                return Err(TaskweaveError::Config(format!(
                    "duplicate rubric dimension '{}'",
                    dimension.name
                )));
            }
            if !dimension.weight.is_finite() || dimension.weight < 0.0 {
                return Err(TaskweaveError::Config(format!(
                    "rubric dimension '{}' has an invalid weight",
                    dimension.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn base() -> OrchestratorConfig {
        OrchestratorConfig::new(vec![WorkerProfile::new("coder", "Coder")])
    }

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_concurrent_workers, 4);
        assert_eq!(config.max_queue_size, 16);
        assert_eq!(config.scheduler, SchedulerConfig::Fifo);
        assert_eq!(config.router, RouterConfig::Capability { threshold: 0.5 });
        assert_eq!(config.judge.threshold, 0.7);
        assert!(config.judge.retry_on_failure);
    }

    #[test]
    fn test_requires_profiles() {
        let err = OrchestratorConfig::default().validate().unwrap_err();
        assert!(matches!(err, TaskweaveError::Config(_)));
        assert!(base().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_workers_and_duplicate_profiles() {
        assert!(base().with_max_concurrent_workers(0).validate().is_err());

        let mut config = base();
        config.profiles.push(WorkerProfile::new("coder", "Other coder"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate worker profile id 'coder'"));
    }

    #[test]
    fn test_rejects_bad_priority_weights() {
        let zero = base().with_scheduler(SchedulerConfig::Priority {
            weights: PriorityWeights {
                urgency: 0.0,
                complexity: 0.0,
                dependency: 0.0,
            },
        });
        assert!(zero.validate().is_err());

        let negative = base().with_scheduler(SchedulerConfig::Priority {
            weights: PriorityWeights {
                urgency: -1.0,
                ..PriorityWeights::default()
            },
        });
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_thresholds() {
        let router = base().with_router(RouterConfig::Capability { threshold: 1.5 });
        assert!(router.validate().is_err());

        let judge = base().with_judge(JudgeConfig {
            threshold: -0.1,
            ..JudgeConfig::default()
        });
        assert!(judge.validate().is_err());
    }

    #[test]
    fn test_static_table_must_name_known_profiles() {
        let config = base().with_router(RouterConfig::Static {
            table: HashMap::from([("review".to_string(), "reviewer".to_string())]),
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown profile 'reviewer'"));
    }

    #[test]
    fn test_rejects_duplicate_rubric_dimensions() {
        let config = base().with_judge(JudgeConfig {
            strategy: JudgeStrategy::LlmEval {
                rubric: vec![
                    RubricDimension::new("correctness", 0.5, ""),
                    RubricDimension::new("correctness", 0.5, ""),
                ],
            },
            ..JudgeConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_implementation_names() {
        assert_eq!(SchedulerConfig::CriticalPath.implementation_name(), "critical-path");
        assert_eq!(RouterConfig::RoundRobin.implementation_name(), "round-robin");
        assert_eq!(
            JudgeStrategy::LlmEval { rubric: vec![] }.implementation_name(),
            "llm-eval"
        );
        let custom = SchedulerConfig::Custom {
            name: "shortest-first".into(),
            params: serde_json::Value::Null,
        };
        assert_eq!(custom.implementation_name(), "shortest-first");
    }

    #[test]
    fn test_from_toml() {
        let source = r#"
            max_concurrent_workers = 2

            [scheduler]
            kind = "priority"

            [scheduler.weights]
            urgency = 0.2
            complexity = 0.7
            dependency = 0.1

            [router]
            kind = "static"

            [router.table]
            implement = "coder"

            [judge]
            threshold = 0.8

            [judge.strategy]
            kind = "hybrid"
            rubric = [{ name = "correctness", weight = 1.0 }]

            [[profiles]]
            id = "coder"
            name = "Coder"

            [profiles.capabilities]
            skills = ["rust"]
        "#;
        let config = OrchestratorConfig::from_toml_str(source).unwrap();
        assert_eq!(config.max_concurrent_workers, 2);
        assert_eq!(config.max_queue_size, 16);
        assert_eq!(config.scheduler.implementation_name(), "priority");
        assert_eq!(config.router.implementation_name(), "static");
        assert_eq!(config.judge.strategy.implementation_name(), "hybrid");
        assert_eq!(config.judge.threshold, 0.8);
        assert!(config.profile("coder").unwrap().capabilities.skills.contains("rust"));
        config.validate().unwrap();
    }

    #[test]
    fn test_from_json_custom_strategy() {
        let source = r#"{
            "scheduler": {"kind": "custom", "name": "shortest-first", "params": {"limit": 3}},
            "router": {"kind": "round-robin"},
            "profiles": [{"id": "coder", "name": "Coder"}]
        }"#;
        let config = OrchestratorConfig::from_json_str(source).unwrap();
        match &config.scheduler {
            SchedulerConfig::Custom { name, params } => {
                assert_eq!(name, "shortest-first");
                assert_eq!(params["limit"], 3);
            }
            other => panic!("unexpected scheduler {other:?}"),
        }
        assert_eq!(config.router, RouterConfig::RoundRobin);
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_kind_is_a_parse_error() {
        let err = OrchestratorConfig::from_json_str(r#"{"scheduler": {"kind": "lottery"}}"#)
            .unwrap_err();
        assert!(matches!(err, TaskweaveError::Json(_)));
    }
}
