//! Quality gates applied to a worker's output.
//!
//! Every judge shares the same verdict rule: `passed = score >= threshold`
//! and `should_retry = !passed && retry_on_failure`. The strategies differ
//! only in how they arrive at the score.

use crate::backend::ExecutionOutput;
use crate::config::RubricDimension;
use crate::types::{CriterionKind, JudgeResult, TaskDefinition};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use taskweave_core::TaskweaveResult;
use tracing::{debug, warn};

/// Weight of the test signal in the deterministic score.
pub const TESTS_WEIGHT: f64 = 0.5;
/// Weight of the lint signal in the deterministic score.
pub const LINT_WEIGHT: f64 = 0.3;
/// Weight of the output-presence signal in the deterministic score.
pub const OUTPUT_WEIGHT: f64 = 0.2;

/// Scores and gates one attempt.
#[async_trait]
pub trait Judge: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate(&self, task: &TaskDefinition, output: &ExecutionOutput) -> JudgeResult;
}

/// Scores one rubric dimension of an output, typically by asking a model.
#[async_trait]
pub trait RubricEvaluator: Send + Sync {
    /// Return a score in `[0, 1]`; values outside are clamped.
    async fn score(
        &self,
        task: &TaskDefinition,
        output: &ExecutionOutput,
        dimension: &RubricDimension,
    ) -> TaskweaveResult<f64>;
}

fn verdict(
    score: f64,
    breakdown: BTreeMap<String, f64>,
    feedback: Vec<String>,
    threshold: f64,
    retry_on_failure: bool,
) -> JudgeResult {
    let score = score.clamp(0.0, 1.0);
    let passed = score >= threshold;
    JudgeResult {
        passed,
        score,
        breakdown,
        feedback,
        should_retry: !passed && retry_on_failure,
    }
}

/// Weighted sum over the objective signals present in the output.
///
/// Tests and lint only count when the backend reported them; output presence
/// always counts. The sum is normalised by the weights that were present, so
/// a perfect output scores 1.0 whichever signals exist.
pub struct DeterministicJudge {
    threshold: f64,
    retry_on_failure: bool,
}

impl DeterministicJudge {
    pub fn new(threshold: f64, retry_on_failure: bool) -> Self {
        Self {
            threshold,
            retry_on_failure,
        }
    }

    fn baseline(output: &ExecutionOutput) -> (f64, BTreeMap<String, f64>, Vec<String>) {
        let mut breakdown = BTreeMap::new();
        let mut feedback = Vec::new();
        let mut weighted = 0.0;
        let mut present = 0.0;

        let mut signal = |name: &str, weight: f64, ok: bool, complaint: &str| {
            let value = if ok { 1.0 } else { 0.0 };
            breakdown.insert(name.to_string(), value);
            weighted += weight * value;
            present += weight;
            if !ok {
                feedback.push(complaint.to_string());
            }
        };

        if let Some(passed) = output.tests_passed {
            signal("tests", TESTS_WEIGHT, passed, "tests failed");
        }
        if let Some(passed) = output.lint_passed {
            signal("lint", LINT_WEIGHT, passed, "lint reported problems");
        }
        let has_output = output
            .output
            .as_deref()
            .is_some_and(|o| !o.trim().is_empty());
        signal("output", OUTPUT_WEIGHT, has_output, "no output produced");

        (weighted / present, breakdown, feedback)
    }
}

#[async_trait]
impl Judge for DeterministicJudge {
    fn name(&self) -> &str {
        "deterministic"
    }

    async fn evaluate(&self, task: &TaskDefinition, output: &ExecutionOutput) -> JudgeResult {
        let (score, breakdown, feedback) = Self::baseline(output);
        debug!(task_id = %task.id, score, "Deterministic evaluation");
        verdict(
            score,
            breakdown,
            feedback,
            self.threshold,
            self.retry_on_failure,
        )
    }
}

/// Rubric-weighted mean of per-dimension evaluator scores.
///
/// The rubric is the configured dimensions plus the task's own
/// model-evaluated acceptance criteria. With no dimensions at all the
/// deterministic baseline is used instead.
pub struct LlmEvalJudge {
    rubric: Vec<RubricDimension>,
    evaluator: Arc<dyn RubricEvaluator>,
    threshold: f64,
    retry_on_failure: bool,
}

impl LlmEvalJudge {
    pub fn new(
        rubric: Vec<RubricDimension>,
        evaluator: Arc<dyn RubricEvaluator>,
        threshold: f64,
        retry_on_failure: bool,
    ) -> Self {
        Self {
            rubric,
            evaluator,
            threshold,
            retry_on_failure,
        }
    }

    fn dimensions(&self, task: &TaskDefinition) -> Vec<RubricDimension> {
        let mut dimensions = self.rubric.clone();
        for criterion in &task.acceptance_criteria {
            if criterion.kind == CriterionKind::LlmEvaluated
                && !dimensions.iter().any(|d| d.name == criterion.description)
            {
                dimensions.push(RubricDimension::new(
                    criterion.description.clone(),
                    criterion.weight,
                    criterion.description.clone(),
                ));
            }
        }
        dimensions
    }

    async fn rubric_score(
        &self,
        task: &TaskDefinition,
        output: &ExecutionOutput,
    ) -> (f64, BTreeMap<String, f64>, Vec<String>) {
        let dimensions = self.dimensions(task);
        if dimensions.is_empty() {
            return DeterministicJudge::baseline(output);
        }

        let mut breakdown = BTreeMap::new();
        let mut feedback = Vec::new();
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for dimension in &dimensions {
            let score = match self.evaluator.score(task, output, dimension).await {
                Ok(score) => score.clamp(0.0, 1.0),
                Err(e) => {
                    warn!(task_id = %task.id, dimension = %dimension.name, error = %e, "Rubric evaluation failed");
                    feedback.push(format!("{}: evaluation failed ({e})", dimension.name));
                    0.0
                }
            };
            breakdown.insert(dimension.name.clone(), score);
            weighted += dimension.weight * score;
            total_weight += dimension.weight;
        }

        let score = if total_weight > 0.0 {
            weighted / total_weight
        } else {
            breakdown.values().sum::<f64>() / breakdown.len() as f64
        };
        (score, breakdown, feedback)
    }
}

#[async_trait]
impl Judge for LlmEvalJudge {
    fn name(&self) -> &str {
        "llm-eval"
    }

    async fn evaluate(&self, task: &TaskDefinition, output: &ExecutionOutput) -> JudgeResult {
        let (score, breakdown, feedback) = self.rubric_score(task, output).await;
        debug!(task_id = %task.id, score, "Rubric evaluation");
        verdict(
            score,
            breakdown,
            feedback,
            self.threshold,
            self.retry_on_failure,
        )
    }
}

/// Tests act as a hard gate in front of the rubric.
pub struct HybridJudge {
    rubric: LlmEvalJudge,
}

impl HybridJudge {
    pub fn new(
        rubric: Vec<RubricDimension>,
        evaluator: Arc<dyn RubricEvaluator>,
        threshold: f64,
        retry_on_failure: bool,
    ) -> Self {
        Self {
            rubric: LlmEvalJudge::new(rubric, evaluator, threshold, retry_on_failure),
        }
    }
}

#[async_trait]
impl Judge for HybridJudge {
    fn name(&self) -> &str {
        "hybrid"
    }

    async fn evaluate(&self, task: &TaskDefinition, output: &ExecutionOutput) -> JudgeResult {
        if output.tests_passed == Some(false) {
            debug!(task_id = %task.id, "Tests failed, skipping rubric");
            return verdict(
                0.0,
                BTreeMap::from([("tests".to_string(), 0.0)]),
                vec!["tests failed; rubric evaluation skipped".to_string()],
                self.rubric.threshold,
                self.rubric.retry_on_failure,
            );
        }
        self.rubric.evaluate(task, output).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use taskweave_core::TaskweaveError;

    /// Returns a fixed score per dimension name and counts calls.
    struct FixedEvaluator {
        scores: BTreeMap<String, f64>,
        calls: AtomicUsize,
    }

    impl FixedEvaluator {
        fn new(scores: &[(&str, f64)]) -> Arc<Self> {
            Arc::new(Self {
                scores: scores.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RubricEvaluator for FixedEvaluator {
        async fn score(
            &self,
            _task: &TaskDefinition,
            _output: &ExecutionOutput,
            dimension: &RubricDimension,
        ) -> TaskweaveResult<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.scores
                .get(&dimension.name)
                .copied()
                .ok_or_else(|| TaskweaveError::Judge(format!("no score for {}", dimension.name)))
        }
    }

    fn task() -> TaskDefinition {
        TaskDefinition::new("t1", "implement", "Write the parser")
    }

    fn rubric() -> Vec<RubricDimension> {
        vec![
            RubricDimension::new("correctness", 0.75, "Does it work?"),
            RubricDimension::new("style", 0.25, "Is it idiomatic?"),
        ]
    }

    #[tokio::test]
    async fn test_deterministic_all_signals_pass() {
        let judge = DeterministicJudge::new(0.7, true);
        let output = ExecutionOutput::success("diff")
            .with_tests(true)
            .with_lint(true);
        let result = judge.evaluate(&task(), &output).await;
        assert!((result.score - 1.0).abs() < 1e-9);
        assert!(result.passed);
        assert!(!result.should_retry);
        assert_eq!(result.breakdown.len(), 3);
    }

    #[tokio::test]
    async fn test_deterministic_uses_present_signals_only() {
        let judge = DeterministicJudge::new(0.7, true);
        // Only output presence is known.
        let result = judge.evaluate(&task(), &ExecutionOutput::success("diff")).await;
        assert_eq!(result.score, 1.0);
        assert!(!result.breakdown.contains_key("tests"));

        // Lint failed, output present: 0.2 / 0.5.
        let output = ExecutionOutput::success("diff").with_lint(false);
        let result = judge.evaluate(&task(), &output).await;
        assert!((result.score - 0.4).abs() < 1e-9);
        assert!(!result.passed);
        assert!(result.should_retry);
        assert_eq!(result.feedback, vec!["lint reported problems"]);
    }

    #[tokio::test]
    async fn test_retry_disabled() {
        let judge = DeterministicJudge::new(0.7, false);
        let output = ExecutionOutput::success("").with_tests(false);
        let result = judge.evaluate(&task(), &output).await;
        assert_eq!(result.score, 0.0);
        assert!(!result.passed);
        assert!(!result.should_retry);
    }

    #[tokio::test]
    async fn test_llm_eval_weighted_mean() {
        let evaluator = FixedEvaluator::new(&[("correctness", 1.0), ("style", 0.4)]);
        let judge = LlmEvalJudge::new(rubric(), evaluator.clone(), 0.7, true);
        let output = ExecutionOutput::success("diff").with_tests(false);
        let result = judge.evaluate(&task(), &output).await;
        // 0.75 * 1.0 + 0.25 * 0.4; the failed tests do not count.
        assert!((result.score - 0.85).abs() < 1e-9);
        assert!(result.passed);
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_llm_eval_includes_task_criteria() {
        let evaluator =
            FixedEvaluator::new(&[("correctness", 1.0), ("style", 1.0), ("documented", 0.0)]);
        let judge = LlmEvalJudge::new(rubric(), evaluator.clone(), 0.7, true);
        let task = task()
            .with_criterion(CriterionKind::LlmEvaluated, 1.0, "documented")
            .with_criterion(CriterionKind::Deterministic, 1.0, "compiles");
        let result = judge.evaluate(&task, &ExecutionOutput::success("diff")).await;
        assert!((result.score - 0.5).abs() < 1e-9);
        assert_eq!(result.breakdown.get("documented"), Some(&0.0));
        assert!(!result.breakdown.contains_key("compiles"));
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_llm_eval_error_scores_zero() {
        let evaluator = FixedEvaluator::new(&[("correctness", 1.0)]);
        let judge = LlmEvalJudge::new(rubric(), evaluator, 0.7, true);
        let result = judge.evaluate(&task(), &ExecutionOutput::success("diff")).await;
        assert!((result.score - 0.75).abs() < 1e-9);
        assert_eq!(result.breakdown.get("style"), Some(&0.0));
        assert!(result.feedback[0].starts_with("style: evaluation failed"));
    }

    #[tokio::test]
    async fn test_llm_eval_without_dimensions_falls_back() {
        let evaluator = FixedEvaluator::new(&[]);
        let judge = LlmEvalJudge::new(Vec::new(), evaluator.clone(), 0.7, true);
        let output = ExecutionOutput::success("diff").with_tests(true);
        let result = judge.evaluate(&task(), &output).await;
        assert!(result.passed);
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_hybrid_gate_skips_evaluator() {
        let evaluator = FixedEvaluator::new(&[("correctness", 1.0), ("style", 1.0)]);
        let judge = HybridJudge::new(rubric(), evaluator.clone(), 0.7, true);
        let output = ExecutionOutput::success("diff").with_tests(false);
        let result = judge.evaluate(&task(), &output).await;
        assert!(!result.passed);
        assert!(result.should_retry);
        assert_eq!(result.score, 0.0);
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_hybrid_passes_through_to_rubric() {
        let evaluator = FixedEvaluator::new(&[("correctness", 1.0), ("style", 0.6)]);
        let judge = HybridJudge::new(rubric(), evaluator.clone(), 0.7, true);
        let output = ExecutionOutput::success("diff").with_tests(true);
        let result = judge.evaluate(&task(), &output).await;
        assert!((result.score - 0.9).abs() < 1e-9);
        assert!(result.passed);
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 2);
        assert_eq!(judge.name(), "hybrid");
    }
}
