use crate::types::{ModelSpec, WorkerProfile};
use std::collections::HashMap;

/// Built-in worker profiles for a software-delivery pipeline.
///
/// Implementers and reviewers are persistent so they keep context across
/// related tasks; testers start fresh for every task.
pub fn default_profiles() -> Vec<WorkerProfile> {
    vec![
        implementer_profile(),
        tester_profile(),
        reviewer_profile(),
        generalist_profile(),
    ]
}

/// Task type → profile id table matching [`default_profiles`], for the static router.
pub fn default_static_table() -> HashMap<String, String> {
    [
        ("spec", "generalist"),
        ("implement", "implementer"),
        ("refactor", "implementer"),
        ("test", "tester"),
        ("review", "reviewer"),
        ("docs", "generalist"),
    ]
    .into_iter()
    .map(|(task_type, profile)| (task_type.to_string(), profile.to_string()))
    .collect()
}

fn implementer_profile() -> WorkerProfile {
    let mut profile = WorkerProfile::new("implementer", "Implementer")
        .with_skills(["rust", "python", "typescript", "api-design", "refactoring"])
        .with_tools(["read", "edit", "write", "shell"])
        .with_max_retries(2);
    profile.operational.max_runtime_secs = 1800;
    profile.system_prompt = Some(IMPLEMENTER_PROMPT.to_string());
    profile
}

fn tester_profile() -> WorkerProfile {
    let mut profile = WorkerProfile::new("tester", "Tester")
        .with_skills(["testing", "rust", "python", "typescript"])
        .with_tools(["read", "write", "shell"])
        .episodic(true)
        .with_max_retries(1);
    profile.operational.max_runtime_secs = 900;
    profile.system_prompt = Some(TESTER_PROMPT.to_string());
    profile
}

fn reviewer_profile() -> WorkerProfile {
    let mut profile = WorkerProfile::new("reviewer", "Reviewer")
        .with_skills(["code-review", "security", "documentation"])
        .with_tools(["read"])
        .with_model(ModelSpec {
            provider: "claude-code".to_string(),
            model: "opus".to_string(),
            max_tokens: Some(8192),
        })
        .with_max_retries(1);
    profile.operational.max_runtime_secs = 600;
    profile.system_prompt = Some(REVIEWER_PROMPT.to_string());
    profile
}

fn generalist_profile() -> WorkerProfile {
    let mut profile = WorkerProfile::new("generalist", "Generalist")
        .with_skills(["analysis", "documentation", "writing"])
        .with_tools(["read", "write"]);
    profile.system_prompt = Some(GENERALIST_PROMPT.to_string());
    profile
}

const IMPLEMENTER_PROMPT: &str = "\
You are an implementation worker. You turn a task description into working, \
idiomatic code that follows the project's existing patterns.

Rules:
1. Read the surrounding code before changing it.
2. Keep changes focused on the task; no unrelated refactors.
3. Handle errors explicitly; never panic in production paths.
4. Make sure the project builds and existing tests still pass.
";

const TESTER_PROMPT: &str = "\
You are a testing worker. You write and run tests that prove the task's \
acceptance criteria hold.

Rules:
1. Cover happy paths, edge cases and error conditions.
2. Follow the test conventions already used in the project.
3. Report failing tests plainly; do not weaken assertions to make them pass.
";

const REVIEWER_PROMPT: &str = "\
You are a review worker. You read the change and judge it for correctness, \
security and maintainability.

Rules:
1. Flag bugs and unsafe error handling first.
2. Check the change against each acceptance criterion.
3. Do not edit files; report findings only.
";

const GENERALIST_PROMPT: &str = "\
You are a general-purpose worker. You analyse requirements and write clear \
prose: specifications, plans and documentation.
";
