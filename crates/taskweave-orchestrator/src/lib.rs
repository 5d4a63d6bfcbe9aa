//! Task orchestration engine for AI worker agents.
//!
//! A planner turns a goal into a dependency graph of tasks. The engine walks
//! that graph in ticks: a [`Scheduler`] picks ready tasks, a [`Router`] maps
//! each one to a [`WorkerProfile`], the [`WorkerPool`] hands out a worker, an
//! [`ExecutionBackend`] does the work and a [`Judge`] decides whether the
//! result is accepted, retried or failed.
//!
//! # Main types
//!
//! - [`Orchestrator`]: configures components and drives runs.
//! - [`ModuleRegistry`]: named scheduler, router and judge implementations.
//! - [`OrchestratorConfig`]: run-wide limits, strategy selection and profiles.
//! - [`TaskQueue`]: task state arena with guarded status transitions.
//! - [`RunSummary`]: terminal report of a run.

/// Execution backend, cost tracking and planner boundaries.
pub mod backend;
/// Orchestrator configuration and strategy selection.
pub mod config;
/// The orchestration loop.
pub mod engine;
/// Output evaluation strategies.
pub mod judge;
/// Bounded worker instance pool.
pub mod pool;
/// Built-in worker profiles.
pub mod profiles;
/// Named strategy factories.
pub mod registry;
/// Task-to-profile routing strategies.
pub mod router;
/// Task selection strategies.
pub mod scheduler;
/// Task state arena.
pub mod task_queue;
/// Structured run events.
pub mod trace;
/// Shared task, worker and verdict types.
pub mod types;
/// Task graph checks run before every execution.
pub mod validation;

pub use backend::{
    CostStatus, CostTracker, ExecutionBackend, ExecutionOptions, ExecutionOutput, Planner,
    TokenBudget, TokenUsage,
};
pub use config::{
    JudgeConfig, JudgeStrategy, OrchestratorConfig, PriorityWeights, RouterConfig,
    RubricDimension, SchedulerConfig,
};
pub use engine::{CancellationFlag, HaltReason, Orchestrator, RunStatus, RunSummary};
pub use judge::{DeterministicJudge, HybridJudge, Judge, LlmEvalJudge, RubricEvaluator};
pub use pool::{PoolStats, WorkerPool};
pub use profiles::{default_profiles, default_static_table};
pub use registry::{BuildContext, Module, ModuleKind, ModuleRegistry, ModuleSpec};
pub use router::{CapabilityRouter, RoundRobinRouter, RouteDecision, Router, StaticRouter};
pub use scheduler::{
    CriticalPathScheduler, FifoScheduler, PriorityScheduler, ScheduleDecision, Scheduler,
};
pub use task_queue::{StatusCounts, TaskHandle, TaskQueue};
pub use trace::{
    ChannelTraceSink, MemoryTraceSink, NullTraceSink, TraceEvent, TraceEventType, TraceSink,
};
pub use types::{
    AcceptanceCriterion, Complexity, CriterionKind, JudgeResult, TaskDefinition, TaskState,
    TaskStatus, WorkerInstance, WorkerProfile, WorkerStatus, WorkflowError,
};
pub use validation::{validate_tasks, ValidationReport};
