use crate::backend::{
    build_prompt, CostTracker, ExecutionBackend, ExecutionOptions, Planner, TokenUsage,
};
use crate::config::OrchestratorConfig;
use crate::judge::{Judge, RubricEvaluator};
use crate::pool::{PoolStats, ReleaseOutcome, WorkerPool};
use crate::registry::{BuildContext, ModuleRegistry};
use crate::router::Router;
use crate::scheduler::Scheduler;
use crate::task_queue::{StatusCounts, TaskHandle, TaskQueue};
use crate::trace::{NullTraceSink, TraceEventType, TraceSink, Tracer};
use crate::types::{
    JudgeResult, TaskDefinition, TaskResult, TaskState, TaskStatus, WorkOutcome, WorkerProfile,
    WorkflowError,
};
use crate::validation::validate_tasks;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskweave_core::{TaskweaveError, TaskweaveResult};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared flag that stops new scheduling once set.
///
/// Checked at the start of every tick; in-flight work is left to drain.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag so the next run starts normally.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Why a run stopped scheduling before every task was terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HaltReason {
    Cancelled,
    BudgetExceeded,
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::Cancelled => write!(f, "cancelled"),
            HaltReason::BudgetExceeded => write!(f, "budget exceeded"),
        }
    }
}

/// Live snapshot of the current (or last) run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: Option<Uuid>,
    pub running: bool,
    pub tick: u64,
    pub tasks: StatusCounts,
    pub pool: PoolStats,
    pub halted: Option<HaltReason>,
}

/// Terminal state of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    /// Tasks never finished because the run halted.
    pub pending_tasks: usize,
    pub errors: Vec<WorkflowError>,
    pub halted: Option<HaltReason>,
    pub duration_ms: u64,
    pub summary: String,
    /// Final record of every task, in planner order.
    pub tasks: Vec<TaskState>,
}

impl RunSummary {
    pub fn task(&self, id: &str) -> Option<&TaskState> {
        self.tasks.iter().find(|t| t.id() == id)
    }
}

/// Messages from dispatched executions back to the loop.
///
/// A successful execution sends `Executed` then `Judged`; anything else
/// sends a single `Failed`.
#[derive(Debug)]
enum DispatchEvent {
    Executed {
        handle: TaskHandle,
        dispatch: u64,
        tokens: TokenUsage,
    },
    Judged {
        handle: TaskHandle,
        dispatch: u64,
        output: Option<String>,
        verdict: JudgeResult,
    },
    Failed {
        handle: TaskHandle,
        dispatch: u64,
        error: String,
        tokens: TokenUsage,
    },
}

impl DispatchEvent {
    fn key(&self) -> (TaskHandle, u64) {
        match self {
            DispatchEvent::Executed {
                handle, dispatch, ..
            }
            | DispatchEvent::Judged {
                handle, dispatch, ..
            }
            | DispatchEvent::Failed {
                handle, dispatch, ..
            } => (*handle, *dispatch),
        }
    }
}

/// Components built by [`Orchestrator::configure`].
struct Configured {
    config: OrchestratorConfig,
    scheduler: Arc<dyn Scheduler>,
    router: Arc<dyn Router>,
    judge: Arc<dyn Judge>,
    pool: Arc<WorkerPool>,
}

struct InFlight {
    dispatch: u64,
    worker_id: Uuid,
    profile: WorkerProfile,
    started: Instant,
    deadline: Duration,
    tokens: u64,
}

/// Mutable state of one run, owned by the loop.
struct RunState {
    tracer: Tracer,
    queue: TaskQueue,
    in_flight: HashMap<TaskHandle, InFlight>,
    errors: Vec<WorkflowError>,
    halted: Option<HaltReason>,
    budget_exceeded: bool,
    budget_warned: bool,
    next_dispatch: u64,
    tick: u64,
}

impl RunState {
    fn record_error(
        &mut self,
        task_id: Option<&str>,
        module: &str,
        message: String,
        recoverable: bool,
    ) {
        self.errors
            .push(WorkflowError::new(task_id, module, message, recoverable));
    }
}

/// What one scheduling pass changed.
#[derive(Default)]
struct TickOutcome {
    dispatched: usize,
    failed: usize,
}

/// The orchestration engine.
///
/// Each tick asks the scheduler for eligible tasks, routes each one to a
/// worker profile, acquires a worker from the pool and dispatches the
/// execution. Executions run concurrently and report back over a channel;
/// all task and worker state changes happen on the loop.
pub struct Orchestrator {
    registry: ModuleRegistry,
    backend: Arc<dyn ExecutionBackend>,
    evaluator: Option<Arc<dyn RubricEvaluator>>,
    cost_tracker: Option<Arc<dyn CostTracker>>,
    trace_sink: Arc<dyn TraceSink>,
    cancellation: CancellationFlag,
    configured: Option<Configured>,
    running: AtomicBool,
    status: Mutex<RunStatus>,
}

impl Orchestrator {
    /// Create an orchestrator with the built-in strategies registered.
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            registry: ModuleRegistry::with_builtins(),
            backend,
            evaluator: None,
            cost_tracker: None,
            trace_sink: Arc::new(NullTraceSink),
            cancellation: CancellationFlag::new(),
            configured: None,
            running: AtomicBool::new(false),
            status: Mutex::new(RunStatus::default()),
        }
    }

    /// Replace the module registry. Takes effect at the next `configure`.
    pub fn with_registry(mut self, registry: ModuleRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Rubric evaluator for the `llm-eval` and `hybrid` judges.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn RubricEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn with_cost_tracker(mut self, tracker: Arc<dyn CostTracker>) -> Self {
        self.cost_tracker = Some(tracker);
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace_sink = sink;
        self
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Register custom strategies before calling `configure`.
    pub fn registry_mut(&mut self) -> &mut ModuleRegistry {
        &mut self.registry
    }

    /// Handle to cancel the current run from elsewhere.
    pub fn cancellation(&self) -> CancellationFlag {
        self.cancellation.clone()
    }

    pub fn is_configured(&self) -> bool {
        self.configured.is_some()
    }

    /// Validate `config` and build every component it selects.
    ///
    /// Fails without touching the current configuration if anything is
    /// invalid or names an unregistered implementation.
    pub fn configure(&mut self, config: OrchestratorConfig) -> TaskweaveResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(TaskweaveError::Config(
                "cannot reconfigure while a run is in progress".to_string(),
            ));
        }
        config.validate()?;

        let ctx = BuildContext {
            max_queue_size: config.max_queue_size,
            evaluator: self.evaluator.clone(),
        };
        let scheduler = self.registry.build_scheduler(&config.scheduler, &ctx)?;
        let router = self.registry.build_router(&config.router, &ctx)?;
        let judge = self.registry.build_judge(&config.judge, &ctx)?;
        let pool = Arc::new(WorkerPool::new(config.max_concurrent_workers));

        info!(
            scheduler = scheduler.name(),
            router = router.name(),
            judge = judge.name(),
            max_workers = config.max_concurrent_workers,
            profiles = config.profiles.len(),
            "Orchestrator configured"
        );

        self.configured = Some(Configured {
            config,
            scheduler,
            router,
            judge,
            pool,
        });
        Ok(())
    }

    /// Snapshot of the current run, or of the last one once it finished.
    pub fn status(&self) -> RunStatus {
        let mut status = self.status.lock().clone();
        if let Some(configured) = &self.configured {
            status.pool = configured.pool.stats();
        }
        status
    }

    /// Plan `goal` once with `planner`, then execute the resulting tasks.
    pub async fn run(&self, goal: &str, planner: &dyn Planner) -> TaskweaveResult<RunSummary> {
        let configured = self.configured.as_ref().ok_or_else(not_configured)?;
        info!(goal = %goal, "Planning run");
        let tasks = planner.plan(goal).await?;
        info!(tasks = tasks.len(), "Plan complete");
        self.execute_with(configured, tasks).await
    }

    /// Execute a planned task graph until every task is terminal or the run halts.
    ///
    /// Returns `Err` only for configuration and validation problems; task
    /// failures are reported in the summary.
    pub async fn execute(&self, tasks: Vec<TaskDefinition>) -> TaskweaveResult<RunSummary> {
        let configured = self.configured.as_ref().ok_or_else(not_configured)?;
        self.execute_with(configured, tasks).await
    }

    async fn execute_with(
        &self,
        cfg: &Configured,
        tasks: Vec<TaskDefinition>,
    ) -> TaskweaveResult<RunSummary> {
        let report = validate_tasks(&tasks, &cfg.config.profiles);
        for warning in &report.warnings {
            warn!(issue = %warning, "Task graph warning");
        }
        report.ensure_valid()?;

        if self.running.swap(true, Ordering::SeqCst) {
            return Err(TaskweaveError::Orchestrator(
                "a run is already in progress".to_string(),
            ));
        }
        let result = self.drive(cfg, tasks).await;
        self.running.store(false, Ordering::SeqCst);
        self.status.lock().running = false;
        result
    }

    async fn drive(
        &self,
        cfg: &Configured,
        tasks: Vec<TaskDefinition>,
    ) -> TaskweaveResult<RunSummary> {
        let start = Instant::now();
        let run_id = Uuid::new_v4();
        let mut run = RunState {
            tracer: Tracer::new(run_id, self.trace_sink.clone()),
            queue: TaskQueue::from_definitions(tasks)?,
            in_flight: HashMap::new(),
            errors: Vec::new(),
            halted: None,
            budget_exceeded: false,
            budget_warned: false,
            next_dispatch: 0,
            tick: 0,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();

        info!(run_id = %run_id, tasks = run.queue.total_count(), "Run started");
        run.tracer.emit(
            TraceEventType::RunStarted,
            None,
            None,
            json!({
                "tasks": run.queue.total_count(),
                "scheduler": cfg.scheduler.name(),
                "router": cfg.router.name(),
                "judge": cfg.judge.name(),
            }),
        );
        {
            let mut status = self.status.lock();
            *status = RunStatus {
                run_id: Some(run_id),
                running: true,
                ..RunStatus::default()
            };
        }

        loop {
            run.tick += 1;
            run.queue.release_queued();
            self.check_halt(&mut run);

            let mut outcome = TickOutcome::default();
            if run.halted.is_none() {
                outcome.failed += self.cascade_dependency_failures(&mut run)?;
                let tick = self.schedule_tick(cfg, &mut run, &tx)?;
                outcome.dispatched += tick.dispatched;
                outcome.failed += tick.failed;
            }
            self.publish_status(&run);

            if run.in_flight.is_empty() {
                if run.halted.is_some() || run.queue.is_done() {
                    break;
                }
                if outcome.dispatched == 0 && outcome.failed == 0 {
                    self.fail_unschedulable(&mut run)?;
                }
                continue;
            }

            let Some(event) = rx.recv().await else {
                break;
            };
            self.handle_event(cfg, &mut run, event)?;
            while let Ok(event) = rx.try_recv() {
                self.handle_event(cfg, &mut run, event)?;
            }
        }

        for worker in cfg.pool.shutdown() {
            debug!(worker_id = %worker.id, status = ?worker.status, "Worker shut down");
            run.tracer.emit(
                TraceEventType::WorkerTerminated,
                None,
                Some(worker.id),
                json!({
                    "reason": "shutdown",
                    "profile": worker.profile_id,
                    "tasks_completed": worker.metrics.tasks_completed,
                }),
            );
        }

        let counts = run.queue.counts();
        let duration_ms = start.elapsed().as_millis() as u64;
        let summary = match run.halted {
            Some(reason) => format!(
                "Run halted ({reason}): {}/{} tasks completed, {} failed, {} not started",
                counts.completed,
                run.queue.total_count(),
                counts.failed,
                counts.pending
            ),
            None => format!(
                "Run complete: {}/{} tasks completed, {} failed",
                counts.completed,
                run.queue.total_count(),
                counts.failed
            ),
        };
        info!(
            run_id = %run_id,
            completed = counts.completed,
            failed = counts.failed,
            pending = counts.pending,
            duration_ms,
            "Run finished"
        );
        run.tracer.emit(
            TraceEventType::RunCompleted,
            None,
            None,
            json!({
                "completed": counts.completed,
                "failed": counts.failed,
                "pending": counts.pending,
                "duration_ms": duration_ms,
            }),
        );
        self.publish_status(&run);

        Ok(RunSummary {
            run_id,
            total_tasks: run.queue.total_count(),
            completed_tasks: counts.completed,
            failed_tasks: counts.failed,
            pending_tasks: counts.pending,
            errors: run.errors,
            halted: run.halted,
            duration_ms,
            summary,
            tasks: run.queue.into_states(),
        })
    }

    fn check_halt(&self, run: &mut RunState) {
        if run.halted.is_some() || run.queue.is_done() {
            return;
        }
        let reason = if self.cancellation.is_cancelled() {
            HaltReason::Cancelled
        } else if run.budget_exceeded {
            HaltReason::BudgetExceeded
        } else {
            return;
        };
        warn!(
            reason = %reason,
            in_flight = run.in_flight.len(),
            "Halting run, draining in-flight tasks"
        );
        run.tracer.emit(
            TraceEventType::RunHalted,
            None,
            None,
            json!({"reason": reason, "in_flight": run.in_flight.len()}),
        );
        run.halted = Some(reason);
    }

    /// Fail pending tasks whose dependencies can no longer complete.
    fn cascade_dependency_failures(&self, run: &mut RunState) -> TaskweaveResult<usize> {
        let mut failed = 0;
        loop {
            let doomed: Vec<(TaskHandle, String)> = (0..run.queue.total_count())
                .map(TaskHandle)
                .filter(|h| {
                    run.queue
                        .get(*h)
                        .is_some_and(|s| s.status == TaskStatus::Pending)
                })
                .filter_map(|h| run.queue.failed_dependency(h).map(|d| (h, d.to_string())))
                .collect();
            if doomed.is_empty() {
                return Ok(failed);
            }
            for (handle, dep) in doomed {
                self.fail_pending(run, handle, &format!("dependency {dep} failed"))?;
                failed += 1;
            }
        }
    }

    /// Nothing is in flight and nothing could be dispatched: fail what is left.
    fn fail_unschedulable(&self, run: &mut RunState) -> TaskweaveResult<()> {
        let stuck: Vec<TaskHandle> = run
            .queue
            .states()
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.status.is_terminal())
            .map(|(i, _)| TaskHandle(i))
            .collect();
        warn!(tasks = stuck.len(), "No task can make progress");
        for handle in stuck {
            self.fail_pending(run, handle, "unschedulable")?;
        }
        Ok(())
    }

    fn fail_pending(
        &self,
        run: &mut RunState,
        handle: TaskHandle,
        reason: &str,
    ) -> TaskweaveResult<()> {
        run.queue.mark_failed(handle)?;
        let id = task_id(&run.queue, handle);
        warn!(task_id = %id, reason, "Task failed without running");
        run.record_error(Some(&id), "scheduler", reason.to_string(), false);
        run.tracer.emit(
            TraceEventType::TaskFailed,
            Some(&id),
            None,
            json!({"reason": reason}),
        );
        Ok(())
    }

    fn schedule_tick(
        &self,
        cfg: &Configured,
        run: &mut RunState,
        tx: &mpsc::UnboundedSender<DispatchEvent>,
    ) -> TaskweaveResult<TickOutcome> {
        let mut outcome = TickOutcome::default();
        let available = cfg.pool.available();
        let mut decision = cfg.scheduler.schedule(run.queue.states(), available);
        if decision.is_empty() {
            return Ok(outcome);
        }
        decision.scheduled.truncate(available);
        decision.queued.truncate(cfg.config.max_queue_size);
        debug!(
            tick = run.tick,
            available,
            scheduled = decision.scheduled.len(),
            queued = decision.queued.len(),
            "Scheduling decision"
        );

        for handle in decision.scheduled {
            if !self.queue_task(run, handle, false) {
                continue;
            }
            match self.dispatch(cfg, run, handle, tx)? {
                Dispatch::Started => outcome.dispatched += 1,
                Dispatch::Backpressure => {}
                Dispatch::Unroutable => outcome.failed += 1,
            }
        }
        for handle in decision.queued {
            self.queue_task(run, handle, true);
        }
        Ok(outcome)
    }

    /// Move a task to queued, refusing anything the scheduler should not have picked.
    fn queue_task(&self, run: &mut RunState, handle: TaskHandle, overflow: bool) -> bool {
        if let Err(e) = run.queue.mark_queued(handle) {
            warn!(error = %e, "Scheduler picked an ineligible task");
            run.record_error(None, "scheduler", e.to_string(), true);
            return false;
        }
        let id = task_id(&run.queue, handle);
        run.tracer.emit(
            TraceEventType::TaskQueued,
            Some(&id),
            None,
            json!({"tick": run.tick, "overflow": overflow}),
        );
        true
    }

    fn dispatch(
        &self,
        cfg: &Configured,
        run: &mut RunState,
        handle: TaskHandle,
        tx: &mpsc::UnboundedSender<DispatchEvent>,
    ) -> TaskweaveResult<Dispatch> {
        let task = run
            .queue
            .get(handle)
            .map(|s| s.task.clone())
            .ok_or_else(|| {
                TaskweaveError::Orchestrator(format!("unknown task handle {}", handle.0))
            })?;

        let route = cfg.router.route(&task, &cfg.config.profiles);
        let profile = route
            .profile_id
            .as_deref()
            .and_then(|id| cfg.config.profile(id));
        let Some(profile) = profile else {
            let err = TaskweaveError::Routing(format!(
                "router '{}' returned no usable profile",
                cfg.router.name()
            ));
            let message = err.to_string();
            error!(task_id = %task.id, "{message}");
            run.queue.mark_failed(handle)?;
            run.record_error(Some(&task.id), "router", message.clone(), err.is_recoverable());
            run.tracer.emit(
                TraceEventType::TaskFailed,
                Some(&task.id),
                None,
                json!({"reason": message}),
            );
            return Ok(Dispatch::Unroutable);
        };
        if route.fallback {
            warn!(
                task_id = %task.id,
                profile = %profile.id,
                score = route.match_score,
                reason = %route.reason,
                "Routing fell back to a best-effort profile"
            );
        }

        // Only reachable when the pool filled up between scheduling and dispatch.
        let Some(worker) = cfg.pool.acquire(profile, &task.id) else {
            debug!(task_id = %task.id, profile = %profile.id, "Pool saturated, task stays pending");
            run.queue.return_to_pending(handle)?;
            return Ok(Dispatch::Backpressure);
        };
        run.tracer.emit(
            TraceEventType::WorkerAcquired,
            Some(&task.id),
            Some(worker.id),
            json!({"profile": profile.id}),
        );

        run.queue.mark_assigned(handle, worker.id, &profile.id)?;
        run.tracer.emit(
            TraceEventType::TaskAssigned,
            Some(&task.id),
            Some(worker.id),
            json!({
                "profile": profile.id,
                "match_score": route.match_score,
                "reason": route.reason,
                "fallback": route.fallback,
            }),
        );
        run.queue.mark_executing(handle)?;

        let attempt = run.queue.get(handle).map_or(1, |s| s.attempts.len());
        let deadline = task.timeout().min(profile.max_runtime());
        let options = ExecutionOptions {
            model: profile.model.clone(),
            timeout: deadline,
            attempt,
        };
        let prompt = run
            .queue
            .get(handle)
            .map(|state| build_prompt(state, profile))
            .unwrap_or_default();
        let dispatch = run.next_dispatch;
        run.next_dispatch += 1;

        info!(
            task_id = %task.id,
            worker_id = %worker.id,
            profile = %profile.id,
            attempt,
            "Dispatching task"
        );

        run.in_flight.insert(
            handle,
            InFlight {
                dispatch,
                worker_id: worker.id,
                profile: profile.clone(),
                started: Instant::now(),
                deadline,
                tokens: 0,
            },
        );

        let backend = self.backend.clone();
        let judge = cfg.judge.clone();
        let events = tx.clone();
        let execution = tokio::spawn(async move {
            let expires = tokio::time::Instant::now() + deadline;
            let result =
                tokio::time::timeout_at(expires, backend.execute(&worker, &prompt, &options)).await;
            let event = match result {
                Ok(Ok(output)) if output.success => {
                    let _ = events.send(DispatchEvent::Executed {
                        handle,
                        dispatch,
                        tokens: output.tokens,
                    });
                    // Judging shares the execution deadline.
                    match tokio::time::timeout_at(expires, judge.evaluate(&task, &output)).await {
                        Ok(verdict) => DispatchEvent::Judged {
                            handle,
                            dispatch,
                            output: output.output,
                            verdict,
                        },
                        Err(_) => DispatchEvent::Failed {
                            handle,
                            dispatch,
                            error: "timeout".to_string(),
                            tokens: TokenUsage::default(),
                        },
                    }
                }
                Ok(Ok(output)) => DispatchEvent::Failed {
                    handle,
                    dispatch,
                    error: output
                        .error
                        .unwrap_or_else(|| "execution reported failure".to_string()),
                    tokens: output.tokens,
                },
                Ok(Err(e)) => DispatchEvent::Failed {
                    handle,
                    dispatch,
                    error: e.to_string(),
                    tokens: TokenUsage::default(),
                },
                Err(_) => DispatchEvent::Failed {
                    handle,
                    dispatch,
                    error: "timeout".to_string(),
                    tokens: TokenUsage::default(),
                },
            };
            let _ = events.send(event);
        });

        let watcher = tx.clone();
        tokio::spawn(async move {
            if let Err(e) = execution.await {
                let _ = watcher.send(DispatchEvent::Failed {
                    handle,
                    dispatch,
                    error: format!("execution aborted: {e}"),
                    tokens: TokenUsage::default(),
                });
            }
        });

        Ok(Dispatch::Started)
    }

    fn handle_event(
        &self,
        cfg: &Configured,
        run: &mut RunState,
        event: DispatchEvent,
    ) -> TaskweaveResult<()> {
        let (handle, dispatch) = event.key();
        if run.in_flight.get(&handle).map(|f| f.dispatch) != Some(dispatch) {
            debug!(handle = handle.0, dispatch, "Ignoring stale dispatch event");
            return Ok(());
        }

        match event {
            DispatchEvent::Executed { tokens, .. } => {
                run.queue.mark_evaluating(handle, tokens.total())?;
                if let Some(flight) = run.in_flight.get_mut(&handle) {
                    flight.tokens = tokens.total();
                }
                self.record_cost(run, handle, tokens);
                debug!(
                    task_id = %task_id(&run.queue, handle),
                    tokens = tokens.total(),
                    "Execution finished, judging"
                );
            }
            DispatchEvent::Judged {
                output, verdict, ..
            } => {
                let Some(flight) = run.in_flight.remove(&handle) else {
                    return Ok(());
                };
                self.on_judged(cfg, run, handle, flight, output, verdict)?;
            }
            DispatchEvent::Failed { error, tokens, .. } => {
                self.record_cost(run, handle, tokens);
                let Some(flight) = run.in_flight.remove(&handle) else {
                    return Ok(());
                };
                self.on_failed(cfg, run, handle, flight, error, tokens)?;
            }
        }
        self.publish_status(run);
        Ok(())
    }

    fn record_cost(&self, run: &mut RunState, handle: TaskHandle, tokens: TokenUsage) {
        let Some(tracker) = &self.cost_tracker else {
            return;
        };
        if tokens.total() == 0 {
            return;
        }
        let model = run
            .in_flight
            .get(&handle)
            .map(|f| f.profile.model.model.clone())
            .unwrap_or_default();
        let status = tracker.record(&model, tokens.input, tokens.output);
        if status.warning_triggered && !run.budget_warned {
            run.budget_warned = true;
            warn!(model = %model, "Token budget warning threshold reached");
            run.tracer.emit(
                TraceEventType::BudgetWarning,
                Some(&task_id(&run.queue, handle)),
                None,
                json!({
                    "model": model,
                    "input_tokens": tokens.input,
                    "output_tokens": tokens.output,
                }),
            );
        }
        if status.budget_exceeded && !run.budget_exceeded {
            warn!("Token budget exceeded, no new tasks will be scheduled");
            run.budget_exceeded = true;
        }
    }

    fn on_judged(
        &self,
        cfg: &Configured,
        run: &mut RunState,
        handle: TaskHandle,
        flight: InFlight,
        output: Option<String>,
        verdict: JudgeResult,
    ) -> TaskweaveResult<()> {
        let id = task_id(&run.queue, handle);
        run.queue.close_attempt(handle, None, None)?;
        let runtime_ms = flight.started.elapsed().as_millis() as u64;
        cfg.pool.finish(
            flight.worker_id,
            &WorkOutcome {
                success: verdict.passed,
                runtime_ms,
                tokens_used: flight.tokens,
                quality_score: Some(verdict.score),
            },
        );

        if verdict.passed {
            info!(task_id = %id, score = verdict.score, "Task passed judge");
            run.tracer.emit(
                TraceEventType::JudgePassed,
                Some(&id),
                Some(flight.worker_id),
                json!({"score": verdict.score, "breakdown": verdict.breakdown}),
            );
            run.queue.mark_completed(
                handle,
                TaskResult {
                    worker_id: flight.worker_id,
                    output,
                    verdict,
                },
            )?;
            run.tracer.emit(
                TraceEventType::TaskCompleted,
                Some(&id),
                Some(flight.worker_id),
                json!({"runtime_ms": runtime_ms}),
            );
        } else {
            warn!(task_id = %id, score = verdict.score, "Task failed judge");
            run.tracer.emit(
                TraceEventType::JudgeFailed,
                Some(&id),
                Some(flight.worker_id),
                json!({
                    "score": verdict.score,
                    "breakdown": verdict.breakdown,
                    "feedback": verdict.feedback,
                }),
            );
            let message = if verdict.feedback.is_empty() {
                format!("judge score {:.2} below threshold", verdict.score)
            } else {
                verdict.feedback.join("; ")
            };
            run.queue.record_feedback(handle, verdict.feedback.clone())?;
            self.retry_or_fail(
                run,
                handle,
                &flight,
                "judge",
                message,
                verdict.should_retry,
            )?;
        }

        self.release_worker(cfg, run, &id, flight.worker_id, false);
        Ok(())
    }

    fn on_failed(
        &self,
        cfg: &Configured,
        run: &mut RunState,
        handle: TaskHandle,
        flight: InFlight,
        error: String,
        tokens: TokenUsage,
    ) -> TaskweaveResult<()> {
        let id = task_id(&run.queue, handle);
        let used = tokens.total().max(flight.tokens);
        run.queue
            .close_attempt(handle, (used > 0).then_some(used), Some(error.clone()))?;
        cfg.pool.finish(
            flight.worker_id,
            &WorkOutcome {
                success: false,
                runtime_ms: flight.started.elapsed().as_millis() as u64,
                tokens_used: used,
                quality_score: None,
            },
        );
        warn!(task_id = %id, worker_id = %flight.worker_id, error = %error, "Execution failed");

        let err = if error == "timeout" {
            TaskweaveError::Timeout(flight.deadline.as_secs())
        } else {
            TaskweaveError::Execution(error)
        };
        let retryable = cfg.config.judge.retry_on_failure && err.is_recoverable();
        self.retry_or_fail(
            run,
            handle,
            &flight,
            "executor",
            err.to_string(),
            retryable,
        )?;
        self.release_worker(cfg, run, &id, flight.worker_id, true);
        Ok(())
    }

    /// Send the task back to pending if it has attempts left, else fail it.
    fn retry_or_fail(
        &self,
        run: &mut RunState,
        handle: TaskHandle,
        flight: &InFlight,
        module: &str,
        message: String,
        retryable: bool,
    ) -> TaskweaveResult<()> {
        let id = task_id(&run.queue, handle);
        let attempts = run.queue.get(handle).map_or(0, |s| s.attempts.len());
        let max_attempts = flight.profile.max_attempts();

        if retryable && attempts < max_attempts {
            run.queue.mark_retry(handle)?;
            info!(task_id = %id, attempts, max_attempts, "Retrying task");
            run.tracer.emit(
                TraceEventType::TaskRetrying,
                Some(&id),
                Some(flight.worker_id),
                json!({"attempts": attempts, "max_attempts": max_attempts, "reason": message}),
            );
            run.record_error(Some(&id), module, message, true);
        } else {
            run.queue.mark_failed(handle)?;
            error!(task_id = %id, attempts, error = %message, "Task failed permanently");
            run.tracer.emit(
                TraceEventType::TaskFailed,
                Some(&id),
                Some(flight.worker_id),
                json!({"attempts": attempts, "reason": message}),
            );
            run.record_error(Some(&id), module, message, false);
        }
        Ok(())
    }

    fn release_worker(
        &self,
        cfg: &Configured,
        run: &mut RunState,
        task_id: &str,
        worker_id: Uuid,
        terminate: bool,
    ) {
        match cfg.pool.release(worker_id, terminate) {
            Some(ReleaseOutcome::Idle) => {
                run.tracer.emit(
                    TraceEventType::WorkerCompleted,
                    Some(task_id),
                    Some(worker_id),
                    json!({"retained": true}),
                );
            }
            Some(ReleaseOutcome::Terminated) => {
                if !terminate {
                    run.tracer.emit(
                        TraceEventType::WorkerCompleted,
                        Some(task_id),
                        Some(worker_id),
                        json!({"retained": false}),
                    );
                }
                run.tracer.emit(
                    TraceEventType::WorkerTerminated,
                    Some(task_id),
                    Some(worker_id),
                    json!({"reason": if terminate { "failure" } else { "episodic" }}),
                );
            }
            None => warn!(worker_id = %worker_id, "Released unknown worker"),
        }
    }

    fn publish_status(&self, run: &RunState) {
        let mut status = self.status.lock();
        status.tick = run.tick;
        status.tasks = run.queue.counts();
        status.halted = run.halted;
    }
}

enum Dispatch {
    Started,
    Backpressure,
    Unroutable,
}

fn not_configured() -> TaskweaveError {
    TaskweaveError::Config("execute() called before configure()".to_string())
}

fn task_id(queue: &TaskQueue, handle: TaskHandle) -> String {
    queue
        .get(handle)
        .map(|s| s.id().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backend::ExecutionOutput;
    use crate::types::WorkerInstance;
    use async_trait::async_trait;

    struct EchoBackend;

    #[async_trait]
    impl ExecutionBackend for EchoBackend {
        async fn execute(
            &self,
            _worker: &WorkerInstance,
            prompt: &str,
            _options: &ExecutionOptions,
        ) -> TaskweaveResult<ExecutionOutput> {
            Ok(ExecutionOutput::success(prompt.len().to_string()))
        }
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig::new(vec![WorkerProfile::new("coder", "Coder")])
    }

    #[test]
    fn test_cancellation_flag_is_shared() {
        let orchestrator = Orchestrator::new(Arc::new(EchoBackend));
        let flag = orchestrator.cancellation();
        assert!(!orchestrator.cancellation().is_cancelled());
        flag.cancel();
        assert!(orchestrator.cancellation().is_cancelled());
        flag.reset();
        assert!(!orchestrator.cancellation().is_cancelled());
    }

    #[test]
    fn test_configure_rejects_invalid_config() {
        let mut orchestrator = Orchestrator::new(Arc::new(EchoBackend));
        let err = orchestrator
            .configure(OrchestratorConfig::default())
            .unwrap_err();
        assert!(matches!(err, TaskweaveError::Config(_)));
        assert!(!orchestrator.is_configured());
    }

    #[test]
    fn test_configure_rejects_unknown_strategy() {
        let mut orchestrator = Orchestrator::new(Arc::new(EchoBackend));
        let config = config().with_scheduler(crate::config::SchedulerConfig::Custom {
            name: "lottery".into(),
            params: serde_json::Value::Null,
        });
        let err = orchestrator.configure(config).unwrap_err();
        assert!(matches!(err, TaskweaveError::Registry(_)));
    }

    #[tokio::test]
    async fn test_execute_before_configure() {
        let orchestrator = Orchestrator::new(Arc::new(EchoBackend));
        let err = orchestrator
            .execute(vec![TaskDefinition::new("a", "implement", "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, TaskweaveError::Config(_)));
        assert!(err.to_string().contains("before configure"));
    }

    #[tokio::test]
    async fn test_empty_run_completes() {
        let mut orchestrator = Orchestrator::new(Arc::new(EchoBackend));
        orchestrator.configure(config()).unwrap();
        let summary = orchestrator.execute(Vec::new()).await.unwrap();
        assert_eq!(summary.total_tasks, 0);
        assert!(summary.halted.is_none());
        assert!(!orchestrator.status().running);
    }

    #[tokio::test]
    async fn test_single_task_status_snapshot() {
        let mut orchestrator = Orchestrator::new(Arc::new(EchoBackend));
        orchestrator.configure(config()).unwrap();
        let summary = orchestrator
            .execute(vec![TaskDefinition::new("a", "implement", "x")])
            .await
            .unwrap();
        assert_eq!(summary.completed_tasks, 1);

        let status = orchestrator.status();
        assert_eq!(status.run_id, Some(summary.run_id));
        assert_eq!(status.tasks.completed, 1);
        assert_eq!(status.pool.total, 0);
        assert!(status.tick >= 2);
    }

    #[test]
    fn test_summary_serialization() {
        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            total_tasks: 3,
            completed_tasks: 2,
            failed_tasks: 0,
            pending_tasks: 1,
            errors: Vec::new(),
            halted: Some(HaltReason::BudgetExceeded),
            duration_ms: 12,
            summary: "halted".to_string(),
            tasks: Vec::new(),
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"budget-exceeded\""));
        let parsed: RunSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.pending_tasks, 1);
    }
}
