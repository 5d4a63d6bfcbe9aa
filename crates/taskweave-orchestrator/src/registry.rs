use crate::config::{JudgeConfig, JudgeStrategy, RouterConfig, SchedulerConfig};
use crate::judge::{DeterministicJudge, HybridJudge, Judge, LlmEvalJudge, RubricEvaluator};
use crate::router::{CapabilityRouter, RoundRobinRouter, Router, StaticRouter};
use crate::scheduler::{CriticalPathScheduler, FifoScheduler, PriorityScheduler, Scheduler};
use std::collections::HashMap;
use std::sync::Arc;
use taskweave_core::{TaskweaveError, TaskweaveResult};
use tracing::{debug, info};

/// Pipeline stage a module plugs into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModuleKind {
    Scheduler,
    Router,
    Judge,
}

impl std::fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleKind::Scheduler => write!(f, "scheduler"),
            ModuleKind::Router => write!(f, "router"),
            ModuleKind::Judge => write!(f, "judge"),
        }
    }
}

/// A built strategy instance.
#[derive(Clone)]
pub enum Module {
    Scheduler(Arc<dyn Scheduler>),
    Router(Arc<dyn Router>),
    Judge(Arc<dyn Judge>),
}

impl Module {
    pub fn kind(&self) -> ModuleKind {
        match self {
            Module::Scheduler(_) => ModuleKind::Scheduler,
            Module::Router(_) => ModuleKind::Router,
            Module::Judge(_) => ModuleKind::Judge,
        }
    }
}

/// The configuration a factory builds from.
#[derive(Debug, Clone, Copy)]
pub enum ModuleSpec<'a> {
    Scheduler(&'a SchedulerConfig),
    Router(&'a RouterConfig),
    Judge(&'a JudgeConfig),
}

impl ModuleSpec<'_> {
    pub fn kind(&self) -> ModuleKind {
        match self {
            ModuleSpec::Scheduler(_) => ModuleKind::Scheduler,
            ModuleSpec::Router(_) => ModuleKind::Router,
            ModuleSpec::Judge(_) => ModuleKind::Judge,
        }
    }

    /// Registry key of the implementation the config selects.
    pub fn implementation_name(&self) -> &str {
        match self {
            ModuleSpec::Scheduler(c) => c.implementation_name(),
            ModuleSpec::Router(c) => c.implementation_name(),
            ModuleSpec::Judge(c) => c.strategy.implementation_name(),
        }
    }
}

/// Run-wide inputs factories may need besides their own config.
#[derive(Clone, Default)]
pub struct BuildContext {
    pub max_queue_size: usize,
    pub evaluator: Option<Arc<dyn RubricEvaluator>>,
}

/// Constructor stored in the registry.
pub type ModuleFactory =
    Arc<dyn Fn(ModuleSpec<'_>, &BuildContext) -> TaskweaveResult<Module> + Send + Sync>;

/// Keyed store of strategy constructors, one namespace per [`ModuleKind`].
///
/// Each orchestrator owns its registry; nothing is process-wide.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    factories: HashMap<(ModuleKind, String), ModuleFactory>,
}

impl ModuleRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in strategy.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        register_builtins(&mut registry);
        registry
    }

    /// Register `factory` under `(kind, name)`.
    ///
    /// Registering a name twice is a no-op; returns whether the factory was added.
    pub fn register<F>(&mut self, kind: ModuleKind, name: impl Into<String>, factory: F) -> bool
    where
        F: Fn(ModuleSpec<'_>, &BuildContext) -> TaskweaveResult<Module> + Send + Sync + 'static,
    {
        let name = name.into();
        let key = (kind, name);
        if self.factories.contains_key(&key) {
            debug!(kind = %kind, name = %key.1, "Module already registered");
            return false;
        }
        info!(kind = %kind, name = %key.1, "Registered module");
        self.factories.insert(key, Arc::new(factory));
        true
    }

    pub fn has(&self, kind: ModuleKind, name: &str) -> bool {
        self.factories.contains_key(&(kind, name.to_string()))
    }

    /// Registered names of `kind`, sorted.
    pub fn list(&self, kind: ModuleKind) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .factories
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// Build the module `spec` selects.
    pub fn get(&self, spec: ModuleSpec<'_>, ctx: &BuildContext) -> TaskweaveResult<Module> {
        let kind = spec.kind();
        let name = spec.implementation_name();
        let factory = self
            .factories
            .get(&(kind, name.to_string()))
            .ok_or_else(|| {
                TaskweaveError::Registry(format!("no {kind} implementation named '{name}'"))
            })?;
        let module = factory(spec, ctx)?;
        if module.kind() != kind {
            return Err(TaskweaveError::Registry(format!(
                "factory '{name}' built a {} instead of a {kind}",
                module.kind()
            )));
        }
        Ok(module)
    }

    pub fn build_scheduler(
        &self,
        config: &SchedulerConfig,
        ctx: &BuildContext,
    ) -> TaskweaveResult<Arc<dyn Scheduler>> {
        match self.get(ModuleSpec::Scheduler(config), ctx)? {
            Module::Scheduler(scheduler) => Ok(scheduler),
            other => Err(mismatch(ModuleKind::Scheduler, other.kind())),
        }
    }

    pub fn build_router(
        &self,
        config: &RouterConfig,
        ctx: &BuildContext,
    ) -> TaskweaveResult<Arc<dyn Router>> {
        match self.get(ModuleSpec::Router(config), ctx)? {
            Module::Router(router) => Ok(router),
            other => Err(mismatch(ModuleKind::Router, other.kind())),
        }
    }

    pub fn build_judge(
        &self,
        config: &JudgeConfig,
        ctx: &BuildContext,
    ) -> TaskweaveResult<Arc<dyn Judge>> {
        match self.get(ModuleSpec::Judge(config), ctx)? {
            Module::Judge(judge) => Ok(judge),
            other => Err(mismatch(ModuleKind::Judge, other.kind())),
        }
    }
}

fn mismatch(expected: ModuleKind, got: ModuleKind) -> TaskweaveError {
    TaskweaveError::Registry(format!("expected a {expected} module, got a {got}"))
}

fn wrong_spec(name: &str, spec: ModuleSpec<'_>) -> TaskweaveError {
    TaskweaveError::Registry(format!(
        "factory '{name}' cannot build from a {} config '{}'",
        spec.kind(),
        spec.implementation_name()
    ))
}

fn require_evaluator(ctx: &BuildContext, name: &str) -> TaskweaveResult<Arc<dyn RubricEvaluator>> {
    ctx.evaluator.clone().ok_or_else(|| {
        TaskweaveError::Config(format!("the {name} judge requires a rubric evaluator"))
    })
}

fn register_builtins(registry: &mut ModuleRegistry) {
    registry.register(ModuleKind::Scheduler, "fifo", |spec, ctx| match spec {
        ModuleSpec::Scheduler(SchedulerConfig::Fifo) => Ok(Module::Scheduler(Arc::new(
            FifoScheduler::new(ctx.max_queue_size),
        ))),
        other => Err(wrong_spec("fifo", other)),
    });
    registry.register(ModuleKind::Scheduler, "priority", |spec, ctx| match spec {
        ModuleSpec::Scheduler(SchedulerConfig::Priority { weights }) => Ok(Module::Scheduler(
            Arc::new(PriorityScheduler::new(*weights, ctx.max_queue_size)),
        )),
        other => Err(wrong_spec("priority", other)),
    });
    registry.register(ModuleKind::Scheduler, "critical-path", |spec, ctx| match spec {
        ModuleSpec::Scheduler(SchedulerConfig::CriticalPath) => Ok(Module::Scheduler(Arc::new(
            CriticalPathScheduler::new(ctx.max_queue_size),
        ))),
        other => Err(wrong_spec("critical-path", other)),
    });

    registry.register(ModuleKind::Router, "static", |spec, _| match spec {
        ModuleSpec::Router(RouterConfig::Static { table }) => {
            Ok(Module::Router(Arc::new(StaticRouter::new(table.clone()))))
        }
        other => Err(wrong_spec("static", other)),
    });
    registry.register(ModuleKind::Router, "capability", |spec, _| match spec {
        ModuleSpec::Router(RouterConfig::Capability { threshold }) => {
            Ok(Module::Router(Arc::new(CapabilityRouter::new(*threshold))))
        }
        other => Err(wrong_spec("capability", other)),
    });
    registry.register(ModuleKind::Router, "round-robin", |spec, _| match spec {
        ModuleSpec::Router(RouterConfig::RoundRobin) => {
            Ok(Module::Router(Arc::new(RoundRobinRouter::new())))
        }
        other => Err(wrong_spec("round-robin", other)),
    });

    registry.register(ModuleKind::Judge, "deterministic", |spec, _| match spec {
        ModuleSpec::Judge(config) if config.strategy == JudgeStrategy::Deterministic => {
            Ok(Module::Judge(Arc::new(DeterministicJudge::new(
                config.threshold,
                config.retry_on_failure,
            ))))
        }
        other => Err(wrong_spec("deterministic", other)),
    });
    registry.register(ModuleKind::Judge, "llm-eval", |spec, ctx| match spec {
        ModuleSpec::Judge(config) => match &config.strategy {
            JudgeStrategy::LlmEval { rubric } => Ok(Module::Judge(Arc::new(LlmEvalJudge::new(
                rubric.clone(),
                require_evaluator(ctx, "llm-eval")?,
                config.threshold,
                config.retry_on_failure,
            )))),
            _ => Err(wrong_spec("llm-eval", spec)),
        },
        other => Err(wrong_spec("llm-eval", other)),
    });
    registry.register(ModuleKind::Judge, "hybrid", |spec, ctx| match spec {
        ModuleSpec::Judge(config) => match &config.strategy {
            JudgeStrategy::Hybrid { rubric } => Ok(Module::Judge(Arc::new(HybridJudge::new(
                rubric.clone(),
                require_evaluator(ctx, "hybrid")?,
                config.threshold,
                config.retry_on_failure,
            )))),
            _ => Err(wrong_spec("hybrid", spec)),
        },
        other => Err(wrong_spec("hybrid", other)),
    });
}
