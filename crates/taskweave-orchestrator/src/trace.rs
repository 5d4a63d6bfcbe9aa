use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Severity attached to a trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Transition a trace event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraceEventType {
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.halted")]
    RunHalted,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "task.queued")]
    TaskQueued,
    #[serde(rename = "task.assigned")]
    TaskAssigned,
    #[serde(rename = "task.retrying")]
    TaskRetrying,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "worker.acquired")]
    WorkerAcquired,
    #[serde(rename = "worker.completed")]
    WorkerCompleted,
    #[serde(rename = "worker.terminated")]
    WorkerTerminated,
    #[serde(rename = "judge.passed")]
    JudgePassed,
    #[serde(rename = "judge.failed")]
    JudgeFailed,
    #[serde(rename = "budget.warning")]
    BudgetWarning,
}

impl TraceEventType {
    /// Dotted wire name, e.g. `task.queued`.
    pub fn as_str(self) -> &'static str {
        match self {
            TraceEventType::RunStarted => "run.started",
            TraceEventType::RunHalted => "run.halted",
            TraceEventType::RunCompleted => "run.completed",
            TraceEventType::TaskQueued => "task.queued",
            TraceEventType::TaskAssigned => "task.assigned",
            TraceEventType::TaskRetrying => "task.retrying",
            TraceEventType::TaskCompleted => "task.completed",
            TraceEventType::TaskFailed => "task.failed",
            TraceEventType::WorkerAcquired => "worker.acquired",
            TraceEventType::WorkerCompleted => "worker.completed",
            TraceEventType::WorkerTerminated => "worker.terminated",
            TraceEventType::JudgePassed => "judge.passed",
            TraceEventType::JudgeFailed => "judge.failed",
            TraceEventType::BudgetWarning => "budget.warning",
        }
    }

    fn default_level(self) -> TraceLevel {
        match self {
            TraceEventType::TaskFailed => TraceLevel::Error,
            TraceEventType::RunHalted
            | TraceEventType::TaskRetrying
            | TraceEventType::JudgeFailed
            | TraceEventType::BudgetWarning => TraceLevel::Warn,
            TraceEventType::WorkerAcquired | TraceEventType::WorkerTerminated => TraceLevel::Debug,
            _ => TraceLevel::Info,
        }
    }
}

impl std::fmt::Display for TraceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured record of one orchestration transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    pub event_type: TraceEventType,
    pub task_id: Option<String>,
    pub worker_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub level: TraceLevel,
}

/// One-way consumer of trace events. Return values never steer the run.
pub trait TraceSink: Send + Sync {
    fn emit(&self, event: TraceEvent);
}

/// Discards everything.
pub struct NullTraceSink;

impl TraceSink for NullTraceSink {
    fn emit(&self, _event: TraceEvent) {}
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct MemoryTraceSink {
    events: Mutex<Vec<TraceEvent>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    pub fn of_type(&self, event_type: TraceEventType) -> Vec<TraceEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

impl TraceSink for MemoryTraceSink {
    fn emit(&self, event: TraceEvent) {
        self.events.lock().push(event);
    }
}

/// Forwards events to an unbounded channel for external subscribers.
pub struct ChannelTraceSink {
    tx: mpsc::UnboundedSender<TraceEvent>,
}

impl ChannelTraceSink {
    /// Create the sink and the receiving end a subscriber drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TraceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TraceSink for ChannelTraceSink {
    fn emit(&self, event: TraceEvent) {
        // A dropped subscriber is not an orchestration failure.
        let _ = self.tx.send(event);
    }
}

/// Run-scoped emitter that stamps events with the run id.
#[derive(Clone)]
pub(crate) struct Tracer {
    run_id: Uuid,
    sink: Arc<dyn TraceSink>,
}

impl Tracer {
    pub(crate) fn new(run_id: Uuid, sink: Arc<dyn TraceSink>) -> Self {
        Self { run_id, sink }
    }

    pub(crate) fn emit(
        &self,
        event_type: TraceEventType,
        task_id: Option<&str>,
        worker_id: Option<Uuid>,
        payload: serde_json::Value,
    ) {
        self.sink.emit(TraceEvent {
            timestamp: Utc::now(),
            run_id: self.run_id,
            event_type,
            task_id: task_id.map(str::to_string),
            worker_id,
            payload,
            level: event_type.default_level(),
        });
    }
}
