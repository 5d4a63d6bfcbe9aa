use crate::types::{WorkOutcome, WorkerInstance, WorkerMetrics, WorkerProfile, WorkerStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

/// Occupancy snapshot of a [`WorkerPool`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub total: usize,
    pub max: usize,
}

/// Outcome of [`WorkerPool::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Kept for reuse by the next task of the same profile.
    Idle,
    /// Destroyed and removed from the pool.
    Terminated,
}

struct Slot {
    instance: WorkerInstance,
    episodic: bool,
    last_released_at: Option<DateTime<Utc>>,
}

/// Bounded set of worker instances.
///
/// The pool never holds more than `max_concurrent` instances, so the number of
/// working instances can never exceed it either. All check-and-mutate
/// operations run under a single lock.
pub struct WorkerPool {
    max_concurrent: usize,
    slots: Mutex<HashMap<Uuid, Slot>>,
}

impl WorkerPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Bind a worker of `profile` to `task_id`.
    ///
    /// Reuses an idle instance of the same profile when one exists, otherwise
    /// spawns a new one if there is room. A full pool evicts its least recently
    /// used idle instance of another profile. Returns `None` when every slot is
    /// busy; callers treat that as backpressure.
    pub fn acquire(&self, profile: &WorkerProfile, task_id: &str) -> Option<WorkerInstance> {
        let mut slots = self.slots.lock();
        let now = Utc::now();

        let reusable = slots
            .iter()
            .filter(|(_, s)| {
                s.instance.status == WorkerStatus::Idle && s.instance.profile_id == profile.id
            })
            .min_by_key(|(_, s)| s.last_released_at)
            .map(|(id, _)| *id);

        if let Some(id) = reusable {
            let slot = slots.get_mut(&id)?;
            slot.instance.status = WorkerStatus::Working;
            slot.instance.current_task_id = Some(task_id.to_string());
            slot.instance.started_at = Some(now);
            debug!(worker_id = %id, profile = %profile.id, task_id, "Reusing idle worker");
            return Some(slot.instance.clone());
        }

        if slots.len() >= self.max_concurrent {
            let victim = slots
                .iter()
                .filter(|(_, s)| s.instance.status == WorkerStatus::Idle)
                .min_by_key(|(_, s)| s.last_released_at)
                .map(|(id, _)| *id)?;
            slots.remove(&victim);
            info!(worker_id = %victim, "Evicted idle worker to make room");
        }

        let instance = WorkerInstance {
            id: Uuid::new_v4(),
            profile_id: profile.id.clone(),
            status: WorkerStatus::Working,
            current_task_id: Some(task_id.to_string()),
            started_at: Some(now),
            metrics: WorkerMetrics::default(),
        };
        info!(
            worker_id = %instance.id,
            profile = %profile.id,
            task_id,
            episodic = profile.operational.episodic_reset,
            "Spawned worker"
        );
        slots.insert(
            instance.id,
            Slot {
                instance: instance.clone(),
                episodic: profile.operational.episodic_reset,
                last_released_at: None,
            },
        );
        Some(instance)
    }

    /// Record the outcome of the current task and unbind it from the worker.
    pub fn finish(&self, worker_id: Uuid, outcome: &WorkOutcome) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(&worker_id) {
            Some(slot) if slot.instance.status == WorkerStatus::Working => {
                slot.instance.metrics.record(outcome);
                slot.instance.status = if outcome.success {
                    WorkerStatus::Completed
                } else {
                    WorkerStatus::Failed
                };
                slot.instance.current_task_id = None;
                true
            }
            _ => false,
        }
    }

    /// Return a worker to the pool.
    ///
    /// Episodic workers and explicit `terminate` requests destroy the instance;
    /// persistent workers go back to idle.
    pub fn release(&self, worker_id: Uuid, terminate: bool) -> Option<ReleaseOutcome> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&worker_id)?;
        if terminate || slot.episodic {
            slots.remove(&worker_id);
            debug!(worker_id = %worker_id, "Worker terminated");
            return Some(ReleaseOutcome::Terminated);
        }
        slot.instance.status = WorkerStatus::Idle;
        slot.instance.current_task_id = None;
        slot.last_released_at = Some(Utc::now());
        Some(ReleaseOutcome::Idle)
    }

    /// Terminate every instance and hand back their final state.
    pub fn shutdown(&self) -> Vec<WorkerInstance> {
        let mut slots = self.slots.lock();
        slots
            .drain()
            .map(|(_, slot)| {
                let mut instance = slot.instance;
                instance.status = WorkerStatus::Terminated;
                instance.current_task_id = None;
                instance
            })
            .collect()
    }

    pub fn get(&self, worker_id: Uuid) -> Option<WorkerInstance> {
        self.slots.lock().get(&worker_id).map(|s| s.instance.clone())
    }

    pub fn instances(&self) -> Vec<WorkerInstance> {
        self.slots
            .lock()
            .values()
            .map(|s| s.instance.clone())
            .collect()
    }

    /// Slots not held by a working instance.
    pub fn available(&self) -> usize {
        self.max_concurrent.saturating_sub(self.stats().active)
    }

    pub fn stats(&self) -> PoolStats {
        let slots = self.slots.lock();
        let active = slots
            .values()
            .filter(|s| s.instance.status == WorkerStatus::Working)
            .count();
        let idle = slots
            .values()
            .filter(|s| s.instance.status == WorkerStatus::Idle)
            .count();
        PoolStats {
            active,
            idle,
            total: slots.len(),
            max: self.max_concurrent,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn outcome(success: bool) -> WorkOutcome {
        WorkOutcome {
            success,
            runtime_ms: 5,
            tokens_used: 100,
            quality_score: Some(0.9),
        }
    }

    #[test]
    fn test_acquire_binds_task() {
        let pool = WorkerPool::new(2);
        let profile = WorkerProfile::new("coder", "Coder");
        let worker = pool.acquire(&profile, "t1").unwrap();
        assert_eq!(worker.status, WorkerStatus::Working);
        assert_eq!(worker.current_task_id.as_deref(), Some("t1"));
        assert_eq!(
            pool.stats(),
            PoolStats {
                active: 1,
                idle: 0,
                total: 1,
                max: 2
            }
        );
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_backpressure_when_full() {
        let pool = WorkerPool::new(2);
        let profile = WorkerProfile::new("coder", "Coder");
        assert!(pool.acquire(&profile, "t1").is_some());
        assert!(pool.acquire(&profile, "t2").is_some());
        assert!(pool.acquire(&profile, "t3").is_none());
        assert_eq!(pool.stats().active, 2);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_persistent_worker_is_reused() {
        let pool = WorkerPool::new(2);
        let profile = WorkerProfile::new("coder", "Coder");
        let first = pool.acquire(&profile, "t1").unwrap();
        assert!(pool.finish(first.id, &outcome(true)));
        assert_eq!(pool.release(first.id, false), Some(ReleaseOutcome::Idle));

        let idle = pool.get(first.id).unwrap();
        assert_eq!(idle.status, WorkerStatus::Idle);
        assert!(idle.current_task_id.is_none());

        let second = pool.acquire(&profile, "t2").unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.metrics.tasks_completed, 1);
        assert_eq!(pool.stats().total, 1);
    }

    #[test]
    fn test_episodic_worker_is_destroyed() {
        let pool = WorkerPool::new(2);
        let profile = WorkerProfile::new("tester", "Tester").episodic(true);
        let first = pool.acquire(&profile, "t1").unwrap();
        pool.finish(first.id, &outcome(true));
        assert_eq!(pool.release(first.id, false), Some(ReleaseOutcome::Terminated));
        assert!(pool.get(first.id).is_none());

        let second = pool.acquire(&profile, "t2").unwrap();
        assert_ne!(second.id, first.id);
    }

    #[test]
    fn test_explicit_terminate_overrides_persistence() {
        let pool = WorkerPool::new(1);
        let profile = WorkerProfile::new("coder", "Coder");
        let worker = pool.acquire(&profile, "t1").unwrap();
        pool.finish(worker.id, &outcome(false));
        assert_eq!(pool.release(worker.id, true), Some(ReleaseOutcome::Terminated));
        assert_eq!(pool.stats().total, 0);
        // Terminated never comes back.
        assert_eq!(pool.release(worker.id, false), None);
    }

    #[test]
    fn test_full_pool_evicts_idle_worker_of_other_profile() {
        let pool = WorkerPool::new(1);
        let coder = WorkerProfile::new("coder", "Coder");
        let reviewer = WorkerProfile::new("reviewer", "Reviewer");

        let worker = pool.acquire(&coder, "t1").unwrap();
        pool.finish(worker.id, &outcome(true));
        pool.release(worker.id, false);

        let other = pool.acquire(&reviewer, "t2").unwrap();
        assert_eq!(other.profile_id, "reviewer");
        assert!(pool.get(worker.id).is_none());
        assert_eq!(pool.stats().total, 1);
    }

    #[test]
    fn test_finish_requires_working_worker() {
        let pool = WorkerPool::new(1);
        let profile = WorkerProfile::new("coder", "Coder");
        let worker = pool.acquire(&profile, "t1").unwrap();
        assert!(pool.finish(worker.id, &outcome(true)));
        assert!(!pool.finish(worker.id, &outcome(true)));
        assert!(!pool.finish(Uuid::new_v4(), &outcome(true)));
        assert_eq!(pool.get(worker.id).unwrap().status, WorkerStatus::Completed);
    }

    #[test]
    fn test_shutdown_terminates_everything() {
        let pool = WorkerPool::new(3);
        let profile = WorkerProfile::new("coder", "Coder");
        pool.acquire(&profile, "t1").unwrap();
        pool.acquire(&profile, "t2").unwrap();
        let terminated = pool.shutdown();
        assert_eq!(terminated.len(), 2);
        assert!(terminated
            .iter()
            .all(|w| w.status == WorkerStatus::Terminated && w.current_task_id.is_none()));
        assert_eq!(pool.stats().total, 0);
        assert!(pool.instances().is_empty());
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_ceiling() {
        use std::sync::Arc;

        let pool = Arc::new(WorkerPool::new(3));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    let profile = WorkerProfile::new("coder", "Coder");
                    pool.acquire(&profile, &format!("t{i}")).is_some()
                })
            })
            .collect();
        let acquired = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(acquired, 3);
        assert_eq!(pool.stats().active, 3);
    }
}
