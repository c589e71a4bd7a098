//! Per-task privileged-call budgets.
//!
//! Task ids come from the worker, so each task budget is namespaced by the
//! worker that sent it and every worker also carries a cap across all of its
//! tasks. A worker cannot reset its allowance by inventing task ids, and
//! naming another worker's task id charges a different counter.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use sentra_common_storage::{TaskId, WorkerId};

use crate::error::{CredentialError, Result};

/// Default privileged calls allowed per task.
pub const DEFAULT_TASK_BUDGET: u32 = 100;

/// Task counters untouched for this long are dropped by
/// [`TaskBudgets::evict_idle`] unless exhausted.
pub const DEFAULT_TASK_IDLE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug)]
struct Usage {
    used: u32,
    exhausted: bool,
    last_charged: Instant,
}

impl Usage {
    fn new() -> Self {
        Self { used: 0, exhausted: false, last_charged: Instant::now() }
    }
}

/// Counts privileged calls per `(worker, task)` and per worker.
///
/// Once a task or worker goes over its limit it stays exhausted for the
/// lifetime of the broker; later requests are refused without being counted.
#[derive(Debug)]
pub struct TaskBudgets {
    task_limit: u32,
    worker_limit: u32,
    workers: DashMap<WorkerId, Usage>,
    tasks: DashMap<(WorkerId, TaskId), Usage>,
}

impl TaskBudgets {
    /// Creates an empty budget table. The worker cap defaults to the task
    /// limit.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::InvalidConfig`] if `limit` is zero.
    pub fn new(limit: u32) -> Result<Self> {
        if limit == 0 {
            return Err(CredentialError::invalid_config("task_budget must be at least 1"));
        }
        Ok(Self { task_limit: limit, worker_limit: limit, workers: DashMap::new(), tasks: DashMap::new() })
    }

    /// Sets the cap on calls one worker may make across all of its tasks.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::InvalidConfig`] if `limit` is zero.
    pub fn with_worker_limit(mut self, limit: u32) -> Result<Self> {
        if limit == 0 {
            return Err(CredentialError::invalid_config("worker_budget must be at least 1"));
        }
        self.worker_limit = limit;
        Ok(self)
    }

    /// The per-task limit.
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.task_limit
    }

    /// The per-worker limit.
    #[must_use]
    pub fn worker_limit(&self) -> u32 {
        self.worker_limit
    }

    /// Charges one call to `task` of `worker` and returns the calls
    /// remaining under the tighter of the two budgets.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::BudgetExceeded`] if the task or the worker
    /// is exhausted.
    pub fn charge(&self, worker: &WorkerId, task: &TaskId) -> Result<u32> {
        // Worker entry is always locked before the task entry
        let mut worker_usage = self.workers.entry(worker.clone()).or_insert_with(Usage::new);
        if worker_usage.exhausted {
            return Err(CredentialError::budget_exceeded(format!("worker {worker}"), self.worker_limit));
        }
        if worker_usage.used >= self.worker_limit {
            worker_usage.exhausted = true;
            tracing::warn!(worker_id = %worker, limit = self.worker_limit, "worker budget exhausted");
            return Err(CredentialError::budget_exceeded(format!("worker {worker}"), self.worker_limit));
        }

        let mut task_usage =
            self.tasks.entry((worker.clone(), task.clone())).or_insert_with(Usage::new);
        if task_usage.exhausted {
            return Err(task_exceeded(worker, task, self.task_limit));
        }
        if task_usage.used >= self.task_limit {
            task_usage.exhausted = true;
            tracing::warn!(worker_id = %worker, task_id = %task, limit = self.task_limit, "task budget exhausted");
            return Err(task_exceeded(worker, task, self.task_limit));
        }

        let now = Instant::now();
        worker_usage.used += 1;
        worker_usage.last_charged = now;
        task_usage.used += 1;
        task_usage.last_charged = now;
        Ok((self.task_limit - task_usage.used).min(self.worker_limit - worker_usage.used))
    }

    /// Calls charged to `task` of `worker` so far.
    #[must_use]
    pub fn used(&self, worker: &WorkerId, task: &TaskId) -> u32 {
        self.tasks.get(&(worker.clone(), task.clone())).map_or(0, |u| u.used)
    }

    /// Returns `true` once `task` of `worker` has gone over its limit.
    #[must_use]
    pub fn is_exhausted(&self, worker: &WorkerId, task: &TaskId) -> bool {
        self.tasks.get(&(worker.clone(), task.clone())).is_some_and(|u| u.exhausted)
    }

    /// Calls charged to `worker` across all of its tasks.
    #[must_use]
    pub fn worker_used(&self, worker: &WorkerId) -> u32 {
        self.workers.get(worker).map_or(0, |u| u.used)
    }

    /// Returns `true` once `worker` has gone over its cap.
    #[must_use]
    pub fn is_worker_exhausted(&self, worker: &WorkerId) -> bool {
        self.workers.get(worker).is_some_and(|u| u.exhausted)
    }

    /// Number of task counters held.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Drops task counters not charged within `idle` that are not exhausted.
    /// Worker counters are kept.
    ///
    /// Returns the number of counters removed.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, u| u.exhausted || u.last_charged.elapsed() < idle);
        before.saturating_sub(self.tasks.len())
    }
}

impl Default for TaskBudgets {
    fn default() -> Self {
        Self {
            task_limit: DEFAULT_TASK_BUDGET,
            worker_limit: DEFAULT_TASK_BUDGET,
            workers: DashMap::new(),
            tasks: DashMap::new(),
        }
    }
}

fn task_exceeded(worker: &WorkerId, task: &TaskId, limit: u32) -> CredentialError {
    CredentialError::budget_exceeded(format!("task {worker}/{task}"), limit)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn w(id: &str) -> WorkerId {
        WorkerId::from(id)
    }

    fn t(id: &str) -> TaskId {
        TaskId::from(id)
    }

    #[test]
    fn test_zero_limit_rejected() {
        assert!(matches!(TaskBudgets::new(0), Err(CredentialError::InvalidConfig(_))));
        assert!(matches!(
            TaskBudgets::new(1).unwrap().with_worker_limit(0),
            Err(CredentialError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_charge_counts_down() {
        let budgets = TaskBudgets::new(3).unwrap().with_worker_limit(10).unwrap();
        assert_eq!(budgets.charge(&w("w1"), &t("t1")).unwrap(), 2);
        assert_eq!(budgets.charge(&w("w1"), &t("t1")).unwrap(), 1);
        assert_eq!(budgets.charge(&w("w1"), &t("t1")).unwrap(), 0);
        assert_eq!(budgets.used(&w("w1"), &t("t1")), 3);
        assert_eq!(budgets.worker_used(&w("w1")), 3);
        assert!(!budgets.is_exhausted(&w("w1"), &t("t1")));
    }

    #[test]
    fn test_exhaustion_is_sticky() {
        let budgets = TaskBudgets::new(1).unwrap().with_worker_limit(10).unwrap();
        budgets.charge(&w("w1"), &t("t1")).unwrap();

        for _ in 0..3 {
            match budgets.charge(&w("w1"), &t("t1")) {
                Err(CredentialError::BudgetExceeded { scope, limit }) => {
                    assert_eq!(scope, "task w1/t1");
                    assert_eq!(limit, 1);
                },
                other => panic!("expected BudgetExceeded, got {other:?}"),
            }
        }
        assert!(budgets.is_exhausted(&w("w1"), &t("t1")));
        assert_eq!(budgets.used(&w("w1"), &t("t1")), 1);
        assert_eq!(budgets.worker_used(&w("w1")), 1);
    }

    #[test]
    fn test_fresh_task_ids_do_not_reset_worker_cap() {
        let budgets = TaskBudgets::new(2).unwrap();
        let ok = (0..10)
            .filter(|i| budgets.charge(&w("w1"), &t(&format!("t{i}"))).is_ok())
            .count();
        assert_eq!(ok, 2);
        assert!(budgets.is_worker_exhausted(&w("w1")));
        // Refused calls do not create task counters
        assert_eq!(budgets.task_count(), 2);
    }

    #[test]
    fn test_task_ids_are_namespaced_by_worker() {
        let budgets = TaskBudgets::new(1).unwrap();
        budgets.charge(&w("w1"), &t("shared")).unwrap();
        assert!(budgets.charge(&w("w1"), &t("shared")).is_err());
        assert_eq!(budgets.charge(&w("w2"), &t("shared")).unwrap(), 0);
        assert_eq!(budgets.used(&w("w2"), &t("shared")), 1);
    }

    #[test]
    fn test_worker_cap_spans_tasks() {
        let budgets = TaskBudgets::new(2).unwrap().with_worker_limit(3).unwrap();
        budgets.charge(&w("w1"), &t("a")).unwrap();
        budgets.charge(&w("w1"), &t("a")).unwrap();
        assert_eq!(budgets.charge(&w("w1"), &t("b")).unwrap(), 0);
        match budgets.charge(&w("w1"), &t("c")) {
            Err(CredentialError::BudgetExceeded { scope, limit }) => {
                assert_eq!(scope, "worker w1");
                assert_eq!(limit, 3);
            },
            other => panic!("expected BudgetExceeded, got {other:?}"),
        }
    }

    #[test]
    fn test_evict_idle_keeps_exhausted_tasks() {
        let budgets = TaskBudgets::new(1).unwrap().with_worker_limit(10).unwrap();
        budgets.charge(&w("w1"), &t("spent")).unwrap();
        let _ = budgets.charge(&w("w1"), &t("spent"));
        budgets.charge(&w("w1"), &t("idle")).unwrap();

        assert_eq!(budgets.evict_idle(Duration::ZERO), 1);
        assert_eq!(budgets.task_count(), 1);
        assert!(budgets.is_exhausted(&w("w1"), &t("spent")));
        assert_eq!(budgets.worker_used(&w("w1")), 2);
        assert_eq!(budgets.evict_idle(DEFAULT_TASK_IDLE_TTL), 0);
    }

    proptest! {
        #[test]
        fn prop_never_more_than_limit_successes(limit in 1u32..50, calls in 0usize..120) {
            let budgets = TaskBudgets::new(limit).unwrap();
            let ok = (0..calls).filter(|_| budgets.charge(&w("p"), &t("p")).is_ok()).count();
            prop_assert_eq!(ok, calls.min(limit as usize));
        }

        #[test]
        fn prop_worker_cap_bounds_any_task_mix(limit in 1u32..20, tasks in proptest::collection::vec(0u8..8, 0..60)) {
            let budgets = TaskBudgets::new(limit).unwrap();
            let ok = tasks
                .iter()
                .filter(|task| budgets.charge(&w("p"), &t(&task.to_string())).is_ok())
                .count();
            prop_assert!(ok <= limit as usize);
        }
    }
}
