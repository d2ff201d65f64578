//! Retry/reschedule controller.
//!
//! Eligible failures (`FAILED`, `DROPPED`, `LOST`) enter here. Each task
//! carries (or inherits) a backoff policy; the controller schedules a
//! deferred callback that re-queues the task and asks the master for
//! fresh offers. Pending callbacks are indexed by task id so deleting a
//! task cancels its retry in O(1).

use dashmap::DashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{RetryPolicy, TaskRegistry, TaskSpec};
use crate::driver::SchedulerDriver;
use crate::protocol::{TaskId, TaskState};

/// Schedules and cancels per-task reschedule callbacks.
pub struct RetryController {
    registry: Arc<TaskRegistry>,
    driver: Arc<SchedulerDriver>,
    default_policy: RetryPolicy,
    policies: DashMap<TaskId, RetryPolicy>,
    pending: Arc<DashMap<TaskId, JoinHandle<()>>>,
}

impl RetryController {
    pub fn new(registry: Arc<TaskRegistry>, driver: Arc<SchedulerDriver>) -> Self {
        Self {
            registry,
            driver,
            default_policy: RetryPolicy::default(),
            policies: DashMap::new(),
            pending: Arc::new(DashMap::new()),
        }
    }

    pub fn with_default_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Handle an eligible failure for `spec`.
    ///
    /// Consumes one attempt from the task's policy. While budget remains,
    /// a callback fires after `base_interval * backoff_factor^attempt`,
    /// re-reads the task (a deleted task is a no-op), resets it to
    /// `UNKNOWN`, and issues a REVIVE. A spent budget fails the task for
    /// good and removes it.
    pub async fn reschedule(&self, spec: &TaskSpec) {
        let task_id = spec.task_id.clone();

        let (attempt, delay, exhausted) = {
            let mut policy = self.policies.entry(task_id.clone()).or_insert_with(|| {
                spec.retry_policy
                    .clone()
                    .unwrap_or_else(|| self.default_policy.clone())
            });
            let attempt = policy.retries;
            policy.retries += 1;
            (attempt, policy.delay_for_attempt(attempt), policy.exhausted())
        };

        if exhausted {
            warn!(
                name = %spec.name,
                task_id = %task_id,
                attempts = attempt,
                "Retry budget exhausted; failing task"
            );
            metrics::counter!("caravel_retries_exhausted_total").increment(1);
            self.cancel(&task_id);
            if let Err(e) = self.registry.set(TaskState::Failed, spec.clone()).await {
                error!(task_id = %task_id, error = %e, "Failed to record terminal failure");
            }
            if let Err(e) = self.registry.delete(spec).await {
                error!(task_id = %task_id, error = %e, "Failed to delete exhausted task");
            }
            return;
        }

        info!(
            name = %spec.name,
            task_id = %task_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reschedule"
        );
        metrics::counter!("caravel_reschedules_total").increment(1);

        let registry = self.registry.clone();
        let driver = self.driver.clone();
        let pending = self.pending.clone();
        let name = spec.name.clone();
        let callback_id = task_id.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pending.remove(&callback_id);

            // The task may have been deleted, or its name reused by a
            // newer admission, while the timer ran.
            let task = match registry.get_by_name(&name) {
                Ok(task) if task.task_id == callback_id => task,
                _ => {
                    debug!(task_id = %callback_id, "Task gone before retry fired");
                    return;
                }
            };

            if let Err(e) = registry.set(TaskState::Unknown, task).await {
                error!(task_id = %callback_id, error = %e, "Failed to re-queue task");
                return;
            }
            match driver.revive().await {
                Ok(true) => debug!(task_id = %callback_id, "Revive issued for re-queued task"),
                Ok(false) => debug!(task_id = %callback_id, "Revive throttled"),
                Err(e) => warn!(task_id = %callback_id, error = %e, "Revive failed"),
            }
        });

        if let Some(previous) = self.pending.insert(task_id, handle) {
            previous.abort();
        }
    }

    /// Drop the pending retry and policy bookkeeping for a task.
    pub fn cancel(&self, task_id: &TaskId) {
        if let Some((_, handle)) = self.pending.remove(task_id) {
            handle.abort();
        }
        self.policies.remove(task_id);
    }

    /// Number of callbacks waiting to fire.
    pub fn pending_retries(&self) -> usize {
        self.pending.len()
    }

    /// Attempts consumed by a task so far.
    pub fn attempts(&self, task_id: &TaskId) -> u32 {
        self.policies
            .get(task_id)
            .map(|policy| policy.retries)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MasterConfig, PersistenceConfig};
    use crate::storage::MemoryStorage;
    use crate::task::{ApplicationSpec, TaskStore};
    use std::time::Duration;

    fn controller() -> (Arc<TaskRegistry>, RetryController) {
        let storage = Arc::new(MemoryStorage::new());
        let store = TaskStore::new(storage, &PersistenceConfig::default());
        let registry = Arc::new(TaskRegistry::new(store));
        // Endpoint is never reached: revive without a framework id fails
        // locally and the callback tolerates that.
        let driver = Arc::new(
            SchedulerDriver::new(&MasterConfig::default(), Default::default()).unwrap(),
        );
        let retry = RetryController::new(registry.clone(), driver);
        (registry, retry)
    }

    fn spec(name: &str, base_ms: u64, max_retries: u32) -> TaskSpec {
        let mut task = ApplicationSpec {
            name: name.to_string(),
            cpus: 0.1,
            mem: 32.0,
            command: Some("true".to_string()),
            ..Default::default()
        }
        .admit("root")
        .unwrap();
        task.retry_policy = Some(RetryPolicy {
            max_retries,
            base_interval: Duration::from_millis(base_ms),
            backoff_factor: 2.0,
            retries: 0,
        });
        task
    }

    #[tokio::test]
    async fn callback_resets_task_to_unknown() {
        let (registry, retry) = controller();
        let task = spec("t1", 20, 3);
        registry.add(task.clone()).await.unwrap();
        registry.set(TaskState::Failed, task.clone()).await.unwrap();

        retry.reschedule(&task).await;
        assert_eq!(retry.pending_retries(), 1);
        assert_eq!(retry.attempts(&task.task_id), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(registry.state_of("t1"), Some(TaskState::Unknown));
        assert_eq!(retry.pending_retries(), 0);
    }

    #[tokio::test]
    async fn deleted_task_is_not_resurrected() {
        let (registry, retry) = controller();
        let task = spec("t1", 20, 3);
        registry.add(task.clone()).await.unwrap();

        retry.reschedule(&task).await;
        registry.delete(&task).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(registry.total_tasks(), 0);
    }

    #[tokio::test]
    async fn cancel_aborts_pending_callback() {
        let (registry, retry) = controller();
        let task = spec("t1", 50, 3);
        registry.add(task.clone()).await.unwrap();
        registry.set(TaskState::Failed, task.clone()).await.unwrap();

        retry.reschedule(&task).await;
        retry.cancel(&task.task_id);
        assert_eq!(retry.pending_retries(), 0);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(registry.state_of("t1"), Some(TaskState::Failed));
    }

    #[tokio::test]
    async fn exhausted_budget_fails_and_deletes_the_task() {
        let (registry, retry) = controller();
        let task = spec("t1", 5, 1);
        registry.add(task.clone()).await.unwrap();

        // max_retries = 1 allows one scheduled attempt; the second
        // eligible failure exhausts the budget.
        retry.reschedule(&task).await;
        retry.reschedule(&task).await;

        assert_eq!(registry.total_tasks(), 0);
        assert_eq!(retry.pending_retries(), 0);
    }

    #[tokio::test]
    async fn zero_retry_policy_fails_on_first_eligible_failure() {
        let (registry, retry) = controller();
        let task = spec("t1", 5, 0);
        registry.add(task.clone()).await.unwrap();

        // No budget at all: the very first eligible failure is terminal,
        // with no callback left behind.
        retry.reschedule(&task).await;

        assert_eq!(registry.total_tasks(), 0);
        assert_eq!(retry.pending_retries(), 0);
    }

    #[tokio::test]
    async fn backoff_delays_attempts_monotonically() {
        let (registry, retry) = controller();
        let task = spec("t1", 40, 5);
        registry.add(task.clone()).await.unwrap();
        registry.set(TaskState::Failed, task.clone()).await.unwrap();

        retry.reschedule(&task).await;

        // Before base_interval the task must still be FAILED.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.state_of("t1"), Some(TaskState::Failed));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(registry.state_of("t1"), Some(TaskState::Unknown));
    }
}
