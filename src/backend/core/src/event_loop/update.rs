//! Update turn: state write-through, acknowledgement, retry dispatch.

use tracing::{debug, error, info, warn};

use super::EventLoop;
use crate::protocol::{TaskState, TaskStatus};

impl EventLoop {
    /// Handle one status update.
    ///
    /// Every update is acknowledged exactly once, including updates for
    /// tasks this replica does not know; the master expects the ack
    /// regardless. For known tasks the new state is written through
    /// before the ack goes out, and eligible failures are handed to the
    /// retry controller afterwards.
    pub(super) async fn handle_update(&self, status: TaskStatus) {
        let task = match self.registry.get_by_id(&status.task_id) {
            Ok(task) => task,
            Err(_) => {
                debug!(task_id = %status.task_id, "Update for unknown task; acknowledging");
                self.acknowledge(&status).await;
                return;
            }
        };

        let state = status.state;
        let detail = status.message.as_deref().unwrap_or("");
        if let Err(e) = self.registry.set(state, task.clone()).await {
            error!(task_id = %status.task_id, error = %e, "Failed to record state transition");
        }

        self.acknowledge(&status).await;

        match state {
            TaskState::Failed => {
                error!(task_id = %status.task_id, detail, "Task failed");
                self.retry.reschedule(&task).await;
            }
            TaskState::Dropped => {
                info!(task_id = %status.task_id, detail, "Task dropped before launch");
                self.retry.reschedule(&task).await;
            }
            TaskState::Lost => {
                warn!(task_id = %status.task_id, "Task lost");
                self.retry.reschedule(&task).await;
            }
            TaskState::Finished => {
                info!(task_id = %status.task_id, detail, "Task finished");
                self.retry.cancel(&task.task_id);
            }
            TaskState::Killed => {
                info!(task_id = %status.task_id, "Task killed");
                self.retry.cancel(&task.task_id);
            }
            TaskState::Error => {
                error!(task_id = %status.task_id, detail, "Task error");
            }
            TaskState::Running => {
                info!(
                    task_id = %status.task_id,
                    agent_id = status.agent_id.as_deref().unwrap_or(""),
                    "Task running"
                );
            }
            TaskState::Gone => {
                error!(task_id = %status.task_id, detail, "Task gone");
            }
            TaskState::Staging
            | TaskState::Starting
            | TaskState::Killing
            | TaskState::Unknown
            | TaskState::Unreachable => {
                info!(task_id = %status.task_id, state = %state, detail, "Transient task state");
            }
        }
    }

    /// Confirm the update. Ack failures are logged and dropped; the
    /// master will re-deliver the update and we will ack it then.
    async fn acknowledge(&self, status: &TaskStatus) {
        metrics::counter!("caravel_acks_total").increment(1);
        if let Err(e) = self
            .driver
            .acknowledge(
                status.agent_id.clone(),
                status.task_id.clone(),
                status.uuid.clone(),
            )
            .await
        {
            warn!(task_id = %status.task_id, error = %e, "Acknowledge failed");
        }
    }
}
