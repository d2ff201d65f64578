//! Offers turn: reconcile, match, accept, decline, suppress.

use tracing::{debug, info, warn};

use super::EventLoop;
use crate::matcher;
use crate::protocol::{Offer, Operation, ReconcileTask, TaskState};

impl EventLoop {
    /// One OFFERS turn. The offers are owned by this handler and never
    /// escape it: each is either consumed by an ACCEPT or released in the
    /// closing DECLINE batch.
    pub(super) async fn handle_offers(&self, mut offers: Vec<Offer>) {
        metrics::counter!("caravel_offers_total").increment(offers.len() as u64);

        // RECONCILE precedes any LAUNCH within the turn.
        if let Ok(running) = self.registry.get_state(TaskState::Running) {
            let tasks: Vec<ReconcileTask> = running
                .iter()
                .map(|task| ReconcileTask {
                    task_id: task.task_id.clone(),
                    agent_id: task.agent_id.clone(),
                })
                .collect();
            if let Err(e) = self.driver.reconcile(tasks).await {
                warn!(error = %e, "Reconcile at offers turn failed");
            }
        }

        // Offers rescinded while this event sat in the queue are gone.
        offers.retain(|offer| self.rescinded.remove(&offer.id).is_none());
        if offers.is_empty() {
            return;
        }

        let queued = self
            .registry
            .get_state(TaskState::Unknown)
            .unwrap_or_default();
        if queued.is_empty() {
            // Nothing to launch: release the whole batch and quiet the
            // offer stream.
            let ids = offers.into_iter().map(|offer| offer.id).collect();
            if let Err(e) = self.driver.decline(ids).await {
                warn!(error = %e, "Decline failed");
            }
            if let Err(e) = self.driver.suppress().await {
                warn!(error = %e, "Suppress failed");
            }
            return;
        }

        let outcome = matcher::first_fit(&offers, &queued);

        for binding in outcome.launches {
            let task_infos = binding.tasks.iter().map(|task| task.task_info()).collect();
            let operation = Operation::Launch { task_infos };
            match self
                .driver
                .accept(vec![binding.offer_id.clone()], vec![operation])
                .await
            {
                Ok(()) => {
                    for task in binding.tasks {
                        info!(
                            name = %task.name,
                            task_id = %task.task_id,
                            agent_id = task.agent_id.as_deref().unwrap_or(""),
                            "Task launched"
                        );
                        metrics::counter!("caravel_launches_total").increment(1);
                        if let Err(e) = self.registry.set(TaskState::Staging, task).await {
                            warn!(error = %e, "Failed to stage launched task");
                        }
                    }
                }
                Err(e) => {
                    // The launch never reached the master; the tasks stay
                    // queued for the next turn.
                    warn!(offer_id = %binding.offer_id, error = %e, "Accept failed");
                }
            }
        }

        if !outcome.unused_offers.is_empty() {
            debug!(count = outcome.unused_offers.len(), "Declining unused offers");
            if let Err(e) = self.driver.decline(outcome.unused_offers).await {
                warn!(error = %e, "Decline failed");
            }
        }
    }
}
