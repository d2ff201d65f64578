//! First-fit resource matcher.
//!
//! Given the offers of one event turn and the queued tasks, produce the
//! launch bindings for the ACCEPT calls and the leftover offers for the
//! batched DECLINE. Matching is first-fit over flattened scalar
//! resources: offers are consumed in input order, tasks in catalog
//! iteration order, and an offer stops accepting tasks at the first one
//! it cannot hold.

use std::collections::HashMap;

use crate::protocol::{Offer, OfferId, Resource};
use crate::task::TaskSpec;

/// One offer with the tasks bound to it this turn.
#[derive(Debug)]
pub struct LaunchBinding {
    pub offer_id: OfferId,
    pub tasks: Vec<TaskSpec>,
}

/// The outcome of one matching turn.
#[derive(Debug, Default)]
pub struct MatchOutcome {
    /// Offer → tasks bindings, one LAUNCH operation each.
    pub launches: Vec<LaunchBinding>,
    /// Offers nothing fit into; declined as a single batch.
    pub unused_offers: Vec<OfferId>,
}

/// Scalar resource multiset, flattened across roles.
#[derive(Debug, Default)]
struct Budget {
    scalars: HashMap<String, f64>,
}

impl Budget {
    fn from_resources(resources: &[Resource]) -> Self {
        let mut scalars: HashMap<String, f64> = HashMap::new();
        for resource in resources {
            *scalars.entry(resource.name.clone()).or_default() += resource.value;
        }
        Self { scalars }
    }

    fn contains(&self, demand: &[Resource]) -> bool {
        // Tolerance absorbs float drift from repeated subtraction.
        const EPSILON: f64 = 1e-9;
        demand.iter().all(|resource| {
            self.scalars
                .get(&resource.name)
                .is_some_and(|have| *have + EPSILON >= resource.value)
        })
    }

    fn subtract(&mut self, demand: &[Resource]) {
        for resource in demand {
            if let Some(have) = self.scalars.get_mut(&resource.name) {
                *have -= resource.value;
            }
        }
    }
}

/// Bind queued tasks to offers, first-fit.
pub fn first_fit(offers: &[Offer], queued: &[TaskSpec]) -> MatchOutcome {
    let mut outcome = MatchOutcome::default();
    let mut remaining: Vec<&TaskSpec> = queued.iter().collect();

    for offer in offers {
        if remaining.is_empty() {
            outcome.unused_offers.push(offer.id.clone());
            continue;
        }

        let mut budget = Budget::from_resources(&offer.resources);
        let mut bound = Vec::new();
        while let Some(task) = remaining.first() {
            if !budget.contains(&task.resources) {
                // This offer is spent for the walk; the task and everything
                // after it wait for the next offer in the same turn.
                break;
            }
            budget.subtract(&task.resources);
            let mut task = remaining.remove(0).clone();
            task.agent_id = Some(offer.agent_id.clone());
            bound.push(task);
        }

        if bound.is_empty() {
            outcome.unused_offers.push(offer.id.clone());
        } else {
            outcome.launches.push(LaunchBinding {
                offer_id: offer.id.clone(),
                tasks: bound,
            });
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ApplicationSpec;

    fn offer(id: &str, agent: &str, cpus: f64, mem: f64) -> Offer {
        Offer {
            id: id.to_string(),
            agent_id: agent.to_string(),
            hostname: None,
            resources: vec![Resource::cpus(cpus), Resource::mem(mem)],
        }
    }

    fn task(name: &str, cpus: f64, mem: f64) -> TaskSpec {
        ApplicationSpec {
            name: name.to_string(),
            cpus,
            mem,
            command: Some("true".to_string()),
            ..Default::default()
        }
        .admit("root")
        .unwrap()
    }

    #[test]
    fn binds_task_and_fills_agent_id() {
        let offers = [offer("o1", "a1", 1.0, 256.0)];
        let queued = [task("t1", 0.5, 128.0)];

        let outcome = first_fit(&offers, &queued);

        assert_eq!(outcome.launches.len(), 1);
        assert_eq!(outcome.launches[0].offer_id, "o1");
        assert_eq!(
            outcome.launches[0].tasks[0].agent_id.as_deref(),
            Some("a1")
        );
        assert!(outcome.unused_offers.is_empty());
    }

    #[test]
    fn insufficient_offer_is_returned_for_decline() {
        let offers = [offer("o1", "a1", 1.0, 512.0)];
        let queued = [task("t1", 2.0, 1024.0)];

        let outcome = first_fit(&offers, &queued);

        assert!(outcome.launches.is_empty());
        assert_eq!(outcome.unused_offers, vec!["o1".to_string()]);
    }

    #[test]
    fn packs_multiple_tasks_into_one_offer() {
        let offers = [offer("o1", "a1", 2.0, 512.0)];
        let queued = [task("t1", 1.0, 128.0), task("t2", 1.0, 128.0)];

        let outcome = first_fit(&offers, &queued);

        assert_eq!(outcome.launches.len(), 1);
        assert_eq!(outcome.launches[0].tasks.len(), 2);
    }

    #[test]
    fn never_binds_beyond_remaining_budget() {
        let offers = [offer("o1", "a1", 1.5, 512.0)];
        let queued = [task("t1", 1.0, 256.0), task("t2", 1.0, 128.0)];

        let outcome = first_fit(&offers, &queued);

        // Only t1 fits; the cpu budget has 0.5 left for t2's 1.0.
        assert_eq!(outcome.launches[0].tasks.len(), 1);
        assert_eq!(outcome.launches[0].tasks[0].name, "t1");
    }

    #[test]
    fn later_offers_pick_up_unbound_tasks() {
        let offers = [offer("o1", "a1", 1.0, 256.0), offer("o2", "a2", 4.0, 2048.0)];
        let queued = [task("big", 2.0, 1024.0), task("small", 0.5, 64.0)];

        let outcome = first_fit(&offers, &queued);

        // o1 stops at "big"; o2 takes both, in order.
        assert_eq!(outcome.unused_offers, vec!["o1".to_string()]);
        assert_eq!(outcome.launches.len(), 1);
        assert_eq!(outcome.launches[0].offer_id, "o2");
        let names: Vec<_> = outcome.launches[0]
            .tasks
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(names, vec!["big", "small"]);
    }

    #[test]
    fn extra_offers_are_declined() {
        let offers = [offer("o1", "a1", 1.0, 256.0), offer("o2", "a2", 1.0, 256.0)];
        let queued = [task("t1", 0.5, 128.0)];

        let outcome = first_fit(&offers, &queued);

        assert_eq!(outcome.launches.len(), 1);
        assert_eq!(outcome.unused_offers, vec!["o2".to_string()]);
    }

    #[test]
    fn flattens_roles_when_budgeting() {
        let offers = [Offer {
            id: "o1".to_string(),
            agent_id: "a1".to_string(),
            hostname: None,
            resources: vec![
                Resource::cpus(0.5).with_role("prod"),
                Resource::cpus(0.5),
                Resource::mem(256.0),
            ],
        }];
        let queued = [task("t1", 1.0, 128.0)];

        let outcome = first_fit(&offers, &queued);
        assert_eq!(outcome.launches.len(), 1);
    }
}
