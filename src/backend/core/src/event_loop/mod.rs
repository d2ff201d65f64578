//! Event loop: single consumer of the master's event stream.
//!
//! The loop owns the subscription lifecycle
//! (`NEW → SUBSCRIBING → SUBSCRIBED → RUNNING → DISCONNECTED → SUBSCRIBING`,
//! with a fixed backoff between attempts) and dispatches each inbound
//! event to its handler. Handlers run on the loop task itself; per-name
//! serialization inside the registry keeps concurrent mutators (admin
//! API, retry callbacks) off the same task.

mod offers;
mod update;

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::MasterConfig;
use crate::driver::SchedulerDriver;
use crate::error::Result;
use crate::protocol::{Event, OfferId, ReconcileTask, TaskState};
use crate::task::{RetryController, TaskRegistry};

/// Bounded depth of the inbound event queue; the subscription reader
/// backpressures against a slow consumer rather than buffering the
/// master's offer stream without limit.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Subscription lifecycle state, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    New,
    Subscribing,
    /// SUBSCRIBED arrived; the framework id is being recorded.
    Subscribed,
    /// Consuming events.
    Running,
    Disconnected,
}

/// The scheduler's event loop.
pub struct EventLoop {
    driver: Arc<SchedulerDriver>,
    registry: Arc<TaskRegistry>,
    retry: Arc<RetryController>,
    /// Offers rescinded while queued; consumed by the next offers turn.
    rescinded: DashMap<OfferId, ()>,
    last_heartbeat: Mutex<Option<Instant>>,
    state: Mutex<LoopState>,
    subscribe_retry: Duration,
    shutdown: watch::Receiver<bool>,
}

impl EventLoop {
    pub fn new(
        driver: Arc<SchedulerDriver>,
        registry: Arc<TaskRegistry>,
        retry: Arc<RetryController>,
        cfg: &MasterConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            driver,
            registry,
            retry,
            rescinded: DashMap::new(),
            last_heartbeat: Mutex::new(None),
            state: Mutex::new(LoopState::New),
            subscribe_retry: cfg.subscribe_retry,
            shutdown,
        }
    }

    pub fn state(&self) -> LoopState {
        *self.state.lock()
    }

    fn set_state(&self, state: LoopState) {
        *self.state.lock() = state;
    }

    /// When the last heartbeat arrived, if any.
    pub fn last_heartbeat(&self) -> Option<Instant> {
        *self.last_heartbeat.lock()
    }

    /// Run until shutdown. Each pass opens a subscription, drains its
    /// events, and re-subscribes after the fixed backoff when the stream
    /// drops.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(LoopState::Subscribing);
            let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            let driver = self.driver.clone();
            let subscription = tokio::spawn(async move { driver.subscribe(tx).await });

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("Shutdown requested; draining no further events");
                            subscription.abort();
                            self.set_state(LoopState::Disconnected);
                            return Ok(());
                        }
                    }
                    event = rx.recv() => match event {
                        Some(event) => self.dispatch(event).await,
                        None => break,
                    }
                }
            }

            match subscription.await {
                Ok(Ok(())) => debug!("Subscription closed"),
                Ok(Err(e)) => warn!(error = %e, "Subscription failed"),
                Err(e) => warn!(error = %e, "Subscription task aborted"),
            }
            self.set_state(LoopState::Disconnected);
            if *shutdown.borrow() {
                break;
            }

            warn!(
                retry_secs = self.subscribe_retry.as_secs(),
                "Disconnected from master; re-subscribing"
            );
            tokio::time::sleep(self.subscribe_retry).await;
        }
        Ok(())
    }

    /// Dispatch one inbound event by type.
    pub async fn dispatch(&self, event: Event) {
        match event {
            Event::Subscribed {
                framework_id,
                heartbeat_interval_seconds,
            } => {
                self.set_state(LoopState::Subscribed);
                info!(
                    %framework_id,
                    heartbeat = ?heartbeat_interval_seconds,
                    "Subscribed"
                );
                self.driver.set_framework_id(framework_id);
                self.set_state(LoopState::Running);
            }
            Event::Offers { offers } => self.handle_offers(offers).await,
            Event::Update { status } => self.handle_update(status).await,
            Event::Rescind { offer_id } => {
                debug!(%offer_id, "Offer rescinded");
                self.rescinded.insert(offer_id, ());
            }
            Event::Message {
                agent_id,
                executor_id,
                ..
            } => debug!(%agent_id, %executor_id, "Executor message"),
            Event::Failure {
                agent_id,
                executor_id,
                status,
            } => warn!(?agent_id, ?executor_id, ?status, "Failure event"),
            Event::Error { message: reason } => error!(%reason, "Error event from master"),
            Event::Heartbeat => {
                *self.last_heartbeat.lock() = Some(Instant::now());
                trace!("Heartbeat");
            }
            Event::InverseOffers { inverse_offers } => {
                debug!(count = inverse_offers.len(), "Inverse offers")
            }
            Event::RescindInverseOffer { offer_id } => {
                debug!(%offer_id, "Inverse offer rescinded")
            }
            Event::Unknown => warn!("Unknown event type received"),
        }
    }
}

/// Periodic reconciler: snapshots the RUNNING set on every tick and asks
/// the master to re-send its view.
pub fn spawn_reconciler(
    registry: Arc<TaskRegistry>,
    driver: Arc<SchedulerDriver>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let running = match registry.get_state(TaskState::Running) {
                        Ok(tasks) => tasks,
                        Err(_) => continue,
                    };
                    let tasks: Vec<ReconcileTask> = running
                        .iter()
                        .map(|task| ReconcileTask {
                            task_id: task.task_id.clone(),
                            agent_id: task.agent_id.clone(),
                        })
                        .collect();
                    debug!(count = tasks.len(), "Periodic reconcile");
                    if let Err(e) = driver.reconcile(tasks).await {
                        warn!(error = %e, "Periodic reconcile failed");
                    }
                }
            }
        }
    })
}
