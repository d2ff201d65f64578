//! Scheduler driver: the call surface against the master.
//!
//! All outbound calls are fire-and-ack: issue the HTTP call, surface
//! transport errors upward, never retry here (the event loop owns
//! resubscription; the store owns its own retries). The subscription is
//! the one long-lived request: its response body is the RecordIO event
//! stream, decoded and pushed into the channel the event loop consumes.

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::MasterConfig;
use crate::error::{CaravelError, ErrorCode, Result};
use crate::protocol::{
    AgentId, Call, Event, FrameworkInfo, OfferId, Operation, ReconcileTask, RecordIoDecoder,
    TaskId,
};

/// Header carrying the master's stream identifier for a subscription.
const STREAM_ID_HEADER: &str = "X-Scheduler-Stream-Id";

// ═══════════════════════════════════════════════════════════════════════════════
// Revive Token Bucket
// ═══════════════════════════════════════════════════════════════════════════════

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: burst capacity, one token refilled per interval.
/// Acquisition never blocks; callers drop the work when empty.
pub struct TokenBucket {
    capacity: f64,
    refill_interval: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(burst: u32, refill_interval: Duration) -> Self {
        Self {
            capacity: burst as f64,
            refill_interval,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if !self.refill_interval.is_zero() {
            let refill =
                state.last_refill.elapsed().as_secs_f64() / self.refill_interval.as_secs_f64();
            if refill > 0.0 {
                state.tokens = (state.tokens + refill).min(self.capacity);
                state.last_refill = Instant::now();
            }
        }
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Driver
// ═══════════════════════════════════════════════════════════════════════════════

/// Wraps the master's bidirectional HTTP call surface.
pub struct SchedulerDriver {
    http: reqwest::Client,
    endpoint: String,
    request_timeout: Duration,
    framework: RwLock<FrameworkInfo>,
    stream_id: RwLock<Option<String>>,
    revive_tokens: TokenBucket,
}

impl SchedulerDriver {
    pub fn new(cfg: &MasterConfig, framework: FrameworkInfo) -> Result<Self> {
        // No client-level timeout: it would also bound the subscription
        // stream. Calls set their own deadline per request.
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(2)
            .build()
            .map_err(|e| {
                CaravelError::with_internal(
                    ErrorCode::ConfigurationError,
                    "Failed to build master HTTP client",
                    e.to_string(),
                )
            })?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.clone(),
            request_timeout: cfg.request_timeout,
            framework: RwLock::new(framework),
            stream_id: RwLock::new(None),
            revive_tokens: TokenBucket::new(cfg.revive_burst, cfg.revive_wait),
        })
    }

    /// Framework id assigned by the master, once subscribed.
    pub fn framework_id(&self) -> Option<String> {
        self.framework.read().id.clone()
    }

    /// Record the id from a SUBSCRIBED event; replayed on re-subscribe.
    pub fn set_framework_id(&self, id: String) {
        self.framework.write().id = Some(id);
    }

    fn require_framework_id(&self) -> Result<String> {
        self.framework_id().ok_or_else(|| {
            CaravelError::new(ErrorCode::NotSubscribed, "Not subscribed to the master")
        })
    }

    /// Open a subscription and pump decoded events into `tx`.
    ///
    /// Returns `Ok` when the stream ends or the receiver goes away, `Err`
    /// on transport failure; either way the caller re-subscribes after
    /// its backoff. The stale stream id is cleared before the SUBSCRIBE.
    pub async fn subscribe(&self, tx: mpsc::Sender<Event>) -> Result<()> {
        *self.stream_id.write() = None;

        let call = Call::Subscribe {
            framework: self.framework.read().clone(),
        };
        let response = self
            .http
            .post(&self.endpoint)
            .json(&call)
            .send()
            .await
            .map_err(|e| CaravelError::master_transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CaravelError::with_internal(
                ErrorCode::MasterResponse,
                "SUBSCRIBE rejected by master",
                format!("status {}", response.status()),
            ));
        }

        if let Some(sid) = response
            .headers()
            .get(STREAM_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.stream_id.write() = Some(sid.to_string());
        }
        info!("Subscription stream opened");

        let mut decoder = RecordIoDecoder::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| CaravelError::master_transport(e.to_string()))?;
            decoder.extend(&chunk);
            while let Some(record) = decoder.next_record()? {
                match serde_json::from_slice::<Event>(&record) {
                    Ok(event) => {
                        metrics::counter!("caravel_events_total", "type" => event.kind())
                            .increment(1);
                        if tx.send(event).await.is_err() {
                            debug!("Event consumer gone; closing subscription");
                            return Ok(());
                        }
                    }
                    Err(e) => warn!(error = %e, "Dropping undecodable event record"),
                }
            }
        }

        debug!("Subscription stream ended");
        Ok(())
    }

    async fn call(&self, call: &Call, kind: &'static str) -> Result<()> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .json(call)
            .timeout(self.request_timeout);
        if let Some(sid) = self.stream_id.read().clone() {
            request = request.header(STREAM_ID_HEADER, sid);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CaravelError::master_transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CaravelError::with_internal(
                ErrorCode::MasterResponse,
                format!("{} rejected by master", kind),
                format!("status {}", response.status()),
            ));
        }
        metrics::counter!("caravel_master_calls_total", "call" => kind).increment(1);
        Ok(())
    }

    /// Consume offers with the given operations.
    pub async fn accept(
        &self,
        offer_ids: Vec<OfferId>,
        operations: Vec<Operation>,
    ) -> Result<()> {
        let call = Call::Accept {
            framework_id: self.require_framework_id()?,
            offer_ids,
            operations,
        };
        self.call(&call, "ACCEPT").await
    }

    /// Release offers back to the master.
    pub async fn decline(&self, offer_ids: Vec<OfferId>) -> Result<()> {
        let call = Call::Decline {
            framework_id: self.require_framework_id()?,
            offer_ids,
        };
        self.call(&call, "DECLINE").await
    }

    /// Confirm receipt of a status update.
    pub async fn acknowledge(
        &self,
        agent_id: Option<AgentId>,
        task_id: TaskId,
        uuid: Option<String>,
    ) -> Result<()> {
        let call = Call::Acknowledge {
            framework_id: self.require_framework_id()?,
            agent_id,
            task_id,
            uuid,
        };
        self.call(&call, "ACKNOWLEDGE").await
    }

    /// Ask the agent to kill a task.
    pub async fn kill(&self, task_id: TaskId, agent_id: Option<AgentId>) -> Result<()> {
        let call = Call::Kill {
            framework_id: self.require_framework_id()?,
            task_id,
            agent_id,
        };
        self.call(&call, "KILL").await
    }

    /// Request fresh offers. Rate-limited: returns `Ok(false)` when the
    /// call was dropped because no token was available.
    pub async fn revive(&self) -> Result<bool> {
        if !self.revive_tokens.try_acquire() {
            debug!("Revive dropped by rate limiter");
            metrics::counter!("caravel_revives_dropped_total").increment(1);
            return Ok(false);
        }
        let call = Call::Revive {
            framework_id: self.require_framework_id()?,
        };
        self.call(&call, "REVIVE").await?;
        Ok(true)
    }

    /// Stop the flow of offers while nothing is queued.
    pub async fn suppress(&self) -> Result<()> {
        let call = Call::Suppress {
            framework_id: self.require_framework_id()?,
        };
        self.call(&call, "SUPPRESS").await
    }

    /// Ask the master to re-send current status for the given tasks.
    pub async fn reconcile(&self, tasks: Vec<ReconcileTask>) -> Result<()> {
        let call = Call::Reconcile {
            framework_id: self.require_framework_id()?,
            tasks,
        };
        self.call(&call, "RECONCILE").await
    }

    /// Send an opaque message to an executor.
    pub async fn message(
        &self,
        agent_id: AgentId,
        executor_id: String,
        data: String,
    ) -> Result<()> {
        let call = Call::Message {
            framework_id: self.require_framework_id()?,
            agent_id,
            executor_id,
            data,
        };
        self.call(&call, "MESSAGE").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_allows_burst_then_drops() {
        let bucket = TokenBucket::new(3, Duration::from_secs(60));
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn bucket_refills_one_token_per_interval() {
        let bucket = TokenBucket::new(1, Duration::from_millis(20));
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        std::thread::sleep(Duration::from_millis(30));
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn bucket_never_exceeds_capacity() {
        let bucket = TokenBucket::new(2, Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(50));
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test]
    async fn calls_require_subscription() {
        let driver =
            SchedulerDriver::new(&MasterConfig::default(), FrameworkInfo::default()).unwrap();
        let err = driver.suppress().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotSubscribed);
    }
}
