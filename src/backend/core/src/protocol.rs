//! Wire schema for the master's scheduler call surface.
//!
//! The master speaks a bidirectional protocol over HTTP: the framework
//! POSTs calls (SUBSCRIBE, ACCEPT, DECLINE, ...) and the subscription
//! response streams events back as length-prefixed records. This module
//! holds the serde model for both directions plus the incremental framing
//! decoder used by the subscription reader.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{CaravelError, ErrorCode, Result};

/// Opaque offer identifier assigned by the master.
pub type OfferId = String;

/// Opaque agent identifier assigned by the master.
pub type AgentId = String;

/// Stable task identifier assigned at admission.
pub type TaskId = String;

// ═══════════════════════════════════════════════════════════════════════════════
// Task State
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a task as reported by the master (or set locally
/// at admission and launch time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Admitted but not yet bound to an offer
    Unknown,
    /// Bound to an offer; launch issued
    Staging,
    /// Executor is starting the task
    Starting,
    /// Task is running on an agent
    Running,
    /// Kill was requested and is in progress
    Killing,
    /// Task was killed
    Killed,
    /// Task ran to completion
    Finished,
    /// Task failed on the agent
    Failed,
    /// Master lost track of the task
    Lost,
    /// Launch was dropped before reaching the agent
    Dropped,
    /// Task was invalid or could not be launched
    Error,
    /// Agent is gone and the task with it
    Gone,
    /// Agent lost contact with the master
    Unreachable,
}

impl TaskState {
    /// Terminal states remove the task from the catalog.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Killed)
    }

    /// States that hand the task to the retry controller.
    pub fn triggers_reschedule(&self) -> bool {
        matches!(self, Self::Failed | Self::Dropped | Self::Lost)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "UNKNOWN",
            Self::Staging => "STAGING",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Killing => "KILLING",
            Self::Killed => "KILLED",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Lost => "LOST",
            Self::Dropped => "DROPPED",
            Self::Error => "ERROR",
            Self::Gone => "GONE",
            Self::Unreachable => "UNREACHABLE",
        };
        write!(f, "{}", s)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resources and Offers
// ═══════════════════════════════════════════════════════════════════════════════

/// A named scalar resource (cpus, mem, disk, ...) with an optional role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl Resource {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            role: None,
        }
    }

    pub fn cpus(value: f64) -> Self {
        Self::new("cpus", value)
    }

    pub fn mem(value: f64) -> Self {
        Self::new("mem", value)
    }

    pub fn disk(value: f64) -> Self {
        Self::new("disk", value)
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// An advertisement of currently-available resources on one agent.
///
/// Offers are ephemeral: each one is either consumed by an ACCEPT or
/// released by a DECLINE within the event turn that delivered it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub agent_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

/// An inverse offer asks the framework to vacate resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InverseOffer {
    pub id: OfferId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Launch Descriptors
// ═══════════════════════════════════════════════════════════════════════════════

/// Shell command launch descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uris: Vec<String>,
}

impl CommandInfo {
    pub fn shell(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }
}

/// Custom executor launch descriptor. Mutually exclusive with
/// [`CommandInfo`] on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Resource>,
}

/// Container runtime settings for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub image: String,
    #[serde(default)]
    pub force_pull: bool,
}

/// Agent-side health probe for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub command: String,
    #[serde(default = "default_health_interval")]
    pub interval_seconds: f64,
    #[serde(default = "default_health_timeout")]
    pub timeout_seconds: f64,
    #[serde(default = "default_health_failures")]
    pub consecutive_failures: u32,
}

fn default_health_interval() -> f64 {
    10.0
}
fn default_health_timeout() -> f64 {
    5.0
}
fn default_health_failures() -> u32 {
    3
}

/// The task description shipped inside a LAUNCH operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub name: String,
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub resources: Vec<Resource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerInfo>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Framework and Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity the framework presents to the master on SUBSCRIBE.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameworkInfo {
    pub user: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub failover_timeout: f64,
    pub checkpoint: bool,
    pub role: String,
    pub hostname: String,
    pub principal: String,
}

/// A status update for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    /// Acknowledgement token; echoed back in the ACKNOWLEDGE call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

/// One task the master should re-report status for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileTask {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Calls (framework → master)
// ═══════════════════════════════════════════════════════════════════════════════

/// An offer operation carried by an ACCEPT call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Launch { task_infos: Vec<TaskInfo> },
}

/// Outbound calls. All calls except SUBSCRIBE carry the framework id
/// assigned by the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Call {
    Subscribe {
        framework: FrameworkInfo,
    },
    Accept {
        framework_id: String,
        offer_ids: Vec<OfferId>,
        operations: Vec<Operation>,
    },
    Decline {
        framework_id: String,
        offer_ids: Vec<OfferId>,
    },
    Acknowledge {
        framework_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<AgentId>,
        task_id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uuid: Option<String>,
    },
    Kill {
        framework_id: String,
        task_id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<AgentId>,
    },
    Revive {
        framework_id: String,
    },
    Suppress {
        framework_id: String,
    },
    Reconcile {
        framework_id: String,
        tasks: Vec<ReconcileTask>,
    },
    Message {
        framework_id: String,
        agent_id: AgentId,
        executor_id: String,
        data: String,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Events (master → framework)
// ═══════════════════════════════════════════════════════════════════════════════

/// Inbound events decoded off the subscription stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    Subscribed {
        framework_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        heartbeat_interval_seconds: Option<f64>,
    },
    Offers {
        offers: Vec<Offer>,
    },
    Rescind {
        offer_id: OfferId,
    },
    Update {
        status: TaskStatus,
    },
    Message {
        agent_id: AgentId,
        executor_id: String,
        data: String,
    },
    Failure {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<AgentId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        executor_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<i32>,
    },
    Error {
        message: String,
    },
    Heartbeat,
    InverseOffers {
        inverse_offers: Vec<InverseOffer>,
    },
    RescindInverseOffer {
        offer_id: OfferId,
    },
    #[serde(other)]
    Unknown,
}

impl Event {
    /// Short tag used in logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subscribed { .. } => "SUBSCRIBED",
            Self::Offers { .. } => "OFFERS",
            Self::Rescind { .. } => "RESCIND",
            Self::Update { .. } => "UPDATE",
            Self::Message { .. } => "MESSAGE",
            Self::Failure { .. } => "FAILURE",
            Self::Error { .. } => "ERROR",
            Self::Heartbeat => "HEARTBEAT",
            Self::InverseOffers { .. } => "INVERSE_OFFERS",
            Self::RescindInverseOffer { .. } => "RESCIND_INVERSE_OFFER",
            Self::Unknown => "UNKNOWN",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RecordIO Framing
// ═══════════════════════════════════════════════════════════════════════════════

/// Upper bound on a single framed record; a longer length prefix means the
/// stream is corrupt.
const MAX_RECORD_LEN: usize = 4 * 1024 * 1024;

/// Incremental decoder for the length-prefixed record stream
/// (`<decimal-length>\n<payload>` repeated).
///
/// Chunks arrive from the transport in arbitrary sizes; the decoder
/// buffers until a complete record is available.
#[derive(Debug, Default)]
pub struct RecordIoDecoder {
    buf: BytesMut,
}

impl RecordIoDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transport chunk to the internal buffer.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete record, if one is buffered.
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        let newline = match self.buf.iter().position(|&b| b == b'\n') {
            Some(pos) => pos,
            None => return Ok(None),
        };

        let len: usize = std::str::from_utf8(&self.buf[..newline])
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| {
                CaravelError::new(ErrorCode::MasterResponse, "Malformed record length prefix")
            })?;
        if len > MAX_RECORD_LEN {
            return Err(CaravelError::new(
                ErrorCode::MasterResponse,
                format!("Record length {} exceeds limit", len),
            ));
        }

        if self.buf.len() < newline + 1 + len {
            return Ok(None);
        }

        self.buf.advance(newline + 1);
        let record = self.buf.split_to(len).to_vec();
        Ok(Some(record))
    }
}

/// Frame a payload for the record stream. Used by tests and the fake
/// master they stand up.
pub fn encode_record(payload: &[u8]) -> Vec<u8> {
    let mut out = format!("{}\n", payload.len()).into_bytes();
    out.extend_from_slice(payload);
    out
}
