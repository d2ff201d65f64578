//! Task model: specs, persisted records, retry policies, admission.
//!
//! A [`TaskSpec`] is immutable after admission apart from the agent
//! binding filled in by the matcher. The registry persists each task as a
//! [`TaskRecord`], the `(spec, state)` pair, encoded to a
//! base64-wrapped self-describing value.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{CaravelError, ErrorCode, Result};
use crate::protocol::{
    AgentId, CommandInfo, ContainerInfo, ExecutorInfo, HealthCheck, Resource, TaskId, TaskInfo,
    TaskState,
};

pub mod registry;
pub mod retry;
pub mod store;

pub use registry::TaskRegistry;
pub use retry::RetryController;
pub use store::TaskStore;

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-task reschedule policy: exponential backoff with a retry cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum reschedule attempts before the task is failed for good
    pub max_retries: u32,
    /// Delay before the first reschedule
    #[serde(with = "humantime_serde")]
    pub base_interval: Duration,
    /// Multiplier applied per attempt
    pub backoff_factor: f64,
    /// Attempts consumed so far
    #[serde(default)]
    pub retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_interval: Duration::from_secs(5),
            backoff_factor: 2.0,
            retries: 0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt (0-indexed):
    /// `base_interval * backoff_factor^attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = self.base_interval.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        Duration::from_secs_f64(secs)
    }

    /// Whether the budget is spent.
    pub fn exhausted(&self) -> bool {
        self.retries > self.max_retries
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task Spec
// ═══════════════════════════════════════════════════════════════════════════════

/// An admitted task. `name` is the catalog key; `task_id` is the stable
/// identifier the master sees and is never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub task_id: TaskId,
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Bound agent; absent until the matcher assigns an offer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
}

impl TaskSpec {
    /// The launch descriptor shipped inside an ACCEPT. Callers must have
    /// bound an agent first.
    pub fn task_info(&self) -> TaskInfo {
        TaskInfo {
            name: self.name.clone(),
            task_id: self.task_id.clone(),
            agent_id: self.agent_id.clone().unwrap_or_default(),
            resources: self.resources.clone(),
            command: self.command.clone(),
            executor: self.executor.clone(),
            container: self.container.clone(),
            labels: self.labels.clone(),
            health_check: self.health_check.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task Record
// ═══════════════════════════════════════════════════════════════════════════════

/// The unit of persistence: one task plus its current state, stored at
/// `/tasks/<task_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub spec: TaskSpec,
    pub state: TaskState,
}

impl TaskRecord {
    pub fn new(spec: TaskSpec, state: TaskState) -> Self {
        Self { spec, state }
    }

    /// Encode to the store value format.
    pub fn encode(&self) -> Result<String> {
        let raw = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(raw))
    }

    /// Decode a store value.
    pub fn decode(value: &str) -> Result<Self> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(value)
            .map_err(|e| {
                CaravelError::with_internal(
                    ErrorCode::SerializationError,
                    "Malformed task record",
                    e.to_string(),
                )
            })?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Admission
// ═══════════════════════════════════════════════════════════════════════════════

/// The JSON payload accepted by the deploy endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "cpu")]
    pub cpus: f64,
    #[serde(default)]
    pub mem: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<f64>,
    #[serde(default, alias = "cmd", skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerInfo>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl ApplicationSpec {
    /// Validate the payload and mint a [`TaskSpec`] with a fresh task id.
    ///
    /// A name and at least one resource are required; command and executor
    /// are mutually exclusive.
    pub fn admit(self, user: &str) -> Result<TaskSpec> {
        if self.name.trim().is_empty() {
            return Err(CaravelError::new(
                ErrorCode::MissingName,
                "A name is required for the application",
            ));
        }
        if self.cpus <= 0.0 && self.mem <= 0.0 {
            return Err(CaravelError::new(
                ErrorCode::MissingResources,
                "Application requested with no resources",
            ));
        }
        if self.command.is_some() && self.executor.is_some() {
            return Err(CaravelError::new(
                ErrorCode::ConflictingLaunchDescriptor,
                "Command and executor are mutually exclusive",
            ));
        }
        if self.command.is_none() && self.executor.is_none() {
            return Err(CaravelError::new(
                ErrorCode::ValidationError,
                "Either a command or an executor is required",
            ));
        }

        let mut resources = Vec::new();
        if self.cpus > 0.0 {
            resources.push(Resource::cpus(self.cpus));
        }
        if self.mem > 0.0 {
            resources.push(Resource::mem(self.mem));
        }
        if let Some(disk) = self.disk {
            if disk > 0.0 {
                resources.push(Resource::disk(disk));
            }
        }

        let command = self.command.map(|value| CommandInfo {
            value,
            user: Some(user.to_string()),
            ..Default::default()
        });

        Ok(TaskSpec {
            name: self.name,
            task_id: Uuid::new_v4().to_string(),
            resources,
            command,
            executor: self.executor,
            container: self.container,
            labels: self.labels,
            health_check: self.health_check,
            retry_policy: self.retry_policy,
            agent_id: None,
        })
    }
}
