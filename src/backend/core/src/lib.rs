//! # Caravel Core
//!
//! A framework scheduler for a two-level resource-offer cluster manager:
//! a master streams aggregated agent resources as offers, and the elected
//! scheduler replica binds queued tasks onto them.
//!
//! ## Architecture
//!
//! - **Event Loop**: single consumer of the master's event stream
//! - **Resource Matcher**: first-fit binding of queued tasks to offers
//! - **Task Registry**: authoritative catalog with write-through persistence
//! - **Retry Controller**: backoff-driven recovery from transient failures
//! - **Scheduler Driver**: the call surface against the master
//! - **Leader Gate**: single-writer discipline across the replica set
//! - **Admin API**: deploy / kill / update / status over HTTP

pub mod api;
pub mod config;
pub mod driver;
pub mod error;
pub mod event_loop;
pub mod ha;
pub mod matcher;
pub mod protocol;
pub mod storage;
pub mod task;
pub mod telemetry;

pub use error::{CaravelError, ErrorCode, Result};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::driver::SchedulerDriver;
    pub use crate::error::{CaravelError, ErrorCode, Result};
    pub use crate::event_loop::{EventLoop, LoopState};
    pub use crate::ha::LeaderGate;
    pub use crate::matcher::{first_fit, MatchOutcome};
    pub use crate::protocol::{Event, Offer, Resource, TaskState, TaskStatus};
    pub use crate::storage::{MemoryStorage, Storage};
    pub use crate::task::{
        ApplicationSpec, RetryController, RetryPolicy, TaskRecord, TaskRegistry, TaskSpec,
        TaskStore,
    };
}
