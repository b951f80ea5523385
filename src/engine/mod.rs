//! Execution engine: worker scheduler, handler registry, and the background
//! loops (heartbeat, TTL sweeper, lease supervisor).

mod heartbeat;
pub mod registry;
pub mod scheduler;
pub mod supervisor;
pub mod sweeper;

pub use registry::{
    HandlerRegistry, Heartbeat, HeartbeatCallback, Registration, ResultCallback, TaskHandler,
};
pub use scheduler::{SchedulerConfig, WorkerScheduler};
pub use supervisor::LeaseSupervisor;
pub use sweeper::ExpirySweeper;

use std::time::Duration;

/// Floor for background loop intervals; a zero interval would hammer storage.
pub(crate) const MIN_LOOP_INTERVAL: Duration = Duration::from_millis(10);
