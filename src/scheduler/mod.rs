//! Drives a task DAG to completion: readiness, dispatch, RPM bookkeeping,
//! lifecycle events.

mod config;
mod core;
mod events;

pub use config::{SchedulerConfig, StrategyKind};
pub use core::{Scheduler, SchedulerError};
pub use events::SchedulerEvent;
