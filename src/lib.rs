//! taskcore - Parallel execution core for a multi-agent coordinator
//!
//! taskcore drives a DAG of tasks to completion across a bounded pool of
//! worker sessions, coordinating dispatch, rate limiting, workspace
//! isolation, and peer code review over a local message channel.
//!
//! # Modules
//!
//! - [`task_graph`] - DAG construction, readiness, critical path, scheduling strategies
//! - [`scheduler`] - Drives the graph to completion over a worker pool
//! - [`worker_pool`] - Bounded pool of spawned worker sessions
//! - [`message_channel`] - Newline-delimited JSON over local TCP
//! - [`rate_limiter`] - Per-provider requests-per-minute tracking
//! - [`workspace_validator`] - Pre-flight workspace conflict detection
//! - [`review_coordinator`] - Asynchronous review request/response protocol
//! - [`spawn_tool`] - Validates the outer agent's spawn tool call
//! - [`config`] - Root configuration types and loading
//! - [`error`] - Top-level error aggregation

pub mod config;
pub mod error;
pub mod message_channel;
pub mod rate_limiter;
pub mod review_coordinator;
pub mod scheduler;
pub mod spawn_tool;
pub mod task_graph;
pub mod worker_pool;
pub mod workspace_validator;

pub use config::Config;
pub use error::CoreError;
pub use message_channel::{ChannelEvent, Message, MessageChannelConfig, MessageClient, MessageServer, MessageType};
pub use rate_limiter::{ProviderLimit, RateLimiter, RateLimiterEvent};
pub use review_coordinator::{ReviewCoordinator, ReviewCoordinatorError, ReviewOutcome, ReviewRequest};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerError, SchedulerEvent, StrategyKind};
pub use task_graph::{CriticalPath, MaxParallel, RateAware, SchedulingStrategy, TaskGraph, TaskGraphError, TaskSpec, TaskState};
pub use worker_pool::{SpawnRequest, WorkerInstance, WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerStatus};
pub use workspace_validator::{ValidationResult, WorkspaceValidator, WorkspaceValidatorConfig, WorkspaceValidatorError};
