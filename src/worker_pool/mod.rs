//! Bounded pool that spawns, tracks, and tears down worker sessions.

mod config;
mod pool;
mod session;

pub use config::{WorkerPoolConfig, WorkerPoolConfigError};
pub use pool::{SpawnRequest, WorkerInstance, WorkerPool, WorkerPoolError, WorkerStatus};
pub use session::{
    InProcessSession, InProcessSessionFactory, Session, SessionError, SessionEvent, SessionFactory, SessionOptions,
};
