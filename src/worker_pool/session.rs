//! Injected collaborator: the backing session a `WorkerInstance` wraps.
//!
//! The worker agent's internal reasoning, tool invocation, and LLM calls are
//! out of scope (`spec.md` §1); this module only defines the seam.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;

/// Options passed to `SessionFactory::create`.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub provider_config: serde_json::Value,
    pub instructions: String,
    pub workspace_path: String,
    pub enable_diff: bool,
    pub enable_checkpoints: bool,
    pub start_task: bool,
    pub parallel_execution: bool,
    pub worker_type: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            provider_config: serde_json::Value::Null,
            instructions: String::new(),
            workspace_path: String::new(),
            enable_diff: false,
            enable_checkpoints: false,
            start_task: true,
            parallel_execution: true,
            worker_type: "worker".to_string(),
        }
    }
}

/// Lifecycle events a `Session` emits.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started,
    Completed,
    Aborted,
    ToolFailed { error: String },
}

/// A backing worker session. Implementations live entirely outside this
/// crate's scope; the core only consumes this seam.
#[async_trait]
pub trait Session: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
    fn is_aborted(&self) -> bool;
    async fn abort(&self);
    async fn dispose(&self) {}
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session creation failed: {0}")]
    CreateFailed(String),
}

/// Creates a backing worker session.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, options: SessionOptions) -> Result<Arc<dyn Session>, SessionError>;
}

/// In-memory `Session`/`SessionFactory` pair used by this crate's own test
/// suite to exercise `WorkerPool` and `Scheduler` end-to-end without a real
/// LLM-backed session implementation (out of scope per `spec.md` §1).
pub struct InProcessSession {
    events_tx: broadcast::Sender<SessionEvent>,
    aborted: AtomicBool,
}

impl InProcessSession {
    pub fn new() -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            events_tx,
            aborted: AtomicBool::new(false),
        })
    }

    pub fn emit_started(&self) {
        let _ = self.events_tx.send(SessionEvent::Started);
    }

    pub fn emit_completed(&self) {
        let _ = self.events_tx.send(SessionEvent::Completed);
    }

    pub fn emit_tool_failed(&self, error: impl Into<String>) {
        let _ = self.events_tx.send(SessionEvent::ToolFailed { error: error.into() });
    }
}

#[async_trait]
impl Session for InProcessSession {
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    async fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        let _ = self.events_tx.send(SessionEvent::Aborted);
    }
}

/// Factory producing `InProcessSession`s. A real backing session begins work
/// (and emits `Started`) only after its caller has had a chance to subscribe
/// to its event stream, so this factory hands the session back idle; the
/// caller (or, in tests, an explicit `emit_started()`) drives it from there.
pub struct InProcessSessionFactory;

#[async_trait]
impl SessionFactory for InProcessSessionFactory {
    async fn create(&self, _options: SessionOptions) -> Result<Arc<dyn Session>, SessionError> {
        Ok(InProcessSession::new())
    }
}
